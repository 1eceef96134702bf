//! # HTTP execution layer
//!
//! Request descriptions, the transport seam, the reqwest-backed client, the
//! response cache and the executor that ties them together.

mod client;
mod executor;
mod manager;
mod request;
mod response_cache;
mod transport;

pub use client::{ProxyAuth, ProxyConfig, ProxyType, create_client};
pub use executor::{
    CachedFn, CompletionFn, HttpExecutor, HttpResponse, HttpResult, ProgressFn, RequestHandle,
    RequestHooks,
};
pub use manager::{HttpManager, Params, decode_json};
pub use request::{HttpMethod, HttpRequestSpec, PostContentType};
pub use response_cache::ResponseCache;
pub use transport::{
    ChunkCallback, RequestBody, ReqwestTransport, Transport, TransportRequest, TransportResponse,
};
