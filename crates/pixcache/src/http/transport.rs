//! The primitive that performs one HTTP exchange.
//!
//! Everything above this trait (pooling, caching, cancellation, delivery) is
//! transport-agnostic, which lets tests drive the executor with a scripted
//! in-process implementation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use reqwest::{Client, Method};
use url::Url;

use crate::error::Result;

/// Upper bound for pre-allocating a body buffer from `Content-Length`.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

/// Called after every received chunk with `(bytes_received, bytes_expected)`.
pub type ChunkCallback<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Bytes {
        content_type: &'static str,
        data: Bytes,
    },
    Multipart {
        fields: Vec<(String, String)>,
        file_name: String,
        data: Bytes,
    },
}

/// A fully resolved request, ready to put on the wire.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

/// Raw outcome of an exchange. Any status is a transport success.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub final_url: Url,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        request: TransportRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<TransportResponse>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<TransportResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes { content_type, data } => builder
                .header(CONTENT_TYPE, content_type)
                .header(ACCEPT, "application/json")
                .body(data),
            RequestBody::Multipart {
                fields,
                file_name,
                data,
            } => {
                let mut form = reqwest::multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name, value);
                }
                let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(file_name);
                builder.multipart(form.part("file", part))
            }
        };

        let mut response = builder.send().await?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let final_url = response.url().clone();

        let capacity = content_length.unwrap_or(0).min(MAX_PREALLOC) as usize;
        let mut body = BytesMut::with_capacity(capacity);
        let mut received = 0u64;
        while let Some(chunk) = response.chunk().await? {
            received += chunk.len() as u64;
            body.extend_from_slice(&chunk);
            on_chunk(received, content_length);
        }

        Ok(TransportResponse {
            status,
            content_type,
            content_length,
            final_url,
            body: body.freeze(),
        })
    }
}
