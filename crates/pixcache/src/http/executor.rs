//! # HTTP executor
//!
//! Runs one [`HttpRequestSpec`] end to end: pool admission, optional replay of a
//! cached response, the transport exchange, status validation and response
//! caching. Results and progress are delivered through the [`Dispatcher`].
//!
//! Cancellation is cooperative. Cancelling a [`RequestHandle`] aborts the
//! transport future at its next suspension point, and every delivery re-checks the
//! handle both when it is posted and when it runs, so no callback is observed
//! after the cancellation is.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use super::request::{HttpMethod, HttpRequestSpec};
use super::response_cache::ResponseCache;
use super::transport::{RequestBody, Transport, TransportRequest, TransportResponse};
use crate::delivery::Dispatcher;
use crate::error::FetchError;
use crate::pool::{Priority, PriorityPool};

pub type HttpResult = Result<HttpResponse, FetchError>;

pub type CompletionFn = Box<dyn FnOnce(HttpResult) + Send + 'static>;
pub type CachedFn = Box<dyn FnOnce(Bytes) + Send + 'static>;
/// `(bytes_received, bytes_expected, url)`
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>, &Url) + Send + Sync + 'static>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Successful response: the body plus the metadata callers commonly need.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub final_url: Url,
    pub body: Bytes,
}

impl From<TransportResponse> for HttpResponse {
    fn from(response: TransportResponse) -> Self {
        Self {
            status: response.status,
            content_type: response.content_type,
            content_length: response.content_length,
            final_url: response.final_url,
            body: response.body,
        }
    }
}

/// Callbacks for one request. All of them run on the delivery context.
#[derive(Default)]
pub struct RequestHooks {
    pub on_complete: Option<CompletionFn>,
    /// Receives a previously stored response before the live one arrives (GET only)
    pub on_cached: Option<CachedFn>,
    pub on_progress: Option<ProgressFn>,
}

impl RequestHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_complete(mut self, f: impl FnOnce(HttpResult) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_cached(mut self, f: impl FnOnce(Bytes) + Send + 'static) -> Self {
        self.on_cached = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(u64, Option<u64>, &Url) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for RequestHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHooks")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_cached", &self.on_cached.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Handle to a submitted request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: u64,
    token: CancellationToken,
}

impl RequestHandle {
    fn new() -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Executes HTTP requests inside a bounded priority pool.
#[derive(Clone)]
pub struct HttpExecutor {
    transport: Arc<dyn Transport>,
    pool: PriorityPool,
    dispatcher: Dispatcher,
    response_cache: Option<Arc<ResponseCache>>,
    timeout: Option<Duration>,
}

impl HttpExecutor {
    pub fn new(transport: Arc<dyn Transport>, pool: PriorityPool, dispatcher: Dispatcher) -> Self {
        Self {
            transport,
            pool,
            dispatcher,
            response_cache: None,
            timeout: None,
        }
    }

    pub fn with_response_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.response_cache = Some(cache);
        self
    }

    /// Bound each exchange independently of the transport's own timeout.
    /// Expiry is reported as a transport error.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn pool(&self) -> &PriorityPool {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn response_cache(&self) -> Option<&Arc<ResponseCache>> {
        self.response_cache.as_ref()
    }

    /// Submit a request to the executor's own pool at normal priority.
    pub fn execute(&self, spec: HttpRequestSpec, hooks: RequestHooks) -> RequestHandle {
        let pool = self.pool.clone();
        self.execute_in(&pool, Priority::Normal, spec, hooks)
    }

    /// Submit a request to a caller-supplied pool.
    pub fn execute_in(
        &self,
        pool: &PriorityPool,
        priority: Priority,
        spec: HttpRequestSpec,
        hooks: RequestHooks,
    ) -> RequestHandle {
        let handle = RequestHandle::new();
        let this = self.clone();
        let pool = pool.clone();
        let task_handle = handle.clone();

        tokio::spawn(async move {
            let RequestHooks {
                on_complete,
                on_cached,
                on_progress,
            } = hooks;

            let result = this
                .run(&pool, priority, spec, on_cached, on_progress, &task_handle)
                .await;

            if let Err(FetchError::Cancelled) = result {
                debug!(request_id = task_handle.id, "Request cancelled");
                return;
            }
            if let Some(on_complete) = on_complete {
                this.deliver(&task_handle, move || on_complete(result));
            }
        });

        handle
    }

    /// Run a request and await its result. Dropping the future cancels the request.
    ///
    /// `on_complete`, when set, is still delivered on the delivery context.
    pub async fn execute_async(&self, spec: HttpRequestSpec, hooks: RequestHooks) -> HttpResult {
        let handle = RequestHandle::new();
        let cancel_on_drop = handle.token.clone().drop_guard();
        let RequestHooks {
            on_complete,
            on_cached,
            on_progress,
        } = hooks;

        let result = self
            .run(&self.pool, Priority::Normal, spec, on_cached, on_progress, &handle)
            .await;
        let _ = cancel_on_drop.disarm();

        if let Some(on_complete) = on_complete {
            if !result.as_ref().is_err_and(FetchError::is_cancelled) {
                let delivered = result.clone();
                self.deliver(&handle, move || on_complete(delivered));
            }
        }
        result
    }

    pub fn cancel(&self, handle: &RequestHandle) {
        debug!(request_id = handle.id, "Cancelling request");
        handle.cancel();
    }

    async fn run(
        &self,
        pool: &PriorityPool,
        priority: Priority,
        spec: HttpRequestSpec,
        on_cached: Option<CachedFn>,
        on_progress: Option<ProgressFn>,
        handle: &RequestHandle,
    ) -> HttpResult {
        let response_cache = match spec.method {
            HttpMethod::Get => self.response_cache.clone(),
            _ => None,
        };
        let store_response = on_cached.is_some() || spec.store_response;
        let canonical_key = spec.canonical_key();

        if let (Some(cache), Some(on_cached)) = (&response_cache, on_cached) {
            if let Some(data) = cache.load(&canonical_key).await {
                debug!(key = %canonical_key, size = data.len(), "Replaying cached response");
                self.deliver(handle, move || on_cached(data));
            }
        }

        let request = build_transport_request(&spec);
        let url = request.url.clone();
        debug!(request_id = handle.id, method = %spec.method, url = %url, "Executing request");

        let exchange = async {
            let _permit = pool.acquire(priority).await;
            trace!(request_id = handle.id, pool = pool.name(), "Admitted");

            let report = |received: u64, expected: Option<u64>| {
                if let Some(on_progress) = &on_progress {
                    let on_progress = Arc::clone(on_progress);
                    let url = url.clone();
                    self.deliver(handle, move || on_progress(received, expected, &url));
                }
            };

            let send = self.transport.send(request, &report);
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, send).await.unwrap_or_else(|_| {
                    Err(FetchError::Transport(format!(
                        "request timed out after {limit:?}"
                    )))
                }),
                None => send.await,
            }
        };

        let response = tokio::select! {
            biased;
            _ = handle.token.cancelled() => return Err(FetchError::Cancelled),
            response = exchange => response?,
        };

        if handle.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        if response.status != 200 {
            debug!(request_id = handle.id, status = response.status, url = %url, "Request failed");
            return Err(FetchError::HttpStatus {
                status: response.status,
                body: describe_body(&response.body),
            });
        }

        if store_response {
            if let Some(cache) = &response_cache {
                if let Err(e) = cache.save(&canonical_key, &response.body).await {
                    warn!(key = %canonical_key, error = %e, "Failed to store response");
                }
            }
        }

        Ok(response.into())
    }

    /// Post `job` to the delivery context unless the request has been cancelled.
    fn deliver(&self, handle: &RequestHandle, job: impl FnOnce() + Send + 'static) {
        if handle.is_cancelled() {
            return;
        }
        let token = handle.token.clone();
        self.dispatcher.dispatch(move || {
            if !token.is_cancelled() {
                job();
            }
        });
    }
}

impl fmt::Debug for HttpExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExecutor")
            .field("pool", &self.pool)
            .field("response_cache", &self.response_cache)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn build_transport_request(spec: &HttpRequestSpec) -> TransportRequest {
    let (method, body) = match &spec.method {
        HttpMethod::Get => (Method::GET, RequestBody::Empty),
        HttpMethod::Put => (Method::PUT, RequestBody::Empty),
        HttpMethod::Delete => (Method::DELETE, RequestBody::Empty),
        HttpMethod::Post { content_type, body } => (
            Method::POST,
            RequestBody::Bytes {
                content_type: content_type.mime(),
                data: body
                    .clone()
                    .unwrap_or_else(|| Bytes::from(spec.encoded_params())),
            },
        ),
        HttpMethod::Upload { file_name, data } => (
            Method::POST,
            RequestBody::Multipart {
                fields: spec
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                file_name: file_name.clone(),
                data: data.clone(),
            },
        ),
    };

    TransportRequest {
        method,
        url: spec.request_url(),
        headers: spec.headers.clone(),
        body,
    }
}

/// Failure detail for a non-200 response: compact JSON if the body parses as
/// JSON, otherwise the body as UTF-8 text.
fn describe_body(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        return Some(value.to_string());
    }
    std::str::from_utf8(body).ok().map(str::to_owned)
}
