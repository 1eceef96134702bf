//! # Download coordinator
//!
//! Maps cache misses to network fetches. Each start installs a fresh token for
//! its key, replacing whatever request was registered before; when a request
//! completes, its result is delivered only if its token is still the registered
//! one. Older requests for the same key keep running but their results are
//! dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;
use url::Url;

use crate::cache::CacheKey;
use crate::http::{
    HttpExecutor, HttpMethod, HttpRequestSpec, HttpResult, ProgressFn, RequestHandle, RequestHooks,
};
use crate::pool::{Priority, PriorityPool};
use crate::sync::GuardedState;

/// Handle to one started download.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    key: CacheKey,
    token: u64,
    priority: Priority,
    request: RequestHandle,
    cancelled: Arc<AtomicBool>,
}

impl DownloadHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct CoordinatorInner {
    executor: HttpExecutor,
    pool: PriorityPool,
    /// Most recently started token per key.
    registry: GuardedState<HashMap<CacheKey, u64>>,
    next_token: AtomicU64,
}

impl CoordinatorInner {
    fn is_current(&self, key: &CacheKey, token: u64) -> bool {
        self.registry.read(|r| r.get(key) == Some(&token))
    }

    /// Remove the registry entry if it still belongs to `token`.
    fn clear_if_current(&self, key: &CacheKey, token: u64) -> bool {
        self.registry.write(|r| {
            if r.get(key) == Some(&token) {
                r.remove(key);
                true
            } else {
                false
            }
        })
    }
}

/// Starts image downloads in a dedicated pool and enforces per-key supersession.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DownloadCoordinator {
    pub fn new(executor: HttpExecutor, pool: PriorityPool) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                executor,
                pool,
                registry: GuardedState::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Start a GET for `url` under `key`, superseding any earlier request for the key.
    ///
    /// `hooks.on_complete` and `hooks.on_progress` only fire while this request is
    /// the registered one for its key and has not been cancelled. `on_cached` is
    /// ignored.
    pub fn start(
        &self,
        key: CacheKey,
        url: Url,
        priority: Priority,
        hooks: RequestHooks,
    ) -> DownloadHandle {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .inner
            .registry
            .write(|r| r.insert(key.clone(), token));
        if let Some(previous) = previous {
            debug!(%key, previous, token, "Superseding in-flight download");
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let RequestHooks {
            on_complete,
            on_progress,
            ..
        } = hooks;

        let on_progress = on_progress.map(|on_progress| {
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            let cancelled = Arc::clone(&cancelled);
            let filtered: ProgressFn = Arc::new(move |received: u64, expected: Option<u64>, url: &Url| {
                if !cancelled.load(Ordering::Acquire) && inner.is_current(&key, token) {
                    on_progress(received, expected, url);
                }
            });
            filtered
        });

        let request_hooks = {
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            let cancelled = Arc::clone(&cancelled);
            RequestHooks {
                on_complete: Some(Box::new(move |result: HttpResult| {
                    if cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    if !inner.clear_if_current(&key, token) {
                        debug!(%key, token, "Dropping result of superseded download");
                        return;
                    }
                    if let Some(on_complete) = on_complete {
                        on_complete(result);
                    }
                })),
                on_cached: None,
                on_progress,
            }
        };

        debug!(%key, token, ?priority, url = %url, "Starting download");
        let spec = HttpRequestSpec::new(HttpMethod::Get, url);
        let request = self
            .inner
            .executor
            .execute_in(&self.inner.pool, priority, spec, request_hooks);

        DownloadHandle {
            key,
            token,
            priority,
            request,
            cancelled,
        }
    }

    /// Cancel a download. Its completion will never be invoked.
    pub fn cancel(&self, handle: &DownloadHandle) {
        handle.cancelled.store(true, Ordering::Release);
        self.inner.executor.cancel(&handle.request);
        if self.inner.clear_if_current(&handle.key, handle.token) {
            debug!(key = %handle.key, token = handle.token, "Cancelled download");
        }
    }

    /// Whether `handle` is still the live request for its key.
    pub fn is_active(&self, handle: &DownloadHandle) -> bool {
        !handle.is_cancelled() && self.inner.is_current(&handle.key, handle.token)
    }

    /// Number of keys with a registered request.
    pub fn in_flight(&self) -> usize {
        self.inner.registry.read(|r| r.len())
    }

    pub fn pool(&self) -> &PriorityPool {
        &self.inner.pool
    }

    pub fn executor(&self) -> &HttpExecutor {
        &self.inner.executor
    }
}

impl fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("pool", &self.inner.pool)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
