//! # Image fetcher
//!
//! The public entry point: `fetch(url)` answers from the cache when it can and
//! otherwise downloads, transforms and stores the image before delivering it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheKey, DiskMemCacheStore, StoreOptions};
use crate::config::PixcacheConfig;
use crate::delivery::Dispatcher;
use crate::download::{DownloadCoordinator, DownloadHandle};
use crate::error::{FetchError, Result};
use crate::http::{
    HttpExecutor, HttpManager, HttpResult, ProgressFn, ReqwestTransport, RequestHooks,
    ResponseCache, Transport, create_client,
};
use crate::pool::{Priority, PriorityPool};
use crate::sync::GuardedState;
use crate::transform::{ImageTransform, SharedTransform, image_cost};

/// Per-fetch options.
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub priority: Priority,
    /// Applied to downloaded bytes before they are cached; cache hits are returned as stored
    pub transform: Option<SharedTransform>,
    pub on_progress: Option<ProgressFn>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn transform(mut self, transform: impl ImageTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(u64, Option<u64>, &Url) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("priority", &self.priority)
            .field("transform", &self.transform)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Bytes delivered by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Bytes,
    /// Served by the memory or disk tier without touching the network
    pub from_cache: bool,
}

pub type FetchCallback = Box<dyn FnOnce(Result<FetchedImage>) + Send + 'static>;

/// Identifies one call to [`ImageFetcher::fetch`].
#[derive(Debug, Clone)]
pub struct FetchTicket {
    id: u64,
    key: CacheKey,
    cancelled: Arc<AtomicBool>,
}

impl FetchTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct OutstandingFetch {
    ticket: FetchTicket,
    download: Option<DownloadHandle>,
}

struct FetcherInner {
    store: DiskMemCacheStore,
    coordinator: DownloadCoordinator,
    http: HttpManager,
    dispatcher: Dispatcher,
    runtime: Handle,
    outstanding: GuardedState<HashMap<u64, OutstandingFetch>>,
    /// Ticket of the most recently started download per key. Only that ticket
    /// may write its result through to the store.
    writers: GuardedState<HashMap<CacheKey, u64>>,
    next_ticket: AtomicU64,
}

/// Fetch-through image cache.
#[derive(Clone)]
pub struct ImageFetcher {
    inner: Arc<FetcherInner>,
}

impl ImageFetcher {
    /// Build a fetcher with the reqwest transport and a spawned delivery task.
    pub async fn open(config: PixcacheConfig) -> Result<Self> {
        let client = create_client(&config.http)?;
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(client));
        Self::open_with(config, transport, Dispatcher::spawn()).await
    }

    /// Build a fetcher around a caller-supplied transport and delivery context.
    pub async fn open_with(
        config: PixcacheConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let store =
            DiskMemCacheStore::open(StoreOptions::from(&config).with_cost_fn(Arc::new(image_cost)))
                .await?;

        let mut executor = HttpExecutor::new(
            transport,
            PriorityPool::new("http", config.http_concurrency),
            dispatcher.clone(),
        )
        .with_timeout(config.http.timeout);
        if let Some(dir) = config.response_cache_dir() {
            executor = executor.with_response_cache(Arc::new(ResponseCache::open(dir).await?));
        }

        let coordinator = DownloadCoordinator::new(
            executor.clone(),
            PriorityPool::new("image", config.image_download_concurrency),
        );

        Ok(Self {
            inner: Arc::new(FetcherInner {
                store,
                coordinator,
                http: HttpManager::new(executor),
                dispatcher,
                runtime: Handle::current(),
                outstanding: GuardedState::new(HashMap::new()),
                writers: GuardedState::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
            }),
        })
    }

    pub fn store(&self) -> &DiskMemCacheStore {
        &self.inner.store
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.inner.coordinator
    }

    /// Generic HTTP requests sharing this fetcher's transport and delivery context.
    pub fn http(&self) -> &HttpManager {
        &self.inner.http
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Fetch `url`, delivering the outcome to `on_result` on the delivery context.
    ///
    /// A cancelled or superseded fetch never calls `on_result`.
    pub fn fetch(
        &self,
        url: &str,
        options: FetchOptions,
        on_result: impl FnOnce(Result<FetchedImage>) + Send + 'static,
    ) -> FetchTicket {
        let on_result: FetchCallback = Box::new(on_result);
        let parsed = Url::parse(url);
        let key = match &parsed {
            Ok(url) => CacheKey::from_url(url.as_str()),
            Err(_) => CacheKey::from_url(url),
        };
        let ticket = self.inner.register(key);

        match parsed {
            Ok(url) => {
                let inner = Arc::clone(&self.inner);
                let task_ticket = ticket.clone();
                self.inner.runtime.spawn(async move {
                    inner.run_fetch(task_ticket, url, options, on_result).await;
                });
            }
            Err(e) => self.inner.finish(&ticket, Err(e.into()), on_result),
        }

        ticket
    }

    /// Fetch and await the outcome. Dropping the future cancels the fetch; a
    /// cancelled or superseded fetch resolves to [`FetchError::Cancelled`].
    pub async fn fetch_async(&self, url: &str, options: FetchOptions) -> Result<FetchedImage> {
        let (tx, rx) = oneshot::channel();
        let ticket = self.fetch(url, options, move |result| {
            let _ = tx.send(result);
        });

        let mut guard = CancelOnDrop {
            fetcher: self,
            ticket: Some(ticket),
        };
        let result = rx.await.unwrap_or(Err(FetchError::Cancelled));
        guard.ticket = None;
        result
    }

    /// Warm the cache for `urls` at low priority without observing the results.
    pub fn prefetch<I, S>(&self, urls: I) -> Vec<FetchTicket>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        urls.into_iter()
            .map(|url| {
                self.fetch(
                    url.as_ref(),
                    FetchOptions::new().priority(Priority::Low),
                    |_| {},
                )
            })
            .collect()
    }

    /// Cancel every outstanding fetch of `url`. Returns how many were cancelled.
    pub fn cancel(&self, url: &str) -> usize {
        let key = match Url::parse(url) {
            Ok(url) => CacheKey::from_url(url.as_str()),
            Err(_) => CacheKey::from_url(url),
        };
        let cancelled = self.inner.outstanding.write(|outstanding| {
            let ids: Vec<u64> = outstanding
                .iter()
                .filter(|(_, fetch)| fetch.ticket.key == key)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| outstanding.remove(&id))
                .collect::<Vec<_>>()
        });

        for fetch in &cancelled {
            self.inner.abort(fetch);
        }
        if !cancelled.is_empty() {
            debug!(%key, count = cancelled.len(), "Cancelled fetches");
        }
        cancelled.len()
    }

    pub fn cancel_ticket(&self, ticket: &FetchTicket) {
        let removed = self
            .inner
            .outstanding
            .write(|outstanding| outstanding.remove(&ticket.id));
        match removed {
            Some(fetch) => self.inner.abort(&fetch),
            None => ticket.cancelled.store(true, Ordering::Release),
        }
    }

    /// Fetches that have not delivered yet.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.read(|o| o.len())
    }
}

impl fmt::Debug for ImageFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageFetcher")
            .field("store", &self.inner.store)
            .field("coordinator", &self.inner.coordinator)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

struct CancelOnDrop<'a> {
    fetcher: &'a ImageFetcher,
    ticket: Option<FetchTicket>,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.fetcher.cancel_ticket(&ticket);
        }
    }
}

/// Drops a fetch from the outstanding set on paths that never deliver, and
/// gives up its write-through claim.
struct Retire {
    inner: Arc<FetcherInner>,
    key: CacheKey,
    id: u64,
}

impl Drop for Retire {
    fn drop(&mut self) {
        self.inner.outstanding.write(|outstanding| {
            outstanding.remove(&self.id);
        });
        self.inner.writers.write(|writers| {
            if writers.get(&self.key) == Some(&self.id) {
                writers.remove(&self.key);
            }
        });
    }
}

impl FetcherInner {
    fn register(&self, key: CacheKey) -> FetchTicket {
        let ticket = FetchTicket {
            id: self.next_ticket.fetch_add(1, Ordering::Relaxed),
            key,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        self.outstanding.write(|outstanding| {
            outstanding.insert(
                ticket.id,
                OutstandingFetch {
                    ticket: ticket.clone(),
                    download: None,
                },
            )
        });
        ticket
    }

    fn abort(&self, fetch: &OutstandingFetch) {
        fetch.ticket.cancelled.store(true, Ordering::Release);
        if let Some(download) = &fetch.download {
            self.coordinator.cancel(download);
        }
    }

    async fn run_fetch(
        self: Arc<Self>,
        ticket: FetchTicket,
        url: Url,
        options: FetchOptions,
        on_result: FetchCallback,
    ) {
        let key = ticket.key.clone();

        if let Some(bytes) = self.store.get(&key).await {
            debug!(%key, "Serving from cache");
            let image = FetchedImage {
                bytes,
                from_cache: true,
            };
            self.finish(&ticket, Ok(image), on_result);
            return;
        }

        if ticket.is_cancelled() {
            return;
        }

        let FetchOptions {
            priority,
            transform,
            on_progress,
        } = options;

        let on_complete = {
            let inner = Arc::clone(&self);
            let ticket = ticket.clone();
            // dropped unused when the download is superseded or cancelled
            let retire = Retire {
                inner: Arc::clone(&self),
                key: key.clone(),
                id: ticket.id,
            };
            move |result: HttpResult| match result {
                Ok(response) => {
                    let runtime = inner.runtime.clone();
                    runtime.spawn(inner.store_download(
                        ticket,
                        response.body,
                        transform,
                        on_result,
                        retire,
                    ));
                }
                Err(e) => inner.finish(&ticket, Err(e), on_result),
            }
        };

        let hooks = RequestHooks {
            on_complete: Some(Box::new(on_complete)),
            on_cached: None,
            on_progress,
        };
        self.writers.write(|writers| writers.insert(key.clone(), ticket.id));
        let download = self.coordinator.start(key, url, priority, hooks);

        let attached = self.outstanding.write(|outstanding| {
            match outstanding.get_mut(&ticket.id) {
                Some(fetch) => {
                    fetch.download = Some(download.clone());
                    true
                }
                None => false,
            }
        });
        // cancelled between the cache lookup and the start
        if !attached && ticket.is_cancelled() {
            self.coordinator.cancel(&download);
        }
    }

    async fn store_download(
        self: Arc<Self>,
        ticket: FetchTicket,
        body: Bytes,
        transform: Option<SharedTransform>,
        on_result: FetchCallback,
        _retire: Retire,
    ) {
        let bytes = match transform {
            Some(transform) => {
                let applied = tokio::task::spawn_blocking(move || transform.apply(body)).await;
                match applied {
                    Ok(Ok(bytes)) => bytes,
                    Ok(Err(e)) => return self.finish(&ticket, Err(e), on_result),
                    Err(e) => return self.finish(&ticket, Err(e.into()), on_result),
                }
            }
            None => body,
        };

        if ticket.is_cancelled() {
            return;
        }

        // A newer download for the key may have started while the transform ran.
        // The put stays under the claim lock so it cannot land after the newer one.
        let stored = self.writers.read(|writers| {
            let current = writers.get(&ticket.key) == Some(&ticket.id);
            if current {
                // Disk failures are logged by the store and never fail the fetch.
                let _ = self.store.put(ticket.key.clone(), bytes.clone());
            }
            current
        });
        if !stored {
            debug!(key = %ticket.key, ticket = ticket.id, "Dropping superseded download result");
            return;
        }

        let image = FetchedImage {
            bytes,
            from_cache: false,
        };
        self.finish(&ticket, Ok(image), on_result);
    }

    /// Retire `ticket` and deliver `result` unless it was cancelled.
    fn finish(&self, ticket: &FetchTicket, result: Result<FetchedImage>, on_result: FetchCallback) {
        self.outstanding
            .write(|outstanding| outstanding.remove(&ticket.id));

        if ticket.is_cancelled() {
            return;
        }
        if let Err(e) = &result {
            warn!(key = %ticket.key, error = %e, "Fetch failed");
        }
        let cancelled = Arc::clone(&ticket.cancelled);
        self.dispatcher.dispatch(move || {
            if !cancelled.load(Ordering::Acquire) {
                on_result(result);
            }
        });
    }
}
