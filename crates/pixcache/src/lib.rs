//! # Pixcache
//!
//! A fetch-through cache for remote images. Given a URL it returns previously
//! fetched bytes from memory or disk, and otherwise downloads, optionally
//! transforms, persists and delivers them.
//!
//! ## Features
//!
//! - Two-tier cache: a count and cost bounded memory tier over a content-addressed
//!   disk tier with age and size based eviction
//! - Per-key supersession of in-flight downloads
//! - Bounded priority pools for image downloads and generic HTTP requests
//! - Response caching, progress reporting and cooperative cancellation
//! - All callbacks delivered in order on one delivery context
//!
//! ## Example
//!
//! ```no_run
//! use pixcache_engine::{FetchOptions, ImageFetcher, PixcacheConfig};
//!
//! # async fn run() -> pixcache_engine::Result<()> {
//! let fetcher = ImageFetcher::open(PixcacheConfig::default()).await?;
//! let image = fetcher
//!     .fetch_async("https://example.com/cat.png", FetchOptions::new())
//!     .await?;
//! println!("{} bytes, cached: {}", image.bytes.len(), image.from_cache);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod download;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod pool;
pub mod sync;
pub mod transform;

pub use builder::PixcacheConfigBuilder;
pub use cache::{CacheEntry, CacheKey, DiskMemCacheStore, PendingWrite, StoreOptions, SweepReport};
pub use config::{HttpConfig, PixcacheConfig};
pub use delivery::{DeliveryQueue, Dispatcher};
pub use download::{DownloadCoordinator, DownloadHandle};
pub use error::{FetchError, Result};
pub use fetcher::{FetchOptions, FetchTicket, FetchedImage, ImageFetcher};
pub use http::{HttpExecutor, HttpManager, HttpRequestSpec, RequestHandle, RequestHooks};
pub use pool::{Priority, PriorityPool};
pub use sync::GuardedState;
pub use transform::{CropTransform, ImageTransform};
