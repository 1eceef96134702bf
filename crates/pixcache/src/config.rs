use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::http::ProxyConfig;

const DEFAULT_USER_AGENT: &str = concat!("pixcache/", env!("CARGO_PKG_VERSION"));

/// 60 days.
pub const DEFAULT_MAX_CACHE_AGE: Duration = Duration::from_secs(60 * 24 * 60 * 60);
/// 500 MB.
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 500 * 1024 * 1024;
pub const DEFAULT_MEMORY_COUNT_LIMIT: usize = 1000;
/// 1000 MB worth of cost units (decoded pixels for images).
pub const DEFAULT_MEMORY_COST_LIMIT: u64 = 1000 * 1024 * 1024;
pub const DEFAULT_IMAGE_DOWNLOAD_CONCURRENCY: usize = 50;
pub const DEFAULT_HTTP_CONCURRENCY: usize = 5;

/// Name of the directory under the cache root used by the HTTP response cache.
pub const RESPONSE_CACHE_DIR_NAME: &str = "http";

/// Configuration for the image cache, the download pools and the HTTP layer.
#[derive(Debug, Clone)]
pub struct PixcacheConfig {
    /// Root directory of the disk tier
    pub cache_dir: PathBuf,

    /// Entries last written longer ago than this are removed by the age sweep
    pub max_cache_age: Duration,

    /// Tracked disk size above which the size sweep runs
    pub max_cache_size: u64,

    /// Maximum number of entries in the memory tier
    pub memory_count_limit: usize,

    /// Maximum total cost of the memory tier
    pub memory_cost_limit: u64,

    /// Concurrent image downloads
    pub image_download_concurrency: usize,

    /// Concurrent generic HTTP requests
    pub http_concurrency: usize,

    /// HTTP client configuration
    pub http: HttpConfig,
}

impl Default for PixcacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("pixcache"),
            max_cache_age: DEFAULT_MAX_CACHE_AGE,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            memory_count_limit: DEFAULT_MEMORY_COUNT_LIMIT,
            memory_cost_limit: DEFAULT_MEMORY_COST_LIMIT,
            image_download_concurrency: DEFAULT_IMAGE_DOWNLOAD_CONCURRENCY,
            http_concurrency: DEFAULT_HTTP_CONCURRENCY,
            http: HttpConfig::default(),
        }
    }
}

impl PixcacheConfig {
    pub fn builder() -> crate::builder::PixcacheConfigBuilder {
        crate::builder::PixcacheConfigBuilder::new()
    }

    /// Directory of the HTTP response cache, if enabled.
    pub fn response_cache_dir(&self) -> Option<PathBuf> {
        if !self.http.response_cache_enabled {
            return None;
        }
        Some(
            self.http
                .response_cache_dir
                .clone()
                .unwrap_or_else(|| self.cache_dir.join(RESPONSE_CACHE_DIR_NAME)),
        )
    }
}

/// Options for the reqwest client behind the default transport.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for one request, including the body
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    /// Persist successful GET responses for `on_cached` replay
    pub response_cache_enabled: bool,

    /// Overrides `<cache_dir>/http`
    pub response_cache_dir: Option<PathBuf>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::default_headers(),
            proxy: None,
            use_system_proxy: true,
            response_cache_enabled: true,
            response_cache_dir: None,
        }
    }
}

impl HttpConfig {
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/png,image/*;q=0.8,*/*;q=0.5"),
        );

        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        headers
    }
}
