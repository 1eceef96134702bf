//! # Builder for PixcacheConfig
//!
//! Fluent construction of [`PixcacheConfig`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pixcache_engine::PixcacheConfig;
//!
//! let config = PixcacheConfig::builder()
//!     .with_cache_dir("/tmp/pixcache-doc")
//!     .with_max_cache_size(64 * 1024 * 1024)
//!     .with_max_cache_age(Duration::from_secs(7 * 24 * 60 * 60))
//!     .with_timeout(Duration::from_secs(20))
//!     .with_header("X-Api-Key", "my-secret-key")
//!     .build();
//!
//! assert_eq!(config.max_cache_size, 64 * 1024 * 1024);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::PixcacheConfig;
use crate::http::ProxyConfig;

/// Builder for creating PixcacheConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct PixcacheConfigBuilder {
    config: PixcacheConfig,
}

impl PixcacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PixcacheConfig::default(),
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn with_max_cache_age(mut self, age: Duration) -> Self {
        self.config.max_cache_age = age;
        self
    }

    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.config.max_cache_size = bytes;
        self
    }

    /// Bound the memory tier by entry count and by total cost
    pub fn with_memory_limits(mut self, count: usize, cost: u64) -> Self {
        self.config.memory_count_limit = count;
        self.config.memory_cost_limit = cost;
        self
    }

    pub fn with_image_download_concurrency(mut self, concurrency: usize) -> Self {
        self.config.image_download_concurrency = concurrency;
        self
    }

    pub fn with_http_concurrency(mut self, concurrency: usize) -> Self {
        self.config.http_concurrency = concurrency;
        self
    }

    /// Set the overall timeout for one HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.connect_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.http.follow_redirects = follow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.http.user_agent = user_agent.into();
        self
    }

    /// Add a header sent with every request. Invalid names or values are ignored.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.http.headers.insert(name, value);
        }
        self
    }

    /// Merge headers over the defaults; custom values win for the same name
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.config.http.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.http.proxy = Some(proxy);
        self.config.http.use_system_proxy = false;
        self
    }

    /// Only takes effect when no explicit proxy is configured
    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        if self.config.http.proxy.is_none() {
            self.config.http.use_system_proxy = use_system_proxy;
        }
        self
    }

    pub fn with_response_cache(mut self, enabled: bool) -> Self {
        self.config.http.response_cache_enabled = enabled;
        self
    }

    pub fn build(self) -> PixcacheConfig {
        self.config
    }
}

impl Default for PixcacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
