use std::sync::Arc;

use reqwest::{Client, Proxy};
use rustls::{ClientConfig, crypto::aws_lc_rs};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::{debug, info};

use crate::config::HttpConfig;
use crate::error::{FetchError, Result};

/// Proxy configuration types
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
    /// All protocols
    All,
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

fn build_proxy(config: &ProxyConfig) -> Result<Proxy> {
    let invalid = |e: reqwest::Error| FetchError::Config(format!("invalid proxy URL: {e}"));

    let mut proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(&config.url).map_err(invalid)?,
        ProxyType::Https => Proxy::https(&config.url).map_err(invalid)?,
        ProxyType::Socks5 => {
            let url = if config.url.starts_with("socks5://") {
                config.url.clone()
            } else {
                format!("socks5://{}", config.url)
            };
            Proxy::all(&url).map_err(invalid)?
        }
        ProxyType::All => Proxy::all(&config.url).map_err(invalid)?,
    };

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}

/// Create the reqwest client used by the default transport
pub fn create_client(config: &HttpConfig) -> Result<Client> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| FetchError::Config(format!("TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| FetchError::Config(format!("platform certificate verifier: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(8)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if let Some(proxy_config) = &config.proxy {
        client_builder = client_builder.proxy(build_proxy(proxy_config)?);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy");
    } else if config.use_system_proxy {
        debug!("Using system proxy settings");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled");
    }

    client_builder
        .build()
        .map_err(|e| FetchError::Config(format!("failed to build HTTP client: {e}")))
}
