use std::time::Duration;

use pixcache_engine::http::{ProxyAuth, ProxyConfig, ProxyType};
use pixcache_engine::{CropTransform, PixcacheConfig};
use tracing::info;

use crate::cli::CliArgs;
use crate::error::AppError;
use crate::utils::{format_bytes, format_duration, parse_headers, parse_size, parse_time};

/// Build the engine configuration from the command line
pub fn engine_config(args: &CliArgs) -> Result<PixcacheConfig, AppError> {
    let max_cache_size = parse_size(&args.max_cache_size)?;
    let max_cache_age = parse_time(&args.max_cache_age)?;

    let mut builder = PixcacheConfig::builder()
        .with_max_cache_size(max_cache_size)
        .with_max_cache_age(max_cache_age)
        .with_image_download_concurrency(args.concurrency)
        .with_http_concurrency(args.http_concurrency)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_headers(parse_headers(&args.headers)?);

    if let Some(dir) = &args.cache_dir {
        builder = builder.with_cache_dir(dir);
    }

    builder = match proxy_config(args)? {
        Some(proxy) => builder.with_proxy(proxy),
        None => builder.with_system_proxy(args.use_system_proxy && !args.no_proxy),
    };

    let config = builder.build();
    info!(
        cache_dir = %config.cache_dir.display(),
        max_cache_size = %format_bytes(config.max_cache_size),
        max_cache_age = %format_duration(config.max_cache_age),
        concurrency = config.image_download_concurrency,
        "Cache configuration"
    );
    Ok(config)
}

fn proxy_config(args: &CliArgs) -> Result<Option<ProxyConfig>, AppError> {
    if args.no_proxy {
        // No proxy flag overrides everything else
        info!("All proxy settings disabled (--no-proxy flag)");
        return Ok(None);
    }
    let Some(proxy_url) = args.proxy.as_ref() else {
        return Ok(None);
    };

    let proxy_type = match args.proxy_type.as_str() {
        "http" => ProxyType::Http,
        "https" => ProxyType::Https,
        "socks5" => ProxyType::Socks5,
        "all" => ProxyType::All,
        other => {
            return Err(AppError::InvalidInput(format!(
                "Invalid proxy type: '{other}'"
            )));
        }
    };

    // Configure proxy authentication if both username and password are provided
    let auth = match (&args.proxy_user, &args.proxy_pass) {
        (Some(username), Some(password)) => Some(ProxyAuth {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => None,
    };

    info!(
        proxy_url = %proxy_url,
        proxy_type = ?proxy_type,
        has_auth = auth.is_some(),
        "Using explicit proxy configuration for downloads"
    );

    Ok(Some(ProxyConfig {
        url: proxy_url.clone(),
        proxy_type,
        auth,
    }))
}

/// Parse `--crop WIDTHxHEIGHT`
pub fn parse_crop(spec: &str) -> Result<CropTransform, AppError> {
    let invalid = || AppError::InvalidInput(format!("Invalid crop size '{spec}', expected WIDTHxHEIGHT"));

    let (width, height) = spec
        .trim()
        .to_lowercase()
        .split_once('x')
        .map(|(w, h)| (w.trim().parse::<u32>(), h.trim().parse::<u32>()))
        .ok_or_else(invalid)?;
    match (width, height) {
        (Ok(width), Ok(height)) if width > 0 && height > 0 => Ok(CropTransform::new(width, height)),
        _ => Err(invalid()),
    }
}
