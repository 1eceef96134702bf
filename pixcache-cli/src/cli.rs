use clap::Parser;
use pixcache_engine::Priority;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Fetch images through a persistent memory and disk cache",
    long_about = "Fetches each URL through a two-tier image cache.\n\
                  \n\
                  Cached images are served from memory or disk without touching the network;\n\
                  everything else is downloaded (optionally center-cropped), persisted and\n\
                  reported. Running the same command twice shows the second run as cache hits."
)]
pub struct CliArgs {
    /// Image URL(s) to fetch
    #[arg(
        required_unless_present_any = ["sweep", "clear"],
        help = "Image URL(s) to fetch. Duplicates are fetched once"
    )]
    pub input: Vec<String>,

    /// Directory to write fetched images to
    #[arg(
        short,
        long,
        help = "Directory where fetched images will be written (not written when omitted)"
    )]
    pub output_dir: Option<PathBuf>,

    /// Cache root directory
    #[arg(
        long,
        help = "Cache directory (default: <system temp dir>/pixcache)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Disk cache budget with optional unit (B, KB, MB, GB, TB)
    #[arg(
        long,
        default_value = "500MB",
        help = "Disk cache budget with optional unit (B, KB, MB, GB, TB). A sweep over budget trims the cache to half of it"
    )]
    pub max_cache_size: String,

    /// Maximum age of cached images with optional unit (s, m, h, d)
    #[arg(
        long,
        default_value = "60d",
        help = "Maximum age of cached images with optional unit (s, m, h, d). Examples: \"12h\", \"7d\""
    )]
    pub max_cache_age: String,

    /// Maximum concurrent image downloads
    #[arg(
        short = 'c',
        long,
        default_value = "50",
        help = "Maximum number of concurrent image downloads"
    )]
    pub concurrency: usize,

    /// Maximum concurrent generic HTTP requests
    #[arg(
        long,
        default_value = "5",
        help = "Maximum number of concurrent generic HTTP requests"
    )]
    pub http_concurrency: usize,

    /// Overall request timeout in seconds
    #[arg(
        long,
        default_value = "60",
        help = "Overall timeout in seconds for one HTTP request. Use 0 to disable"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Center-crop fetched images before caching
    #[arg(
        long,
        value_name = "WxH",
        help = "Center-crop downloaded images to WIDTHxHEIGHT before caching. Cache hits are returned as stored"
    )]
    pub crop: Option<String>,

    /// Download priority
    #[arg(
        long,
        value_enum,
        default_value_t = Priority::Normal,
        help = "Admission priority of the downloads"
    )]
    pub priority: Priority,

    /// Sweep the cache before fetching
    #[arg(
        long,
        help = "Remove expired entries and trim the cache to its size budget, then report what was removed"
    )]
    pub sweep: bool,

    /// Clear the cache before fetching
    #[arg(long, help = "Remove every cached image before fetching")]
    pub clear: bool,

    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    #[arg(
        long,
        help = "Proxy server URL for downloads (e.g., \"http://proxy.example.com:8080\")"
    )]
    pub proxy: Option<String>,

    /// Proxy type (http, https, socks5, all)
    #[arg(
        long,
        default_value = "http",
        help = "Proxy type (http, https, socks5, all)",
        value_parser = ["http", "https", "socks5", "all"]
    )]
    pub proxy_type: String,

    /// Proxy username
    #[arg(long, help = "Username for proxy authentication")]
    pub proxy_user: Option<String>,

    /// Proxy password
    #[arg(long, help = "Password for proxy authentication")]
    pub proxy_pass: Option<String>,

    /// Use system proxy settings for downloads
    #[arg(
        long,
        default_value = "true",
        help = "Use system proxy settings for downloads if no explicit proxy is configured"
    )]
    pub use_system_proxy: bool,

    /// Disable all proxy settings for downloads
    #[arg(
        long,
        help = "Disable all proxy settings (including system proxy) for downloads"
    )]
    pub no_proxy: bool,

    /// Show progress bars for downloads
    #[arg(
        short = 'P',
        long = "progress",
        default_value = "false",
        help = "Show a progress bar per download"
    )]
    pub show_progress: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,
}
