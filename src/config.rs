// Configuration module for navidx
// Reads from environment variables with sensible defaults

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Read connection pool size (NAVIDX_POOL_SIZE)
    pub pool_size: u32,

    /// Read connection pool minimum idle connections (NAVIDX_POOL_MIN_IDLE)
    pub pool_min_idle: u32,

    /// Rows per write transaction when building a store (NAVIDX_WRITE_BATCH)
    pub write_batch_size: usize,

    /// Rows fetched per page during prefix scans (NAVIDX_SCAN_PAGE_SIZE)
    pub scan_page_size: usize,

    /// Fact filter applied when a request carries none (NAVIDX_DEFAULT_FILTER).
    ///
    /// Comma-separated glob patterns. Empty means requests without a filter
    /// get no node facts at all; `**` returns every fact.
    pub default_filter: Vec<String>,

    /// Upper bound on anchors returned per cross-reference bucket (NAVIDX_MAX_PAGE_SIZE)
    pub max_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 10,
            pool_min_idle: 2,
            write_batch_size: 1000,
            scan_page_size: 256,
            default_filter: Vec::new(),
            max_page_size: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let mut config = Config::default();

        read_var("NAVIDX_POOL_SIZE", &mut config.pool_size);
        read_var("NAVIDX_POOL_MIN_IDLE", &mut config.pool_min_idle);
        read_var("NAVIDX_WRITE_BATCH", &mut config.write_batch_size);
        read_var("NAVIDX_SCAN_PAGE_SIZE", &mut config.scan_page_size);
        read_var("NAVIDX_MAX_PAGE_SIZE", &mut config.max_page_size);

        if let Ok(val) = env::var("NAVIDX_DEFAULT_FILTER") {
            config.default_filter = parse_filter_list(&val);
        }

        if config.write_batch_size == 0 {
            tracing::warn!("NAVIDX_WRITE_BATCH must be positive, using 1");
            config.write_batch_size = 1;
        }
        if config.scan_page_size == 0 {
            tracing::warn!("NAVIDX_SCAN_PAGE_SIZE must be positive, using 1");
            config.scan_page_size = 1;
        }

        config
    }

    /// Get the global configuration instance
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }
}

fn read_var<T>(name: &str, slot: &mut T)
where
    T: FromStr + std::fmt::Display,
{
    let Ok(val) = env::var(name) else {
        return;
    };
    match val.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!("Invalid {name} value: {val}, using default: {slot}"),
    }
}

fn parse_filter_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(str::to_string)
        .collect()
}
