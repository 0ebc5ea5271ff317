use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub scraper: ScraperConfig,
    pub fallback: FallbackConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub market: MarketConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
}

/// Primary source: quote-listing page scraped one batch per request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub user_agent: String,

    /// Attribute carrying the symbol on every quote marker element.
    pub symbol_attr: String,
    /// Attribute naming which quote field a marker element holds.
    pub field_attr: String,
    pub price_field: String,
    pub change_field: String,
    pub change_percent_field: String,
}

/// Secondary source: bulk quote JSON API.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub http_retries: usize,
    pub http_backoff_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub run_migrations: bool,
}

/// Refresh pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Initial value of the runtime kill-switch.
    pub enabled: bool,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub batch_jitter_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub stale_after_secs: u64,
    pub universe_file: Option<PathBuf>,
}

/// Exchange session window, UTC.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MarketConfig {
    pub open: String,
    pub close: String,
    pub weekdays: Vec<String>,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub page_size: usize,
    pub max_pages: usize,
    pub post_limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://finance.yahoo.com/quotes".to_string(),
            timeout_secs: 30,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/124.0 Safari/537.36"
                .to_string(),
            symbol_attr: "data-symbol".to_string(),
            field_attr: "data-field".to_string(),
            price_field: "regularMarketPrice".to_string(),
            change_field: "regularMarketChange".to_string(),
            change_percent_field: "regularMarketChangePercent".to_string(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            base_url: "https://query1.finance.yahoo.com/v7/finance/quote".to_string(),
            timeout_secs: 20,
            http_retries: 2,
            http_backoff_ms: 250,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/prices.duckdb"),
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            batch_delay_ms: 1000,
            batch_jitter_ms: 0,
            max_retries: 3,
            retry_delay_ms: 5000,
            stale_after_secs: 15 * 60,
            universe_file: None,
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            open: "14:30".to_string(),
            close: "21:00".to_string(),
            weekdays: ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
            refresh_interval_secs: 15 * 60,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            max_pages: 4,
            post_limit: 100,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ── Derived values ───────────────────────────────────────────────────────────

impl PipelineConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

impl MarketConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("Invalid server bind address {:?}", self.bind))
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("PRICE_REFRESH").separator("__"))
            .build()
            .context("Failed to assemble configuration sources")?;

        cfg.try_deserialize()
            .context("Configuration does not match the expected shape")
    }
}
