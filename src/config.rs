use crate::api::binance::{BinanceSettings, DEFAULT_BASE_URL};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    /// Client-side request quota
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

// Never print credentials
impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("key", &redact(&self.key))
            .field("secret", &redact(&self.secret))
            .field("base_url", &self.base_url)
            .field("recv_window_ms", &self.recv_window_ms)
            .field("requests_per_minute", &self.requests_per_minute)
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            secret: String::new(),
            base_url: default_base_url(),
            recv_window_ms: default_recv_window_ms(),
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_requests_per_minute() -> u32 {
    1200
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_leverage")]
    pub long_leverage: u32,
    #[serde(default = "default_leverage")]
    pub short_leverage: u32,
    /// Margin per long entry in USDT
    #[serde(default = "default_margin")]
    pub long_margin: Decimal,
    /// Margin per short entry in USDT
    #[serde(default = "default_margin")]
    pub short_margin: Decimal,
    /// Symbols never added to the watch list
    #[serde(default = "default_exclude_symbols")]
    pub exclude_symbols: Vec<String>,
    #[serde(default = "default_watch_list_size")]
    pub watch_list_size: usize,
    /// Hourly candles fetched per signal evaluation
    #[serde(default = "default_kline_limit")]
    pub kline_limit: u32,
    /// Reconcile and re-protect open positions before the first cycle
    #[serde(default = "default_true")]
    pub startup_reconcile: bool,
    #[serde(default = "default_rules_ttl_secs")]
    pub rules_ttl_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            long_leverage: default_leverage(),
            short_leverage: default_leverage(),
            long_margin: default_margin(),
            short_margin: default_margin(),
            exclude_symbols: default_exclude_symbols(),
            watch_list_size: default_watch_list_size(),
            kline_limit: default_kline_limit(),
            startup_reconcile: true,
            rules_ttl_secs: default_rules_ttl_secs(),
        }
    }
}

impl TradingConfig {
    pub fn rules_ttl(&self) -> Duration {
        Duration::from_secs(self.rules_ttl_secs)
    }

    pub fn is_excluded(&self, symbol: &str) -> bool {
        self.exclude_symbols.iter().any(|s| s == symbol)
    }
}

fn default_leverage() -> u32 {
    10
}

fn default_margin() -> Decimal {
    Decimal::from(200)
}

fn default_exclude_symbols() -> Vec<String> {
    [
        "BTCUSDT", "ETHUSDT", "XRPUSDT", "LINKUSDT", "SOLUSDT", "BNBUSDT", "FILUSDT", "DOTUSDT",
        "MEMEUSDT", "BNXUSDT", "1000SHIBUSDT", "ONDOUSDT", "TRUMPUSDT", "CRVUSDT", "ETHFIUSDT",
        "TRBUSDT", "SPXUSDT", "MKRUSDT", "BCHUSDT", "TAOUSDT", "ANIMEUSDT", "BUSDT", "LTCUSDT",
        "DOGEUSDT", "1000PEPEUSDT", "1000000BOBUSDT", "SUIUSDT", "WLDUSDT", "TRXUSDT",
        "RESOLVUSDT", "FUNUSDT", "MYXUSDT", "TONUSDT", "XLMUSDT", "HYPEUSDT", "FARTCOINUSDT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_watch_list_size() -> usize {
    28
}

fn default_kline_limit() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_rules_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Offsets beyond this are logged as a warning
    #[serde(default = "default_max_offset_ms")]
    pub max_offset_ms: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            max_offset_ms: default_max_offset_ms(),
        }
    }
}

impl ClockConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

fn default_sync_interval_secs() -> u64 {
    3600
}

fn default_max_offset_ms() -> i64 {
    1500
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PERPBOT_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (PERPBOT_API__KEY, etc.)
            .add_source(
                Environment::with_prefix("PERPBOT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("trading.exclude_symbols"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn binance_settings(&self) -> BinanceSettings {
        BinanceSettings {
            base_url: self.api.base_url.clone(),
            api_key: self.api.key.clone(),
            api_secret: self.api.secret.clone(),
            recv_window_ms: self.api.recv_window_ms,
            requests_per_minute: self.api.requests_per_minute,
            request_timeout: self.network.request_timeout(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.api.key.trim().is_empty() || self.api.secret.trim().is_empty() {
            errors.push("api.key and api.secret must be set".to_string());
        }

        if self.api.requests_per_minute == 0 {
            errors.push("api.requests_per_minute must be positive".to_string());
        }

        if self.trading.long_leverage < 1 || self.trading.short_leverage < 1 {
            errors.push("leverage must be at least 1".to_string());
        }

        if self.trading.long_margin <= Decimal::ZERO || self.trading.short_margin <= Decimal::ZERO
        {
            errors.push("long_margin and short_margin must be positive".to_string());
        }

        if self.trading.watch_list_size == 0 {
            errors.push("watch_list_size must be positive".to_string());
        }

        // MA60 needs 60 candles
        if self.trading.kline_limit < 60 {
            errors.push(format!(
                "kline_limit must be at least 60, got {}",
                self.trading.kline_limit
            ));
        }

        if self.network.max_retries < 1 {
            errors.push("max_retries must be at least 1".to_string());
        }

        if self.clock.sync_interval_secs == 0 {
            errors.push("clock.sync_interval_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
