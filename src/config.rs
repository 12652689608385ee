//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::engine::EngineSettings;
use crate::exchange::Currency;
use crate::finder::FinderSettings;
use crate::graph::{FillPolicy, DEFAULT_FILL_RETRIES};
use crate::opportunity::{ExecutionSettings, DEFAULT_NEUTRAL_CURRENCIES};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Exchange ===
    /// Exchange name used in logs and records.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// REST API base URL.
    #[serde(default = "default_rest_url")]
    pub exchange_rest_url: String,

    /// Websocket base URL.
    #[serde(default = "default_ws_url")]
    pub exchange_ws_url: String,

    /// API key (required for live trading).
    #[serde(default)]
    pub exchange_api_key: Option<String>,

    /// API secret (required for live trading).
    #[serde(default)]
    pub exchange_api_secret: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    // === Detection ===
    /// Minimum arbitrage for a triangle to count as an opportunity.
    #[serde(default = "default_threshold")]
    pub threshold: Decimal,

    /// Fetch order books for new opportunities.
    #[serde(default = "default_true")]
    pub fetch_volumes: bool,

    /// Use the websocket top-of-book feed instead of polling tickers.
    #[serde(default)]
    pub use_stream: bool,

    /// Ticker polling period.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Order book depth for volume fetches.
    #[serde(default = "default_order_book_depth")]
    pub order_book_depth: usize,

    /// Period of the graph statistics log.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Order book cache entry lifetime.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Order book cache size.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    // === Execution ===
    /// Simulation mode (no real orders).
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Status polls per order before cancelling.
    #[serde(default = "default_fill_retries")]
    pub fill_retries: u32,

    /// Delay between order status polls.
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,

    /// Price tolerance of unwind orders.
    #[serde(default = "default_market_order_slippage")]
    pub market_order_slippage: Decimal,

    /// Distance kept from the volume bounds.
    #[serde(default = "default_factor")]
    pub margin_factor: Decimal,

    /// Share of the tradable volume actually traded.
    #[serde(default = "default_factor")]
    pub safety_factor: Decimal,

    /// Also cap the balance by the maximum volume.
    #[serde(default)]
    pub cap_balance_by_max_volume: bool,

    /// Background balance refresh period.
    #[serde(default = "default_balance_refresh_secs")]
    pub balance_refresh_secs: u64,

    /// Comma-separated currencies an unwind may stop in.
    #[serde(default = "default_neutral_currencies")]
    pub neutral_currencies: String,

    /// Comma-separated currencies ignored in the balance.
    #[serde(default = "default_excluded_currencies")]
    pub excluded_currencies: String,

    /// JSON lines file for closed opportunities.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    // === Server Configuration ===
    /// HTTP server port for health/metrics endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Emit logs as JSON.
    #[serde(default)]
    pub log_json: bool,
}

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_http_timeout_ms() -> u64 {
    2000
}

fn default_threshold() -> Decimal {
    Decimal::new(1001, 3) // 1.001
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_order_book_depth() -> usize {
    5
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_cache_ttl_ms() -> u64 {
    500
}

fn default_cache_capacity() -> usize {
    256
}

fn default_fill_retries() -> u32 {
    DEFAULT_FILL_RETRIES
}

fn default_fill_poll_interval_ms() -> u64 {
    250
}

fn default_market_order_slippage() -> Decimal {
    Decimal::new(1, 2) // 1%
}

fn default_factor() -> Decimal {
    Decimal::new(9, 1) // 0.9
}

fn default_balance_refresh_secs() -> u64 {
    30
}

fn default_neutral_currencies() -> String {
    DEFAULT_NEUTRAL_CURRENCIES.join(",")
}

fn default_excluded_currencies() -> String {
    "DTH".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn split_list(list: &str) -> Vec<Currency> {
    list.split(',')
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.threshold <= Decimal::ZERO {
            return Err("THRESHOLD must be positive".to_string());
        }

        for (name, factor) in [
            ("MARGIN_FACTOR", self.margin_factor),
            ("SAFETY_FACTOR", self.safety_factor),
        ] {
            if factor <= Decimal::ZERO || factor > Decimal::ONE {
                return Err(format!("{name} must be in (0, 1]"));
            }
        }

        if self.market_order_slippage < Decimal::ZERO || self.market_order_slippage >= Decimal::ONE {
            return Err("MARKET_ORDER_SLIPPAGE must be in [0, 1)".to_string());
        }

        if self.fill_retries == 0 {
            return Err("FILL_RETRIES must be at least 1".to_string());
        }

        if self.order_book_depth == 0 {
            return Err("ORDER_BOOK_DEPTH must be at least 1".to_string());
        }

        if !self.dry_run && !self.has_credentials() {
            return Err("EXCHANGE_API_KEY and EXCHANGE_API_SECRET are required when DRY_RUN=false".to_string());
        }

        if self.neutral_currencies().is_empty() {
            return Err("NEUTRAL_CURRENCIES must not be empty".to_string());
        }

        Ok(())
    }

    /// Whether both API credentials are set.
    pub fn has_credentials(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        set(&self.exchange_api_key) && set(&self.exchange_api_secret)
    }

    /// Parsed neutral currency list.
    pub fn neutral_currencies(&self) -> Vec<Currency> {
        split_list(&self.neutral_currencies)
    }

    /// Parsed excluded currency list.
    pub fn excluded_currencies(&self) -> Vec<Currency> {
        split_list(&self.excluded_currencies)
    }

    /// Per-leg fill wait.
    pub fn fill_policy(&self) -> FillPolicy {
        FillPolicy {
            retries: self.fill_retries,
            poll_interval: Duration::from_millis(self.fill_poll_interval_ms),
            market_slippage: self.market_order_slippage,
        }
    }

    /// Detection loop settings.
    pub fn finder_settings(&self) -> FinderSettings {
        FinderSettings {
            threshold: self.threshold,
            fetch_volumes: self.fetch_volumes,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            order_book_depth: self.order_book_depth,
            stats_interval: Duration::from_secs(self.stats_interval_secs),
        }
    }

    /// Exploit gate settings.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            margin_factor: self.margin_factor,
            safety_factor: self.safety_factor,
            cap_balance_by_max_volume: self.cap_balance_by_max_volume,
            balance_refresh: Duration::from_secs(self.balance_refresh_secs),
            excluded_currencies: self.excluded_currencies(),
            threshold: self.threshold,
            order_book_depth: self.order_book_depth,
            execution: ExecutionSettings {
                fill: self.fill_policy(),
                neutral_currencies: self.neutral_currencies(),
                mock: self.dry_run,
            },
        }
    }

    /// HTTP request timeout.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Order book cache entry lifetime.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(vars: &[(&str, &str)]) -> Config {
        envy::from_iter(vars.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap()
    }

    #[test]
    fn default_values_are_sensible() {
        let config = config(&[]);

        assert_eq!(config.threshold, Decimal::new(1001, 3));
        assert!(config.dry_run);
        assert!(config.fetch_volumes);
        assert!(!config.use_stream);
        assert_eq!(config.fill_retries, 20);
        assert_eq!(config.neutral_currencies(), vec!["BTC", "ETH", "USD", "USDT", "EUR", "CAD"]);
        assert_eq!(config.excluded_currencies(), vec!["DTH"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("THRESHOLD", "1.01"),
            ("FILL_RETRIES", "5"),
            ("NEUTRAL_CURRENCIES", "usdt, btc"),
            ("STORE_PATH", "/tmp/opportunities.jsonl"),
        ]);

        assert_eq!(config.threshold, Decimal::new(101, 2));
        assert_eq!(config.fill_policy().retries, 5);
        assert_eq!(config.neutral_currencies(), vec!["USDT", "BTC"]);
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/opportunities.jsonl")));
        assert_eq!(config.engine_settings().threshold, Decimal::new(101, 2));
    }

    #[test]
    fn validate_rejects_live_trading_without_credentials() {
        let config = config(&[("DRY_RUN", "false")]);
        assert!(config.validate().is_err());

        let config = config_with_keys();
        assert!(config.validate().is_ok());
        assert!(!config.engine_settings().execution.mock);
    }

    fn config_with_keys() -> Config {
        config(&[
            ("DRY_RUN", "false"),
            ("EXCHANGE_API_KEY", "key"),
            ("EXCHANGE_API_SECRET", "secret"),
        ])
    }

    #[test]
    fn validate_rejects_out_of_range_factors() {
        assert!(config(&[("SAFETY_FACTOR", "1.5")]).validate().is_err());
        assert!(config(&[("MARGIN_FACTOR", "0")]).validate().is_err());
        assert!(config(&[("THRESHOLD", "-1")]).validate().is_err());
        assert!(config(&[("FILL_RETRIES", "0")]).validate().is_err());
    }
}
