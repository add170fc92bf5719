// =============================================================================
// Runtime configuration — environment-driven, all optional
// =============================================================================
//
// Every tunable the engine exposes lives here as a typed field with a
// compiled default, loaded once at process startup from the environment.
// Unlike the `RuntimeConfig` this is modeled on (hot-reloadable, persisted
// to disk), this configuration is read-only after startup: nothing here
// needs reconfiguration without a restart, so there is no `save`/
// atomic-rename path.
// =============================================================================

use std::collections::HashMap;

use tracing::warn;

use crate::error::ConfigError;
use crate::types::MarketType;

/// One entry of `MARKET_DATA_PROVIDERS`: an exchange name with an optional
/// inline market-type override (`exchange:marketType`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub exchange: String,
    pub market_type: Option<MarketType>,
}

/// Top-level engine configuration. Every field maps to one configurable
/// environment variable.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub providers: Vec<ProviderSpec>,
    pub default_market_type: MarketType,
    pub per_exchange_market_type: HashMap<String, MarketType>,

    pub max_tracked_symbols: usize,
    pub max_minute_buckets: usize,
    pub max_15s_buckets: usize,
    pub fallback_shift_multiplier: u32,
    pub symbol_check_interval_ms: u64,

    pub batch_processing_size: usize,
    pub trigger_engine_flush_ms: u64,
    pub trigger_engine_metric_cache_ttl_ms: u64,
    pub min_check_interval_ms: u64,
    pub trigger_engine_debounce_threshold: u32,

    pub log_level: String,
    pub debug: bool,

    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            providers: vec![ProviderSpec {
                exchange: "binance".to_string(),
                market_type: Some(MarketType::Futures),
            }],
            default_market_type: MarketType::Spot,
            per_exchange_market_type: HashMap::new(),

            max_tracked_symbols: 2000,
            max_minute_buckets: 70,
            max_15s_buckets: 300,
            fallback_shift_multiplier: 2,
            symbol_check_interval_ms: 5000,

            batch_processing_size: 10,
            trigger_engine_flush_ms: 200,
            trigger_engine_metric_cache_ttl_ms: 500,
            min_check_interval_ms: 1000,
            trigger_engine_debounce_threshold: 3,

            log_level: "info".to_string(),
            debug: false,

            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Parse one `MARKET_DATA_PROVIDERS` entry, e.g. `"binance"` or
/// `"bybit:futures"`.
fn parse_provider_spec(raw: &str) -> Option<ProviderSpec> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.split_once(':') {
        Some((exchange, market_type)) => Some(ProviderSpec {
            exchange: exchange.trim().to_lowercase(),
            market_type: market_type.trim().parse().ok(),
        }),
        None => Some(ProviderSpec {
            exchange: raw.to_lowercase(),
            market_type: None,
        }),
    }
}

impl RuntimeConfig {
    /// Build configuration from the process environment. Every variable is
    /// optional; a missing or unparsable value falls back to the compiled
    /// default rather than failing startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(raw) = std::env::var("MARKET_DATA_PROVIDERS") {
            let parsed: Vec<ProviderSpec> = raw.split(',').filter_map(parse_provider_spec).collect();
            if !parsed.is_empty() {
                cfg.providers = parsed;
            }
        }

        if let Ok(raw) = std::env::var("MARKET_TYPE") {
            if let Ok(mt) = raw.parse() {
                cfg.default_market_type = mt;
            }
        }

        for provider in &cfg.providers {
            let key = format!("{}_MARKET_TYPE", provider.exchange.to_uppercase());
            if let Ok(raw) = std::env::var(&key) {
                if let Ok(mt) = raw.parse::<MarketType>() {
                    cfg.per_exchange_market_type.insert(provider.exchange.clone(), mt);
                }
            }
        }

        read_usize_env("MAX_TRACKED_SYMBOLS", &mut cfg.max_tracked_symbols);
        read_usize_env("MAX_MINUTE_BUCKETS", &mut cfg.max_minute_buckets);
        read_usize_env("MAX_15S_BUCKETS", &mut cfg.max_15s_buckets);
        read_u32_env("FALLBACK_SHIFT_MULTIPLIER", &mut cfg.fallback_shift_multiplier);
        read_u64_env("SYMBOL_CHECK_INTERVAL", &mut cfg.symbol_check_interval_ms);

        read_usize_env("BATCH_PROCESSING_SIZE", &mut cfg.batch_processing_size);
        read_u64_env("TRIGGER_ENGINE_FLUSH_MS", &mut cfg.trigger_engine_flush_ms);
        read_u64_env(
            "TRIGGER_ENGINE_METRIC_CACHE_TTL_MS",
            &mut cfg.trigger_engine_metric_cache_ttl_ms,
        );
        read_u64_env("MIN_CHECK_INTERVAL_MS", &mut cfg.min_check_interval_ms);
        read_u32_env(
            "TRIGGER_ENGINE_DEBOUNCE_THRESHOLD",
            &mut cfg.trigger_engine_debounce_threshold,
        );

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            cfg.log_level = level;
        }
        cfg.debug = std::env::var("DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if let Ok(addr) = std::env::var("AURORA_BIND_ADDR") {
            match validate_bind_addr(&addr) {
                Ok(()) => cfg.bind_addr = addr,
                Err(e) => warn!(error = %e, value = %addr, "keeping default bind address"),
            }
        }

        cfg
    }

    /// Resolve the effective market type for `exchange`, honoring the
    /// per-exchange override before falling back to the global default.
    pub fn market_type_for(&self, exchange: &str) -> MarketType {
        self.per_exchange_market_type
            .get(exchange)
            .copied()
            .unwrap_or(self.default_market_type)
    }
}

/// Reject an `AURORA_BIND_ADDR` override with no port. A bad config value
/// degrades to the compiled default with a warning rather than aborting.
fn validate_bind_addr(addr: &str) -> Result<(), ConfigError> {
    if addr.rsplit_once(':').is_some() {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: "AURORA_BIND_ADDR".to_string(),
            reason: "missing port, expected host:port".to_string(),
        })
    }
}

fn read_usize_env(key: &str, slot: &mut usize) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(v) = raw.parse() {
            *slot = v;
        }
    }
}

fn read_u32_env(key: &str, slot: &mut u32) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(v) = raw.parse() {
            *slot = v;
        }
    }
}

fn read_u64_env(key: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(v) = raw.parse() {
            *slot = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_tracked_symbols, 2000);
        assert_eq!(cfg.max_minute_buckets, 70);
        assert_eq!(cfg.max_15s_buckets, 300);
        assert_eq!(cfg.batch_processing_size, 10);
        assert_eq!(cfg.trigger_engine_flush_ms, 200);
        assert_eq!(cfg.trigger_engine_debounce_threshold, 3);
    }

    #[test]
    fn parse_provider_spec_plain() {
        let spec = parse_provider_spec("Binance").unwrap();
        assert_eq!(spec.exchange, "binance");
        assert_eq!(spec.market_type, None);
    }

    #[test]
    fn parse_provider_spec_with_market_type() {
        let spec = parse_provider_spec("bybit:futures").unwrap();
        assert_eq!(spec.exchange, "bybit");
        assert_eq!(spec.market_type, Some(MarketType::Futures));
    }

    #[test]
    fn parse_provider_spec_rejects_empty() {
        assert!(parse_provider_spec("  ").is_none());
    }

    #[test]
    fn validate_bind_addr_rejects_missing_port() {
        assert!(validate_bind_addr("0.0.0.0").is_err());
        assert!(validate_bind_addr("0.0.0.0:8080").is_ok());
    }

    #[test]
    fn market_type_for_honors_override() {
        let mut cfg = RuntimeConfig::default();
        cfg.default_market_type = MarketType::Spot;
        cfg.per_exchange_market_type
            .insert("binance".to_string(), MarketType::Futures);
        assert_eq!(cfg.market_type_for("binance"), MarketType::Futures);
        assert_eq!(cfg.market_type_for("bybit"), MarketType::Spot);
    }
}
