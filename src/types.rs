// =============================================================================
// Shared types — normalized market data, triggers, and signals
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Market type / provider identity
// =============================================================================

/// Whether a market is a spot pair or a derivatives (futures/perpetual)
/// contract. Only futures markets carry open interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Futures => write!(f, "futures"),
        }
    }
}

impl std::str::FromStr for MarketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "futures" | "perp" | "perpetual" => Ok(Self::Futures),
            other => Err(format!("unknown market type: {other}")),
        }
    }
}

/// Identifies a venue connector: `{exchange, marketType}`, e.g.
/// `binance-futures`, `bybit-futures`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderIdentity {
    pub exchange: String,
    pub market_type: MarketType,
}

impl ProviderIdentity {
    pub fn new(exchange: impl Into<String>, market_type: MarketType) -> Self {
        Self {
            exchange: exchange.into(),
            market_type,
        }
    }
}

impl std::fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.exchange, self.market_type)
    }
}

/// Validate a symbol against the shared venue-catalog shape: an upper-case
/// ticker terminating in `USDT`, starting with a letter.
pub fn is_valid_symbol_shape(symbol: &str) -> bool {
    let bytes = symbol.as_bytes();
    if !symbol.ends_with("USDT") || bytes.len() <= 4 {
        return false;
    }
    let first = bytes[0];
    if !first.is_ascii_uppercase() {
        return false;
    }
    bytes[..bytes.len() - 4]
        .iter()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

// =============================================================================
// MarketUpdate — normalized ingress record
// =============================================================================

/// A single normalized update coming out of a venue provider. Every field
/// besides `provider_id`, `market_type`, `symbol`, and `timestamp_ms` is
/// optional: absence means "no update for that field in this record", not
/// zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub provider_id: ProviderIdentity,
    pub market_type: MarketType,
    pub symbol: String,
    pub timestamp_ms: i64,

    pub price: Option<f64>,
    pub open_interest: Option<f64>,
    pub open_interest_timestamp_ms: Option<i64>,
    pub volume: Option<f64>,
    pub quote_volume: Option<f64>,
    pub mark_price: Option<f64>,
    pub funding_rate: Option<f64>,

    pub volume_buy: Option<f64>,
    pub volume_sell: Option<f64>,
    pub volume_buy_quote: Option<f64>,
    pub volume_sell_quote: Option<f64>,
}

impl MarketUpdate {
    pub fn new(provider_id: ProviderIdentity, symbol: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            provider_id,
            market_type: MarketType::Futures,
            symbol: symbol.into(),
            timestamp_ms,
            price: None,
            open_interest: None,
            open_interest_timestamp_ms: None,
            volume: None,
            quote_volume: None,
            mark_price: None,
            funding_rate: None,
            volume_buy: None,
            volume_sell: None,
            volume_buy_quote: None,
            volume_sell_quote: None,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_open_interest(mut self, oi: f64, ts_ms: i64) -> Self {
        self.open_interest = Some(oi);
        self.open_interest_timestamp_ms = Some(ts_ms);
        self
    }

    pub fn with_aggressive_volume(mut self, buy: f64, sell: f64, buy_quote: f64, sell_quote: f64) -> Self {
        self.volume_buy = Some(buy);
        self.volume_sell = Some(sell);
        self.volume_buy_quote = Some(buy_quote);
        self.volume_sell_quote = Some(sell_quote);
        self
    }

    /// Bad-data guard applied at the ingestion boundary: monetary fields
    /// must be finite and non-negative; price must be strictly positive to
    /// be usable at all.
    pub fn is_well_formed(&self) -> bool {
        let finite_nonneg = |v: Option<f64>| v.map_or(true, |x| x.is_finite() && x >= 0.0);

        is_valid_symbol_shape(&self.symbol)
            && self.price.map_or(true, |p| p.is_finite() && p > 0.0)
            && finite_nonneg(self.open_interest)
            && finite_nonneg(self.volume)
            && finite_nonneg(self.quote_volume)
            && finite_nonneg(self.mark_price)
            && finite_nonneg(self.volume_buy)
            && finite_nonneg(self.volume_sell)
            && finite_nonneg(self.volume_buy_quote)
            && finite_nonneg(self.volume_sell_quote)
    }
}

// =============================================================================
// Trigger / Signal
// =============================================================================

/// Direction of open-interest move a [`Trigger`] watches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// A user-configured OI-change alert, as read from the external trigger
/// store. Owned by the Trigger Registry; evaluators only ever see borrowed
/// snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub user_id: String,
    pub direction: Direction,
    pub oi_change_percent: f64,
    pub time_interval_minutes: u32,
    pub notification_limit_seconds: u64,
    pub is_active: bool,
}

impl Trigger {
    /// `true` if the trigger's parameters are within the accepted bounds
    /// (`oiChangePercent > 0`, interval in `[1, 30]`, cooldown `>= 10`).
    pub fn is_well_formed(&self) -> bool {
        self.oi_change_percent > 0.0
            && (1..=30).contains(&self.time_interval_minutes)
            && self.notification_limit_seconds >= 10
    }
}

/// A specification for creating or updating a trigger, handed to
/// [`crate::registry::TriggerRepository::save`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub user_id: String,
    pub direction: Direction,
    pub oi_change_percent: f64,
    pub time_interval_minutes: u32,
    pub notification_limit_seconds: u64,
}

/// A persisted record of one firing of one trigger for one symbol. This is
/// the OI-primary shape: `oiChangePercent` is required, `priceChangePercent`
/// and `currentPrice` are optional context carried along for rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub trigger_id: String,
    pub user_id: String,
    pub symbol: String,
    pub signal_number: u32,
    pub oi_change_percent: f64,
    pub price_change_percent: Option<f64>,
    pub current_price: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Metrics — ephemeral result of a window query
// =============================================================================

/// Result of a single [`crate::metrics::MetricsCalculator::metric_changes`]
/// call. Entirely derived from bucket/state data at query time; never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub oi_change_percent: f64,
    pub oi_start: f64,
    pub oi_end: f64,

    pub price_change_percent: Option<f64>,
    pub current_price: Option<f64>,
    pub previous_price: Option<f64>,

    pub total_volume: f64,
    pub delta_volume: f64,
    pub total_quote_volume: f64,
    pub delta_quote_volume: f64,

    pub volume_baseline: f64,
    pub volume_baseline_quote: f64,
    pub volume_ratio: Option<f64>,
    pub volume_ratio_quote: Option<f64>,

    pub time_window_seconds: u64,
}

/// Round `value` to `places` decimal digits. Shared by every numeric
/// boundary in the metrics pipeline — every returned percentage is rounded
/// to 6 decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_shape_accepts_valid() {
        assert!(is_valid_symbol_shape("BTCUSDT"));
        assert!(is_valid_symbol_shape("B2USDT"));
    }

    #[test]
    fn symbol_shape_rejects_invalid() {
        assert!(!is_valid_symbol_shape("btcusdt"));
        assert!(!is_valid_symbol_shape("USDT"));
        assert!(!is_valid_symbol_shape("1BTCUSDT"));
        assert!(!is_valid_symbol_shape("BTCUSD"));
    }

    #[test]
    fn market_update_rejects_nonfinite() {
        let u = MarketUpdate::new(
            ProviderIdentity::new("binance", MarketType::Futures),
            "BTCUSDT",
            0,
        )
        .with_price(f64::NAN);
        assert!(!u.is_well_formed());
    }

    #[test]
    fn market_update_rejects_negative_oi() {
        let mut u = MarketUpdate::new(
            ProviderIdentity::new("binance", MarketType::Futures),
            "BTCUSDT",
            0,
        );
        u.open_interest = Some(-1.0);
        assert!(!u.is_well_formed());
    }

    #[test]
    fn market_update_rejects_zero_price() {
        let u = MarketUpdate::new(
            ProviderIdentity::new("binance", MarketType::Futures),
            "BTCUSDT",
            0,
        )
        .with_price(0.0);
        assert!(!u.is_well_formed());
    }

    #[test]
    fn round_to_six_places() {
        assert_eq!(round_to(1.0 / 3.0, 6), 0.333333);
    }

    #[test]
    fn trigger_bounds() {
        let t = Trigger {
            id: "t1".into(),
            user_id: "u1".into(),
            direction: Direction::Up,
            oi_change_percent: 5.0,
            time_interval_minutes: 1,
            notification_limit_seconds: 60,
            is_active: true,
        };
        assert!(t.is_well_formed());

        let mut bad = t.clone();
        bad.oi_change_percent = 0.0;
        assert!(!bad.is_well_formed());

        let mut bad2 = t.clone();
        bad2.time_interval_minutes = 31;
        assert!(!bad2.is_well_formed());
    }
}
