// =============================================================================
// Venue Providers — uniform connector contract over exchange-specific wiring
// =============================================================================
//
// `VenueProvider` generalizes a set of ad-hoc per-venue functions
// (`run_trade_stream`, `OpenInterestTracker::fetch`, `BinanceClient`) behind
// one async trait, the way `cooprefr-bettersys` uses `async_trait` at its
// exchange-adapter seam. Each concrete provider keeps the same
// connect/parse/retry idiom internally.

pub mod binance;
pub mod bybit;
pub mod hybrid;

use async_trait::async_trait;
use serde::Serialize;

use crate::types::{MarketUpdate, ProviderIdentity};

/// Provider connection lifecycle: `Disconnected` is both the initial and
/// the terminal state; `intentional_disconnect` suppresses the
/// `Reconnecting` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Point-in-time health report returned by [`VenueProvider::health_status`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub identity: ProviderIdentity,
    pub state: ConnectionState,
    pub subscribed_symbols: usize,
    pub error_count: u64,
    pub last_update_ms: Option<i64>,
}

/// Callback invoked for every normalized update a provider produces. Boxed
/// so the ingestion gateway can register one closure per provider without
/// needing a generic parameter on the trait itself.
pub type UpdateCallback = Box<dyn Fn(MarketUpdate) + Send + Sync>;

/// Uniform contract every venue connector implements.
#[async_trait]
pub trait VenueProvider: Send + Sync {
    fn identity(&self) -> ProviderIdentity;

    async fn connect(&self) -> anyhow::Result<()>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn subscribe(&self, symbols: &[String]) -> anyhow::Result<()>;

    async fn unsubscribe(&self, symbols: &[String]) -> anyhow::Result<()>;

    async fn available_symbols(&self) -> anyhow::Result<Vec<String>>;

    /// Register the callback that receives every normalized update. Must be
    /// called before [`VenueProvider::connect`] to avoid dropping early
    /// messages.
    fn on_update(&self, callback: UpdateCallback);

    fn health_status(&self) -> ProviderHealth;
}
