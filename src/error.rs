// =============================================================================
// Ingestion error taxonomy
// =============================================================================
//
// Most of this crate propagates failures with `anyhow`, matching the rest of
// the codebase. The one boundary that needs a typed error is the hand-off
// between a venue provider and the ingestion gateway: the gateway must
// distinguish "drop and count" data errors from "retry with backoff"
// transport errors without downcasting an opaque `anyhow::Error`.
// =============================================================================

use thiserror::Error;

/// Errors a [`crate::providers::VenueProvider`] can report back to the
/// ingestion gateway.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Transient transport failure (socket close, REST 5xx/429). Never
    /// fatal; the caller retries with backoff.
    #[error("transient transport failure: {0}")]
    Transport(String),

    /// Malformed or out-of-range payload. Dropped silently at the boundary;
    /// the caller increments an error counter.
    #[error("malformed payload: {0}")]
    BadData(String),

    /// An individual symbol was rejected by a venue subscription. Logged
    /// once, then the symbol is skipped.
    #[error("subscription rejected for {symbol}: {reason}")]
    SubscriptionRejected { symbol: String, reason: String },

    /// Unrecoverable failure during connect; propagates.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

/// Errors surfaced while loading configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("no providers configured and no fallback available")]
    NoProviders,
}
