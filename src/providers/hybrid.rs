// =============================================================================
// Hybrid provider — price/volume from one venue, OI from another
// =============================================================================
//
// Composes a trade-stream venue (price + signed volume) with a ticker-stream
// venue (OI), joined per-symbol with a staleness window, and emits a merged
// update whenever either side reports something fresh.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::warn;

use crate::providers::{ConnectionState, ProviderHealth, UpdateCallback, VenueProvider};
use crate::types::{MarketType, MarketUpdate, ProviderIdentity};

/// How stale a side's last sample may be before it's dropped from the merge.
const STALENESS_WINDOW_MS: i64 = 10_000;

#[derive(Clone)]
struct SideSample {
    price: Option<f64>,
    open_interest: Option<f64>,
    open_interest_ts: Option<i64>,
    volume_buy: Option<f64>,
    volume_sell: Option<f64>,
    volume_buy_quote: Option<f64>,
    volume_sell_quote: Option<f64>,
    observed_ms: i64,
}

/// State shared between the two upstream `on_update` closures and the
/// `HybridProvider` that owns them; kept behind its own `Arc` so the
/// closures don't need to borrow `self`.
struct MergeState {
    exchange_label: String,
    latest_price_volume: DashMap<String, SideSample>,
    latest_oi: DashMap<String, SideSample>,
    callback: RwLock<Option<Arc<dyn Fn(MarketUpdate) + Send + Sync>>>,
    last_update_ms: AtomicI64,
}

impl MergeState {
    fn merge_and_emit(&self, symbol: &str) {
        let pv = self.latest_price_volume.get(symbol).map(|e| e.clone());
        let oi = self.latest_oi.get(symbol).map(|e| e.clone());

        let Some(now) = pv
            .as_ref()
            .map(|s| s.observed_ms)
            .into_iter()
            .chain(oi.as_ref().map(|s| s.observed_ms))
            .max()
        else {
            return;
        };

        let fresh_pv = pv.filter(|s| now - s.observed_ms <= STALENESS_WINDOW_MS);
        let fresh_oi = oi.filter(|s| now - s.observed_ms <= STALENESS_WINDOW_MS);

        if fresh_pv.is_none() && fresh_oi.is_none() {
            return;
        }

        let identity = ProviderIdentity::new(self.exchange_label.clone(), MarketType::Futures);
        let mut update = MarketUpdate::new(identity, symbol, now);

        if let Some(s) = &fresh_pv {
            update.price = s.price;
            update.volume_buy = s.volume_buy;
            update.volume_sell = s.volume_sell;
            update.volume_buy_quote = s.volume_buy_quote;
            update.volume_sell_quote = s.volume_sell_quote;
        }
        if let Some(s) = &fresh_oi {
            update.open_interest = s.open_interest;
            update.open_interest_timestamp_ms = s.open_interest_ts;
        }

        self.last_update_ms.store(now, Ordering::Release);
        if let Some(cb) = self.callback.read().as_ref() {
            cb(update);
        }
    }
}

/// Composes `price_volume_source` (trade stream, for price & signed volume)
/// with `oi_source` (ticker stream, for OI) into one merged update stream.
pub struct HybridProvider {
    price_volume_source: Arc<dyn VenueProvider>,
    oi_source: Arc<dyn VenueProvider>,
    merge: Arc<MergeState>,
}

impl HybridProvider {
    pub fn new(
        exchange_label: impl Into<String>,
        price_volume_source: Arc<dyn VenueProvider>,
        oi_source: Arc<dyn VenueProvider>,
    ) -> Self {
        Self {
            price_volume_source,
            oi_source,
            merge: Arc::new(MergeState {
                exchange_label: exchange_label.into(),
                latest_price_volume: DashMap::new(),
                latest_oi: DashMap::new(),
                callback: RwLock::new(None),
                last_update_ms: AtomicI64::new(0),
            }),
        }
    }
}

#[async_trait]
impl VenueProvider for HybridProvider {
    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new(self.merge.exchange_label.clone(), MarketType::Futures)
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let pv_result = self.price_volume_source.connect().await;
        let oi_result = self.oi_source.connect().await;

        if pv_result.is_err() && oi_result.is_err() {
            anyhow::bail!(
                "hybrid provider failed to connect either side: pv={:?}, oi={:?}",
                pv_result.err(),
                oi_result.err()
            );
        }
        if let Err(e) = &pv_result {
            warn!(error = %e, "hybrid provider: price/volume side failed to connect");
        }
        if let Err(e) = &oi_result {
            warn!(error = %e, "hybrid provider: OI side failed to connect");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.price_volume_source.disconnect().await;
        self.oi_source.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.price_volume_source.is_connected() || self.oi_source.is_connected()
    }

    async fn subscribe(&self, symbols: &[String]) -> anyhow::Result<()> {
        self.price_volume_source.subscribe(symbols).await?;
        self.oi_source.subscribe(symbols).await?;
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> anyhow::Result<()> {
        self.price_volume_source.unsubscribe(symbols).await?;
        self.oi_source.unsubscribe(symbols).await?;
        Ok(())
    }

    async fn available_symbols(&self) -> anyhow::Result<Vec<String>> {
        self.price_volume_source.available_symbols().await
    }

    fn on_update(&self, callback: UpdateCallback) {
        let callback: Arc<dyn Fn(MarketUpdate) + Send + Sync> = Arc::from(callback);
        *self.merge.callback.write() = Some(callback);

        // Each upstream side only records its freshest sample here; the
        // merged emission happens in `MergeState::merge_and_emit` so a
        // single-sided update never overwrites the other side's still-fresh
        // value.
        let merge_for_pv = self.merge.clone();
        self.price_volume_source.on_update(Box::new(move |update: MarketUpdate| {
            merge_for_pv.latest_price_volume.insert(
                update.symbol.clone(),
                SideSample {
                    price: update.price,
                    open_interest: None,
                    open_interest_ts: None,
                    volume_buy: update.volume_buy,
                    volume_sell: update.volume_sell,
                    volume_buy_quote: update.volume_buy_quote,
                    volume_sell_quote: update.volume_sell_quote,
                    observed_ms: update.timestamp_ms,
                },
            );
            merge_for_pv.merge_and_emit(&update.symbol);
        }));

        let merge_for_oi = self.merge.clone();
        self.oi_source.on_update(Box::new(move |update: MarketUpdate| {
            merge_for_oi.latest_oi.insert(
                update.symbol.clone(),
                SideSample {
                    price: None,
                    open_interest: update.open_interest,
                    open_interest_ts: update.open_interest_timestamp_ms,
                    volume_buy: None,
                    volume_sell: None,
                    volume_buy_quote: None,
                    volume_sell_quote: None,
                    observed_ms: update.timestamp_ms,
                },
            );
            merge_for_oi.merge_and_emit(&update.symbol);
        }));
    }

    fn health_status(&self) -> ProviderHealth {
        let pv = self.price_volume_source.health_status();
        let oi = self.oi_source.health_status();
        ProviderHealth {
            identity: self.identity(),
            state: if pv.state == ConnectionState::Connected || oi.state == ConnectionState::Connected {
                ConnectionState::Connected
            } else {
                pv.state
            },
            subscribed_symbols: pv.subscribed_symbols.max(oi.subscribed_symbols),
            error_count: pv.error_count + oi.error_count,
            last_update_ms: {
                let v = self.merge.last_update_ms.load(Ordering::Acquire);
                if v == 0 {
                    None
                } else {
                    Some(v)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType as MT;
    use std::sync::Mutex;

    struct StubProvider {
        identity: ProviderIdentity,
        callback: RwLock<Option<UpdateCallback>>,
    }

    impl StubProvider {
        fn new(exchange: &str) -> Self {
            Self {
                identity: ProviderIdentity::new(exchange, MT::Futures),
                callback: RwLock::new(None),
            }
        }

        fn push(&self, update: MarketUpdate) {
            if let Some(cb) = self.callback.read().as_ref() {
                cb(update);
            }
        }
    }

    #[async_trait]
    impl VenueProvider for StubProvider {
        fn identity(&self) -> ProviderIdentity {
            self.identity.clone()
        }
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
        async fn subscribe(&self, _symbols: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn unsubscribe(&self, _symbols: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn available_symbols(&self) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn on_update(&self, callback: UpdateCallback) {
            *self.callback.write() = Some(callback);
        }
        fn health_status(&self) -> ProviderHealth {
            ProviderHealth {
                identity: self.identity.clone(),
                state: ConnectionState::Connected,
                subscribed_symbols: 0,
                error_count: 0,
                last_update_ms: None,
            }
        }
    }

    #[test]
    fn merges_price_and_oi_within_staleness_window() {
        let pv_stub = Arc::new(StubProvider::new("binance"));
        let oi_stub = Arc::new(StubProvider::new("bybit"));
        let pv_identity = pv_stub.identity();
        let oi_identity = oi_stub.identity();
        let hybrid = HybridProvider::new("binance-bybit-hybrid", pv_stub.clone(), oi_stub.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        hybrid.on_update(Box::new(move |u| seen2.lock().unwrap().push(u)));

        pv_stub.push(MarketUpdate::new(pv_identity, "BTCUSDT", 1000).with_price(50_000.0));
        oi_stub.push(MarketUpdate::new(oi_identity, "BTCUSDT", 1500).with_open_interest(12_345.0, 1500));

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 2);
        let merged = &events[1];
        assert_eq!(merged.price, Some(50_000.0));
        assert_eq!(merged.open_interest, Some(12_345.0));
    }
}
