// =============================================================================
// Ingestion Gateway — registers providers, routes updates into the stores
// =============================================================================
//
// Generalizes a `main.rs` provider-spawn loop (one `tokio::spawn` per
// connector, "succeed if at least one connects", a periodic health log)
// into a reusable registrar. Every provider's `onUpdate` callback funnels
// through one closure here: write `MarketState` and `BucketStore`, then
// notify the `TriggerEvaluator` of the affected symbol.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::bucket_store::BucketStore;
use crate::evaluator::TriggerEvaluator;
use crate::market_state::MarketState;
use crate::providers::{ProviderHealth, VenueProvider};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Holds the registered providers and fans their updates into the
/// aggregation stores and the trigger evaluator.
pub struct IngestionGateway {
    providers: Vec<Arc<dyn VenueProvider>>,
    buckets: Arc<BucketStore>,
    market: Arc<MarketState>,
    evaluator: Arc<TriggerEvaluator>,
    symbol_check_interval_ms: AtomicI64,
}

impl IngestionGateway {
    pub fn new(buckets: Arc<BucketStore>, market: Arc<MarketState>, evaluator: Arc<TriggerEvaluator>) -> Self {
        Self {
            providers: Vec::new(),
            buckets,
            market,
            evaluator,
            symbol_check_interval_ms: AtomicI64::new(5_000),
        }
    }

    /// Register `provider`, wiring its `onUpdate` callback into the
    /// aggregation pipeline. Must be called before [`Self::connect`].
    pub fn register_provider(&mut self, provider: Arc<dyn VenueProvider>) {
        let buckets = self.buckets.clone();
        let market = self.market.clone();
        let evaluator = self.evaluator.clone();

        provider.on_update(Box::new(move |update| {
            if !update.is_well_formed() {
                warn!(symbol = %update.symbol, "dropping malformed market update");
                return;
            }

            let last_price_fallback = market.get_price(&update.symbol);
            let last_oi_fallback = market.get_oi(&update.symbol);

            market.update(&update.symbol, update.timestamp_ms, update.price, update.open_interest);

            let outcome = buckets.add_point(&update.symbol, &update, last_price_fallback, last_oi_fallback);
            if outcome.out_of_order {
                market.mark_out_of_order(&update.symbol);
            }

            let price_now = update.price.or(last_price_fallback);
            evaluator.on_price_update(&update.symbol, price_now, update.timestamp_ms);
        }));

        self.providers.push(provider);
    }

    pub fn active_providers(&self) -> Vec<Arc<dyn VenueProvider>> {
        self.providers.iter().filter(|p| p.is_connected()).cloned().collect()
    }

    pub fn providers_health(&self) -> Vec<ProviderHealth> {
        self.providers.iter().map(|p| p.health_status()).collect()
    }

    /// Connect every registered provider concurrently. Success is declared
    /// if at least one provider connects; otherwise the error from the
    /// first failure is returned.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let results = futures_util::future::join_all(self.providers.iter().map(|p| p.connect())).await;

        let mut connected = 0;
        let mut first_error = None;
        for (provider, result) in self.providers.iter().zip(results) {
            match result {
                Ok(()) => {
                    connected += 1;
                    info!(provider = %provider.identity(), "provider connected");
                }
                Err(e) => {
                    warn!(provider = %provider.identity(), error = %e, "provider failed to connect");
                    first_error.get_or_insert(e);
                }
            }
        }

        if connected == 0 && !self.providers.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        futures_util::future::join_all(self.providers.iter().map(|p| p.disconnect())).await;
    }

    /// Spawn the periodic (5 min) health-snapshot logger.
    pub fn spawn_health_logger(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
            loop {
                ticker.tick().await;
                for health in this.providers_health() {
                    info!(
                        provider = %health.identity,
                        state = ?health.state,
                        subscribed_symbols = health.subscribed_symbols,
                        error_count = health.error_count,
                        last_update_ms = ?health.last_update_ms,
                        "provider health snapshot"
                    );
                }
            }
        })
    }

    pub fn symbol_check_interval_ms(&self) -> i64 {
        self.symbol_check_interval_ms.load(Ordering::Relaxed)
    }

    pub fn set_symbol_check_interval_ms(&self, ms: i64) {
        self.symbol_check_interval_ms.store(ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvaluatorConfig;
    use crate::notifier::NotificationPipeline;
    use crate::providers::{ConnectionState, UpdateCallback};
    use crate::registry::{InMemorySignalRepository, InMemoryTriggerRepository, RecordingChatSink, TriggerRegistry};
    use crate::types::{MarketType, MarketUpdate, ProviderIdentity};
    use async_trait::async_trait;
    use parking_lot::RwLock;

    struct StubProvider {
        identity: ProviderIdentity,
        callback: RwLock<Option<UpdateCallback>>,
    }

    impl StubProvider {
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

    fn make_gateway() -> (IngestionGateway, Arc<BucketStore>, Arc<MarketState>) {
        let buckets = Arc::new(BucketStore::new(300, 70));
        let market = Arc::new(MarketState::new(100));
        let repo = Arc::new(InMemoryTriggerRepository::new());
        let registry = Arc::new(TriggerRegistry::new(repo));
        let notifier = Arc::new(NotificationPipeline::new(Arc::new(RecordingChatSink::new())));
        let signals = Arc::new(InMemorySignalRepository::new());
        let evaluator = Arc::new(TriggerEvaluator::new(
            buckets.clone(),
            market.clone(),
            registry,
            notifier,
            signals,
            EvaluatorConfig::default(),
        ));
        let gateway = IngestionGateway::new(buckets.clone(), market.clone(), evaluator);
        (gateway, buckets, market)
    }

    #[test]
    fn routed_update_lands_in_market_state_and_bucket_store() {
        let (mut gateway, buckets, market) = make_gateway();
        let stub = Arc::new(StubProvider {
            identity: ProviderIdentity::new("binance", MarketType::Futures),
            callback: RwLock::new(None),
        });
        gateway.register_provider(stub.clone());

        let mut update = MarketUpdate::new(ProviderIdentity::new("binance", MarketType::Futures), "BTCUSDT", 1000);
        update.price = Some(50_000.0);
        update.open_interest = Some(10.0);
        stub.push(update);

        assert_eq!(market.get_price("BTCUSDT"), Some(50_000.0));
        assert_eq!(buckets.history_length("BTCUSDT"), 2);
    }

    #[test]
    fn malformed_update_is_dropped() {
        let (mut gateway, _buckets, market) = make_gateway();
        let stub = Arc::new(StubProvider {
            identity: ProviderIdentity::new("binance", MarketType::Futures),
            callback: RwLock::new(None),
        });
        gateway.register_provider(stub.clone());

        let mut update = MarketUpdate::new(ProviderIdentity::new("binance", MarketType::Futures), "btcusdt", 1000);
        update.price = Some(50_000.0);
        stub.push(update);

        assert_eq!(market.get_price("btcusdt"), None);
    }

    #[tokio::test]
    async fn connect_succeeds_when_at_least_one_provider_connects() {
        let (mut gateway, _buckets, _market) = make_gateway();
        let stub = Arc::new(StubProvider {
            identity: ProviderIdentity::new("binance", MarketType::Futures),
            callback: RwLock::new(None),
        });
        gateway.register_provider(stub);
        assert!(gateway.connect().await.is_ok());
    }
}
