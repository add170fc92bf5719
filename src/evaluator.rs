// =============================================================================
// Trigger Evaluator — debounced push evaluation of active triggers
// =============================================================================
//
// Shaped after `exit::monitor::run_exit_monitor`'s periodic-tick loop (an
// `interval` ticker, "collect work under a lock then release before acting"
// to keep async calls outside the lock, structured `tracing` fields per
// decision). Generalized from a fixed poll over open positions to a
// debounced push: the ingestion gateway feeds symbol updates into a
// `pending` map and a single re-armable flush timer drains it in batches.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::bucket_store::BucketStore;
use crate::market_state::MarketState;
use crate::metrics::MetricsCalculator;
use crate::notifier::NotificationPipeline;
use crate::registry::{SignalRepository, TriggerRegistry};
use crate::types::{Direction, Signal, Trigger};

/// Key identifying one (trigger, symbol) rate-gate / fire-count slot.
type CheckKey = (String, String);

struct PendingEntry {
    latest_price: Option<f64>,
    queued_at_ms: i64,
}

struct RateGateState {
    last_check_ms: i64,
    fire_count: u32,
}

struct CachedMetric {
    metrics: crate::types::Metrics,
    price_at_cache: Option<f64>,
    cached_at_ms: i64,
}

/// Evaluator tunables; mirrors the matching fields on
/// [`crate::config::RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub batch_processing_size: usize,
    pub flush_ms: u64,
    pub metric_cache_ttl_ms: i64,
    pub base_check_interval_ms: i64,
    pub debounce_threshold: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            batch_processing_size: 10,
            flush_ms: 200,
            metric_cache_ttl_ms: 500,
            base_check_interval_ms: 1000,
            debounce_threshold: 3,
        }
    }
}

const HOUSEKEEPING_INTERVAL_MS: i64 = 10 * 60 * 1000;
const RATE_GATE_STALE_MS: i64 = 30 * 60 * 1000;

/// `dynamicInterval(n) = baseMs * 2^min(n - debounceThreshold + 1, 8)` for
/// `n >= debounceThreshold`, else `baseMs`.
fn dynamic_interval_ms(fire_count: u32, cfg: &EvaluatorConfig) -> i64 {
    if fire_count >= cfg.debounce_threshold {
        let exponent = (fire_count - cfg.debounce_threshold + 1).min(8);
        cfg.base_check_interval_ms * (1i64 << exponent)
    } else {
        cfg.base_check_interval_ms
    }
}

/// `true` if the metric cache entry must be refreshed early: price has moved
/// by more than `max(threshold/200, 0.005)` since the value was cached.
fn needs_early_invalidation(cached_price: Option<f64>, price_now: Option<f64>, threshold: f64) -> bool {
    match (cached_price, price_now) {
        (Some(cached), Some(now)) if now != 0.0 => {
            let bound = (threshold / 200.0).max(0.005);
            ((now - cached) / now).abs() > bound
        }
        _ => false,
    }
}

pub struct TriggerEvaluator {
    buckets: Arc<BucketStore>,
    market: Arc<MarketState>,
    registry: Arc<TriggerRegistry>,
    notifier: Arc<NotificationPipeline>,
    signals: Arc<dyn SignalRepository>,
    config: EvaluatorConfig,

    pending: RwLock<HashMap<String, PendingEntry>>,
    rate_gate: DashMap<CheckKey, RateGateState>,
    metric_cache: DashMap<(String, u32), CachedMetric>,
    in_flight: DashMap<CheckKey, ()>,
}

impl TriggerEvaluator {
    pub fn new(
        buckets: Arc<BucketStore>,
        market: Arc<MarketState>,
        registry: Arc<TriggerRegistry>,
        notifier: Arc<NotificationPipeline>,
        signals: Arc<dyn SignalRepository>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            buckets,
            market,
            registry,
            notifier,
            signals,
            config,
            pending: RwLock::new(HashMap::new()),
            rate_gate: DashMap::new(),
            metric_cache: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Called by the ingestion gateway whenever an update lands for
    /// `symbol`. Records the symbol and its latest price for the next
    /// flush; does not evaluate synchronously.
    pub fn on_price_update(&self, symbol: &str, price: Option<f64>, now_ms: i64) {
        self.pending.write().insert(
            symbol.to_string(),
            PendingEntry {
                latest_price: price,
                queued_at_ms: now_ms,
            },
        );
    }

    /// Drain up to `batch_processing_size` pending symbols and evaluate
    /// each against the active trigger set. Called every `flush_ms` by
    /// [`Self::run`].
    pub async fn flush(&self, now_ms: i64) {
        let batch: Vec<(String, Option<f64>)> = {
            let mut pending = self.pending.write();
            let take: Vec<String> = pending
                .keys()
                .take(self.config.batch_processing_size)
                .cloned()
                .collect();
            take.into_iter()
                .filter_map(|symbol| pending.remove(&symbol).map(|e| (symbol, e.latest_price)))
                .collect()
        };
        if batch.is_empty() {
            return;
        }

        let triggers = self.registry.get_all_active();
        if triggers.is_empty() {
            return;
        }

        for (symbol, price_now) in batch {
            let relevant: Vec<&Trigger> = triggers.iter().filter(|t| t.is_active).collect();
            for trigger in relevant {
                self.evaluate_one(trigger, &symbol, price_now, now_ms).await;
            }
        }
    }

    async fn evaluate_one(&self, trigger: &Trigger, symbol: &str, price_now: Option<f64>, now_ms: i64) {
        let key: CheckKey = (trigger.id.clone(), symbol.to_string());

        if self.in_flight.contains_key(&key) {
            return;
        }

        if let Some(state) = self.rate_gate.get(&key) {
            let interval = dynamic_interval_ms(state.fire_count, &self.config);
            if now_ms - state.last_check_ms < interval {
                return;
            }
        }

        self.in_flight.insert(key.clone(), ());

        let metrics = self.metric_for(symbol, trigger.time_interval_minutes, price_now, trigger.oi_change_percent, now_ms);

        self.rate_gate
            .entry(key.clone())
            .and_modify(|s| s.last_check_ms = now_ms)
            .or_insert(RateGateState {
                last_check_ms: now_ms,
                fire_count: 0,
            });

        let Some(metrics) = metrics else {
            if let Some(mut s) = self.rate_gate.get_mut(&key) {
                s.fire_count = 0;
            }
            self.in_flight.remove(&key);
            return;
        };

        let fires = match trigger.direction {
            Direction::Up => metrics.oi_change_percent >= trigger.oi_change_percent,
            Direction::Down => metrics.oi_change_percent <= -trigger.oi_change_percent,
        };

        if !fires {
            if let Some(mut s) = self.rate_gate.get_mut(&key) {
                s.fire_count = 0;
            }
            self.in_flight.remove(&key);
            return;
        }

        if let Some(mut state) = self.rate_gate.get_mut(&key) {
            state.fire_count += 1;
        }

        if !self.notifier.cooldown_ok(trigger, symbol, now_ms) {
            debug!(trigger_id = %trigger.id, symbol, "trigger fired but in cooldown");
            self.in_flight.remove(&key);
            return;
        }

        let prior = self
            .signals
            .count24h(&trigger.id, symbol)
            .await
            .unwrap_or(0);
        let signal = Signal {
            trigger_id: trigger.id.clone(),
            user_id: trigger.user_id.clone(),
            symbol: symbol.to_string(),
            signal_number: prior + 1,
            oi_change_percent: metrics.oi_change_percent,
            price_change_percent: metrics.price_change_percent,
            current_price: metrics.current_price,
            created_at: chrono::Utc::now(),
        };

        if let Err(e) = self.signals.save(&signal).await {
            warn!(error = %e, trigger_id = %trigger.id, "failed to persist signal, suppressing notification");
            self.in_flight.remove(&key);
            return;
        }

        self.notifier.record_fire(trigger, symbol, now_ms);

        let rendered = render_signal(&signal, trigger.time_interval_minutes);
        self.notifier
            .enqueue(&trigger.user_id, &rendered, Some(&signal), now_ms);

        info!(
            trigger_id = %trigger.id,
            symbol,
            oi_change_percent = metrics.oi_change_percent,
            signal_number = signal.signal_number,
            "trigger fired"
        );

        self.in_flight.remove(&key);
    }

    fn metric_for(
        &self,
        symbol: &str,
        interval_minutes: u32,
        price_now: Option<f64>,
        threshold: f64,
        now_ms: i64,
    ) -> Option<crate::types::Metrics> {
        let cache_key = (symbol.to_string(), interval_minutes);

        if let Some(cached) = self.metric_cache.get(&cache_key) {
            let fresh = now_ms - cached.cached_at_ms < self.config.metric_cache_ttl_ms;
            let invalidated = needs_early_invalidation(cached.price_at_cache, price_now, threshold);
            if fresh && !invalidated {
                return Some(cached.metrics.clone());
            }
        }

        let calc = MetricsCalculator::new(&self.buckets, &self.market);
        let metrics = calc.metric_changes(symbol, interval_minutes, now_ms)?;

        self.metric_cache.insert(
            cache_key,
            CachedMetric {
                metrics: metrics.clone(),
                price_at_cache: price_now.or(metrics.current_price),
                cached_at_ms: now_ms,
            },
        );

        Some(metrics)
    }

    /// Purge stale `(trigger, symbol)` rate-gate entries (>30 min untouched)
    /// and delegate notification-cooldown purging to the pipeline (spec
    /// §4.6 background housekeeping).
    pub fn housekeeping(&self, now_ms: i64) {
        self.rate_gate
            .retain(|_, state| now_ms - state.last_check_ms <= RATE_GATE_STALE_MS);
        self.metric_cache
            .retain(|_, cached| now_ms - cached.cached_at_ms <= RATE_GATE_STALE_MS);
        self.notifier.purge_stale_cooldowns(now_ms);
    }

    /// Spawn the flush-timer and housekeeping-timer background tasks.
    /// Returns both join handles so the caller can abort them on shutdown.
    pub fn run(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let flush_handle = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_millis(this.config.flush_ms));
                loop {
                    ticker.tick().await;
                    this.flush(now_ms()).await;
                }
            })
        };

        let housekeeping_handle = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_millis(HOUSEKEEPING_INTERVAL_MS as u64));
                loop {
                    ticker.tick().await;
                    this.housekeeping(now_ms());
                }
            })
        };

        (flush_handle, housekeeping_handle)
    }

    /// Discard the `pending` map and the metric cache. Called on shutdown,
    /// after the background tasks are stopped.
    pub fn stop(&self) {
        self.pending.write().clear();
        self.metric_cache.clear();
        self.rate_gate.clear();
    }
}

fn render_signal(signal: &Signal, interval_minutes: u32) -> String {
    match signal.price_change_percent {
        Some(price_pct) => format!(
            "{} OI {:+.2}% over {}m (price {:+.2}%) — signal #{}",
            signal.symbol, signal.oi_change_percent, interval_minutes, price_pct, signal.signal_number
        ),
        None => format!(
            "{} OI {:+.2}% over {}m — signal #{}",
            signal.symbol, signal.oi_change_percent, interval_minutes, signal.signal_number
        ),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemorySignalRepository, InMemoryTriggerRepository, RecordingChatSink};
    use crate::types::{MarketType, MarketUpdate, ProviderIdentity};

    fn make_evaluator() -> (Arc<TriggerEvaluator>, Arc<BucketStore>, Arc<MarketState>, Arc<TriggerRegistry>) {
        let buckets = Arc::new(BucketStore::new(300, 70));
        let market = Arc::new(MarketState::new(100));
        let repo = Arc::new(InMemoryTriggerRepository::new());
        let registry = Arc::new(TriggerRegistry::new(repo));
        let notifier = Arc::new(NotificationPipeline::new(Arc::new(RecordingChatSink::new())));
        let signals = Arc::new(InMemorySignalRepository::new());
        let evaluator = Arc::new(TriggerEvaluator::new(
            buckets.clone(),
            market.clone(),
            registry.clone(),
            notifier,
            signals,
            EvaluatorConfig::default(),
        ));
        (evaluator, buckets, market, registry)
    }

    fn feed(buckets: &BucketStore, market: &MarketState, symbol: &str, ts: i64, oi: f64, price: f64) {
        market.update(symbol, ts, Some(price), Some(oi));
        let mut u = MarketUpdate::new(ProviderIdentity::new("binance", MarketType::Futures), symbol, ts);
        u.open_interest = Some(oi);
        u.price = Some(price);
        buckets.add_point(symbol, &u, None, None);
    }

    #[tokio::test]
    async fn fires_on_oi_upswing_past_threshold() {
        let (evaluator, buckets, market, registry) = make_evaluator();
        registry
            .save(crate::types::TriggerSpec {
                user_id: "u1".into(),
                direction: Direction::Up,
                oi_change_percent: 5.0,
                time_interval_minutes: 1,
                notification_limit_seconds: 60,
            })
            .await
            .unwrap();

        for t in 0..=60 {
            let ts = t * 1000;
            let oi = 100.0 + (t as f64 / 60.0) * 6.0;
            feed(&buckets, &market, "BTCUSDT", ts, oi, 10.0);
        }

        evaluator.on_price_update("BTCUSDT", Some(10.0), 60_000);
        evaluator.flush(60_000).await;

        let stats = evaluator.notifier.stats();
        assert_eq!(
            stats.sent_total + stats.queued_high as u64 + stats.queued_normal as u64 + stats.queued_low as u64,
            1
        );
    }

    #[test]
    fn dynamic_interval_grows_past_debounce_threshold() {
        let cfg = EvaluatorConfig::default();
        assert_eq!(dynamic_interval_ms(0, &cfg), 1000);
        assert_eq!(dynamic_interval_ms(2, &cfg), 1000);
        assert_eq!(dynamic_interval_ms(3, &cfg), 2000);
        assert_eq!(dynamic_interval_ms(4, &cfg), 4000);
        assert_eq!(dynamic_interval_ms(100, &cfg), 1000 * (1 << 8));
    }

    #[test]
    fn early_invalidation_triggers_on_large_move() {
        assert!(!needs_early_invalidation(Some(100.0), Some(100.4), 5.0));
        assert!(needs_early_invalidation(Some(100.0), Some(103.0), 5.0));
    }

    #[test]
    fn housekeeping_purges_stale_rate_gate_entries() {
        let (evaluator, _buckets, _market, _registry) = make_evaluator();
        evaluator.rate_gate.insert(
            ("t1".into(), "BTCUSDT".into()),
            RateGateState {
                last_check_ms: 0,
                fire_count: 1,
            },
        );
        evaluator.housekeeping(RATE_GATE_STALE_MS + 1);
        assert!(evaluator.rate_gate.is_empty());
    }
}
