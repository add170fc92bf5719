// =============================================================================
// oi-sentry — Main Entry Point
// =============================================================================
//
// Composition root: dotenv, `tracing_subscriber::fmt().with_env_filter(...)`,
// one `tokio::spawn` per subsystem, a final `ctrl_c()` wait for graceful
// shutdown.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use oi_sentry::bucket_store::BucketStore;
use oi_sentry::config::{self, RuntimeConfig};
use oi_sentry::error::ConfigError;
use oi_sentry::evaluator::{EvaluatorConfig, TriggerEvaluator};
use oi_sentry::health;
use oi_sentry::ingestion::IngestionGateway;
use oi_sentry::market_state::MarketState;
use oi_sentry::notifier::NotificationPipeline;
use oi_sentry::providers::binance::BinanceFuturesProvider;
use oi_sentry::providers::bybit::BybitLinearProvider;
use oi_sentry::providers::hybrid::HybridProvider;
use oi_sentry::providers::VenueProvider;
use oi_sentry::registry::{InMemorySignalRepository, InMemoryTriggerRepository, RecordingChatSink, TriggerRegistry};

/// Build the concrete provider for one configured exchange name. Unknown
/// exchanges are skipped with a warning rather than aborting startup (spec
/// §7 class 6).
fn build_provider(exchange: &str) -> Option<Arc<dyn VenueProvider>> {
    match exchange {
        "binance" => Some(Arc::new(BinanceFuturesProvider::new())),
        "bybit" => Some(Arc::new(BybitLinearProvider::new())),
        "binance-bybit-hybrid" | "hybrid" => Some(Arc::new(HybridProvider::new(
            "binance-bybit-hybrid",
            Arc::new(BinanceFuturesProvider::new()),
            Arc::new(BybitLinearProvider::new()),
        ))),
        other => {
            warn!(exchange = other, "unknown exchange, skipping provider");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    let config = RuntimeConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())))
        .init();

    info!("oi-sentry starting up");
    info!(providers = ?config.providers, "configured venue providers");

    // ── Aggregation stores ────────────────────────────────────────────────
    let buckets = Arc::new(BucketStore::new(config.max_15s_buckets, config.max_minute_buckets));
    let market = Arc::new(MarketState::new(config.max_tracked_symbols));

    // ── External-store abstractions (in-memory references by default) ─────
    let trigger_repo = Arc::new(InMemoryTriggerRepository::new());
    let registry = Arc::new(TriggerRegistry::new(trigger_repo));
    if let Err(e) = registry.init().await {
        error!(error = %e, "trigger registry failed to initialize from its backing store, exiting");
        std::process::exit(1);
    }

    let signals = Arc::new(InMemorySignalRepository::new());
    let chat_sink = Arc::new(RecordingChatSink::new());
    let notifier = Arc::new(NotificationPipeline::new(chat_sink));

    let evaluator = Arc::new(TriggerEvaluator::new(
        buckets.clone(),
        market.clone(),
        registry.clone(),
        notifier.clone(),
        signals,
        EvaluatorConfig {
            batch_processing_size: config.batch_processing_size,
            flush_ms: config.trigger_engine_flush_ms,
            metric_cache_ttl_ms: config.trigger_engine_metric_cache_ttl_ms as i64,
            base_check_interval_ms: config.min_check_interval_ms as i64,
            debounce_threshold: config.trigger_engine_debounce_threshold,
        },
    ));

    // ── Ingestion gateway ───────────────────────────────────────────────────
    let mut gateway = IngestionGateway::new(buckets.clone(), market.clone(), evaluator.clone());

    let mut provider_specs = config.providers.clone();
    if provider_specs.is_empty() {
        warn!(error = %ConfigError::NoProviders, "falling back to a default binance provider");
        provider_specs.push(config::ProviderSpec {
            exchange: "binance".to_string(),
            market_type: None,
        });
    }

    let mut providers: Vec<Arc<dyn VenueProvider>> = Vec::new();
    for spec in &provider_specs {
        if let Some(provider) = build_provider(&spec.exchange) {
            providers.push(provider);
        }
    }

    for provider in &providers {
        gateway.register_provider(provider.clone());
        match provider.available_symbols().await {
            Ok(symbols) => {
                let capped: Vec<String> = symbols.into_iter().take(config.max_tracked_symbols).collect();
                if let Err(e) = provider.subscribe(&capped).await {
                    warn!(provider = %provider.identity(), error = %e, "subscribe failed");
                }
            }
            Err(e) => {
                warn!(provider = %provider.identity(), error = %e, "failed to fetch instrument catalog");
            }
        }
    }

    let gateway = Arc::new(gateway);
    if let Err(e) = gateway.connect().await {
        warn!(error = %e, "every configured provider failed to connect, continuing with zero feeds");
    }
    let _health_logger = gateway.spawn_health_logger();

    // ── Periodic symbol maintenance (TTL + cap eviction) ───────────────────
    {
        let market = market.clone();
        let buckets = buckets.clone();
        let interval_ms = config.symbol_check_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp_millis();
                market.maintenance(now, |symbol| buckets.cleanup_symbol(symbol));
            }
        });
    }

    // ── Trigger evaluator + notification pipeline background loops ────────
    let (flush_handle, housekeeping_handle) = evaluator.clone().run();
    let notifier_handle = notifier.clone().run();

    // ── HTTP health endpoint ────────────────────────────────────────────────
    {
        let gateway = gateway.clone();
        let bind_addr = config.bind_addr.clone();
        tokio::spawn(async move {
            let app = health::router(gateway);
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "health endpoint listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        warn!(error = %e, "health server exited");
                    }
                }
                Err(e) => warn!(addr = %bind_addr, error = %e, "failed to bind health endpoint"),
            }
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    evaluator.stop();
    flush_handle.abort();
    housekeeping_handle.abort();
    notifier_handle.abort();
    gateway.disconnect().await;

    info!("oi-sentry shut down complete");
    Ok(())
}
