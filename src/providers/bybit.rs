// =============================================================================
// Bybit provider — `v5/public/linear` tickers + publicTrade over one socket
// =============================================================================
//
// Unlike Binance, a single Bybit WebSocket carries every subscribed topic, so
// this provider keeps one connection and multiplexes the `tickers.<SYMBOL>`
// (price + OI, no REST poller needed) and `publicTrade.<SYMBOL>` (aggressive
// volume) topics over it rather than one socket per stream kind.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, instrument, warn};

use crate::error::IngestError;
use crate::providers::{ConnectionState, ProviderHealth, UpdateCallback, VenueProvider};
use crate::types::{is_valid_symbol_shape, MarketType, MarketUpdate, ProviderIdentity};

const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const REST_BASE: &str = "https://api.bybit.com";
const AGGRESSIVE_FLUSH_MS: u64 = 120;
const MIN_QUOTE_NOTIONAL: f64 = 250.0;
const SUBSCRIBE_BATCH: usize = 50;

#[derive(Default)]
struct VolumeAccumulator {
    taker_buy_base: f64,
    taker_buy_quote: f64,
    taker_sell_base: f64,
    taker_sell_quote: f64,
}

struct Shared {
    state: RwLock<ConnectionState>,
    intentional_disconnect: AtomicBool,
    error_count: AtomicU64,
    last_update_ms: AtomicI64,
    symbols: RwLock<HashSet<String>>,
    callback: RwLock<Option<UpdateCallback>>,
    accumulators: DashMap<String, VolumeAccumulator>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

/// Bybit linear-perpetual market-data connector.
pub struct BybitLinearProvider {
    shared: Arc<Shared>,
    http: reqwest::Client,
}

impl BybitLinearProvider {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                intentional_disconnect: AtomicBool::new(false),
                error_count: AtomicU64::new(0),
                last_update_ms: AtomicI64::new(0),
                symbols: RwLock::new(HashSet::new()),
                callback: RwLock::new(None),
                accumulators: DashMap::new(),
                tasks: AsyncMutex::new(Vec::new()),
            }),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    fn identity() -> ProviderIdentity {
        ProviderIdentity::new("bybit", MarketType::Futures)
    }

    #[instrument(skip(self), name = "bybit_linear::fetch_catalog")]
    async fn fetch_catalog(&self) -> anyhow::Result<Vec<String>> {
        let url = format!("{REST_BASE}/v5/market/instruments-info?category=linear");
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(IngestError::Transport(format!("instruments-info returned {}", resp.status())).into());
        }
        let body: serde_json::Value = resp.json().await?;
        let symbols = body["result"]["list"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s["quoteCoin"].as_str() == Some("USDT"))
            .filter(|s| s["status"].as_str() == Some("Trading"))
            .filter_map(|s| s["symbol"].as_str().map(str::to_string))
            .filter(|s| is_valid_symbol_shape(s))
            .collect();
        Ok(symbols)
    }

    async fn track_task(shared: &Arc<Shared>, handle: JoinHandle<()>) {
        shared.tasks.lock().await.push(handle);
    }

    fn spawn_connection(&self, symbols: Vec<String>) {
        let shared = self.shared.clone();
        let tracking = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut backoff_ms = 5_000u64;
            loop {
                if shared.intentional_disconnect.load(Ordering::Acquire) {
                    return;
                }
                *shared.state.write() = ConnectionState::Connecting;
                match run_connection_once(shared.clone(), symbols.clone()).await {
                    Ok(()) => {
                        backoff_ms = 5_000;
                        if shared.intentional_disconnect.load(Ordering::Acquire) {
                            return;
                        }
                        *shared.state.write() = ConnectionState::Reconnecting;
                    }
                    Err(e) => {
                        shared.error_count.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, backoff_ms, "bybit stream error, reconnecting");
                        *shared.state.write() = ConnectionState::Reconnecting;
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(60_000);
                    }
                }
            }
        });
        tokio::spawn(async move { Self::track_task(&tracking, handle).await });
    }

    fn spawn_flush_timer(&self) {
        let shared = self.shared.clone();
        let tracking = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(AGGRESSIVE_FLUSH_MS));
            loop {
                ticker.tick().await;
                if shared.intentional_disconnect.load(Ordering::Acquire) {
                    return;
                }
                let mut flushed = Vec::new();
                shared.accumulators.retain(|symbol, acc| {
                    let total_quote = acc.taker_buy_quote + acc.taker_sell_quote;
                    if total_quote >= MIN_QUOTE_NOTIONAL {
                        flushed.push((symbol.clone(), acc.taker_buy_base, acc.taker_sell_base, acc.taker_buy_quote, acc.taker_sell_quote));
                    }
                    false
                });
                for (symbol, buy, sell, buy_quote, sell_quote) in flushed {
                    let mut update = MarketUpdate::new(BybitLinearProvider::identity(), symbol, now_ms());
                    update = update.with_aggressive_volume(buy, sell, buy_quote, sell_quote);
                    if let Some(cb) = shared.callback.read().as_ref() {
                        cb(update);
                    }
                }
            }
        });
        tokio::spawn(async move { Self::track_task(&tracking, handle).await });
    }
}

impl Default for BybitLinearProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn run_connection_once(shared: Arc<Shared>, symbols: Vec<String>) -> anyhow::Result<()> {
    info!(url = WS_URL, "connecting to bybit linear stream");
    let (ws_stream, _) = connect_async(WS_URL).await?;
    *shared.state.write() = ConnectionState::Connected;
    let (mut write, mut read) = ws_stream.split();

    let mut topics: Vec<String> = Vec::new();
    for s in &symbols {
        topics.push(format!("tickers.{s}"));
        topics.push(format!("publicTrade.{s}"));
    }
    for batch in topics.chunks(SUBSCRIBE_BATCH) {
        let req = serde_json::json!({ "op": "subscribe", "args": batch });
        write.send(Message::Text(req.to_string())).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut ping_interval = tokio::time::interval(Duration::from_secs(20));
    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                let ping = serde_json::json!({ "op": "ping" });
                if write.send(Message::Text(ping.to_string())).await.is_err() {
                    return Err(IngestError::Transport("bybit ping failed".into()).into());
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_message(&shared, &text),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(IngestError::Transport(format!("bybit stream read error: {e}")).into()),
                    None => {
                        warn!("bybit stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle_message(shared: &Arc<Shared>, text: &str) {
    let Ok(root) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    let Some(topic) = root["topic"].as_str() else {
        return;
    };

    if let Some(symbol) = topic.strip_prefix("tickers.") {
        if let Some(update) = parse_ticker(symbol, &root["data"]) {
            shared.last_update_ms.store(update.timestamp_ms, Ordering::Release);
            if let Some(cb) = shared.callback.read().as_ref() {
                cb(update);
            }
        }
    } else if topic.strip_prefix("publicTrade.").is_some() {
        if let Some(trades) = root["data"].as_array() {
            for t in trades {
                apply_trade(shared, t);
            }
        }
    }
}

fn parse_ticker(symbol: &str, data: &serde_json::Value) -> Option<MarketUpdate> {
    if !is_valid_symbol_shape(symbol) {
        return None;
    }
    let price: Option<f64> = data["lastPrice"].as_str().and_then(|s| s.parse().ok());
    let oi: Option<f64> = data["openInterest"].as_str().and_then(|s| s.parse().ok());
    let volume: Option<f64> = data["volume24h"].as_str().and_then(|s| s.parse().ok());
    let quote_volume: Option<f64> = data["turnover24h"].as_str().and_then(|s| s.parse().ok());

    if price.is_none() && oi.is_none() {
        return None;
    }

    let ts = now_ms();
    let mut update = MarketUpdate::new(BybitLinearProvider::identity(), symbol, ts);
    if let Some(p) = price.filter(|p| p.is_finite() && *p > 0.0) {
        update = update.with_price(p);
    }
    if let Some(o) = oi.filter(|o| o.is_finite() && *o >= 0.0) {
        update = update.with_open_interest(o, ts);
    }
    update.volume = volume;
    update.quote_volume = quote_volume;
    Some(update)
}

fn apply_trade(shared: &Arc<Shared>, trade: &serde_json::Value) {
    let Some(symbol) = trade["s"].as_str() else { return };
    let Some(price) = trade["p"].as_str().and_then(|s| s.parse::<f64>().ok()) else {
        return;
    };
    let Some(qty) = trade["v"].as_str().and_then(|s| s.parse::<f64>().ok()) else {
        return;
    };
    let is_sell = trade["S"].as_str() == Some("Sell");
    let quote = price * qty;

    let mut acc = shared.accumulators.entry(symbol.to_string()).or_default();
    if is_sell {
        acc.taker_sell_base += qty;
        acc.taker_sell_quote += quote;
    } else {
        acc.taker_buy_base += qty;
        acc.taker_buy_quote += quote;
    }
}

#[async_trait]
impl VenueProvider for BybitLinearProvider {
    fn identity(&self) -> ProviderIdentity {
        Self::identity()
    }

    #[instrument(skip(self), name = "bybit_linear::connect")]
    async fn connect(&self) -> anyhow::Result<()> {
        self.shared.intentional_disconnect.store(false, Ordering::Release);
        *self.shared.state.write() = ConnectionState::Connecting;

        let symbols: Vec<String> = self.shared.symbols.read().iter().cloned().collect();
        if symbols.is_empty() {
            return Err(IngestError::ConnectFailed("no subscribed symbols".into()).into());
        }

        self.spawn_connection(symbols);
        self.spawn_flush_timer();

        *self.shared.state.write() = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.intentional_disconnect.store(true, Ordering::Release);
        let mut tasks = self.shared.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        *self.shared.state.write() = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        *self.shared.state.read() == ConnectionState::Connected
    }

    async fn subscribe(&self, symbols: &[String]) -> anyhow::Result<()> {
        let mut set = self.shared.symbols.write();
        for s in symbols {
            if is_valid_symbol_shape(s) {
                set.insert(s.clone());
            } else {
                let err = IngestError::SubscriptionRejected {
                    symbol: s.clone(),
                    reason: "invalid symbol shape".to_string(),
                };
                warn!(error = %err, "rejected subscription");
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> anyhow::Result<()> {
        let mut set = self.shared.symbols.write();
        for s in symbols {
            set.remove(s);
        }
        Ok(())
    }

    async fn available_symbols(&self) -> anyhow::Result<Vec<String>> {
        self.fetch_catalog().await
    }

    fn on_update(&self, callback: UpdateCallback) {
        *self.shared.callback.write() = Some(callback);
    }

    fn health_status(&self) -> ProviderHealth {
        ProviderHealth {
            identity: self.identity(),
            state: *self.shared.state.read(),
            subscribed_symbols: self.shared.symbols.read().len(),
            error_count: self.shared.error_count.load(Ordering::Relaxed),
            last_update_ms: {
                let v = self.shared.last_update_ms.load(Ordering::Acquire);
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

    #[test]
    fn parses_ticker_with_oi_and_price() {
        let data = serde_json::json!({
            "lastPrice": "50000.0",
            "openInterest": "12345.6",
            "volume24h": "100.0",
            "turnover24h": "5000000.0",
        });
        let update = parse_ticker("BTCUSDT", &data).unwrap();
        assert_eq!(update.price, Some(50_000.0));
        assert_eq!(update.open_interest, Some(12_345.6));
    }

    #[test]
    fn parse_ticker_rejects_bad_symbol_shape() {
        let data = serde_json::json!({ "lastPrice": "1.0" });
        assert!(parse_ticker("btcusdt", &data).is_none());
    }

    #[test]
    fn handle_message_routes_trade_into_accumulator() {
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Connected),
            intentional_disconnect: AtomicBool::new(false),
            error_count: AtomicU64::new(0),
            last_update_ms: AtomicI64::new(0),
            symbols: RwLock::new(HashSet::new()),
            callback: RwLock::new(None),
            accumulators: DashMap::new(),
            tasks: AsyncMutex::new(Vec::new()),
        });
        let msg = serde_json::json!({
            "topic": "publicTrade.BTCUSDT",
            "data": [{ "s": "BTCUSDT", "p": "50000.0", "v": "0.1", "S": "Buy" }]
        });
        handle_message(&shared, &msg.to_string());
        let acc = shared.accumulators.get("BTCUSDT").unwrap();
        assert_eq!(acc.taker_buy_base, 0.1);
    }
}
