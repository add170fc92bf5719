// =============================================================================
// Binance futures provider — `!ticker@arr` + `@aggTrade` + OI poller
// =============================================================================
//
// Grounded on `binance::client::BinanceClient` (reqwest client shape,
// `#[instrument]` REST calls, `parse_str_f64` JSON-shape tolerance) and
// `market_data::trade_stream::run_trade_stream` (connect_async loop,
// `Some(Ok)/Some(Err)/None` read-loop dispatch). The signed-request half of
// that client (HMAC signing, order placement, balances) has no counterpart
// here — this provider only ever reads public market data — so it is not
// carried over.

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
use tracing::{debug, info, instrument, warn};

use crate::error::IngestError;
use crate::providers::{ConnectionState, ProviderHealth, UpdateCallback, VenueProvider};
use crate::types::{is_valid_symbol_shape, MarketType, MarketUpdate, ProviderIdentity};

const WS_BASE: &str = "wss://fstream.binance.com/stream?streams=";
const REST_BASE: &str = "https://fapi.binance.com";
const OI_STALENESS_MS: i64 = 90_000;
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
    oi_cache: DashMap<String, (f64, i64)>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

/// Binance USDⓈ-M futures market-data connector.
pub struct BinanceFuturesProvider {
    shared: Arc<Shared>,
    http: reqwest::Client,
}

impl BinanceFuturesProvider {
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
                oi_cache: DashMap::new(),
                tasks: AsyncMutex::new(Vec::new()),
            }),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    fn identity() -> ProviderIdentity {
        ProviderIdentity::new("binance", MarketType::Futures)
    }

    /// GET /fapi/v1/exchangeInfo, filtered to USDT-margined perpetuals with
    /// a valid symbol shape. Retried up to 5 times with linear backoff.
    #[instrument(skip(self), name = "binance_futures::fetch_catalog")]
    async fn fetch_catalog(&self) -> anyhow::Result<Vec<String>> {
        let url = format!("{REST_BASE}/fapi/v1/exchangeInfo");
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    let symbols = body["symbols"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|s| s["contractType"].as_str() == Some("PERPETUAL"))
                        .filter(|s| s["quoteAsset"].as_str() == Some("USDT"))
                        .filter_map(|s| s["symbol"].as_str().map(str::to_string))
                        .filter(|s| is_valid_symbol_shape(s))
                        .collect();
                    return Ok(symbols);
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), attempt, "exchangeInfo non-success response");
                }
                Err(e) => {
                    warn!(error = %e, attempt, "exchangeInfo request failed");
                }
            }
            if attempt >= 5 {
                return Err(IngestError::Transport("exchangeInfo fetch failed after 5 attempts".into()).into());
            }
            tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
        }
    }

    /// The most recent open-interest sample for `symbol`, if it hasn't gone
    /// stale (90s staleness window). Used by the hybrid provider when
    /// composing OI from this venue with price/volume from another.
    pub fn cached_oi(&self, symbol: &str) -> Option<f64> {
        self.shared.oi_cache.get(symbol).and_then(|entry| {
            let (oi, ts) = *entry;
            if now_ms() - ts <= OI_STALENESS_MS {
                Some(oi)
            } else {
                None
            }
        })
    }

    async fn track_task(shared: &Arc<Shared>, handle: JoinHandle<()>) {
        shared.tasks.lock().await.push(handle);
    }

    fn spawn_ticker_stream(&self, symbols: Vec<String>) {
        let shared = self.shared.clone();
        let tracking = self.shared.clone();
        let handle = tokio::spawn(async move {
            let shared_for_attempt = shared.clone();
            run_reconnect_loop(shared, "ticker", move || {
                let shared = shared_for_attempt.clone();
                let symbols = symbols.clone();
                Box::pin(async move { run_ticker_once(shared, symbols).await })
            })
            .await;
        });
        tokio::spawn(async move { Self::track_task(&tracking, handle).await });
    }

    fn spawn_trade_streams(&self, symbols: Vec<String>) {
        for symbol in symbols {
            let shared = self.shared.clone();
            let tracking = self.shared.clone();
            let sym = symbol.clone();
            let handle = tokio::spawn(async move {
                let shared_for_attempt = shared.clone();
                run_reconnect_loop(shared, "aggTrade", move || {
                    let shared = shared_for_attempt.clone();
                    let sym = sym.clone();
                    Box::pin(async move { run_agg_trade_once(shared, sym).await })
                })
                .await;
            });
            tokio::spawn(async move { Self::track_task(&tracking, handle).await });
        }
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
                    let mut update = MarketUpdate::new(BinanceFuturesProvider::identity(), symbol, now_ms());
                    update = update.with_aggressive_volume(buy, sell, buy_quote, sell_quote);
                    if let Some(cb) = shared.callback.read().as_ref() {
                        cb(update);
                    }
                }
            }
        });
        tokio::spawn(async move { Self::track_task(&tracking, handle).await });
    }

    fn spawn_oi_poller(&self, symbols: Vec<String>) {
        let shared = self.shared.clone();
        let tracking = self.shared.clone();
        let http = self.http.clone();
        let handle = tokio::spawn(async move {
            loop {
                if shared.intentional_disconnect.load(Ordering::Acquire) {
                    return;
                }
                for batch in symbols.chunks(25) {
                    for symbol in batch {
                        match fetch_open_interest(&http, symbol).await {
                            Ok(oi) => {
                                shared.oi_cache.insert(symbol.clone(), (oi, now_ms()));
                                let mut update = MarketUpdate::new(BinanceFuturesProvider::identity(), symbol.clone(), now_ms());
                                update = update.with_open_interest(oi, now_ms());
                                if let Some(cb) = shared.callback.read().as_ref() {
                                    cb(update);
                                }
                            }
                            Err(e) => {
                                shared.error_count.fetch_add(1, Ordering::Relaxed);
                                debug!(symbol, error = %e, "open interest poll failed");
                            }
                        }
                        tokio::time::sleep(Duration::from_millis(60)).await;
                    }
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
        tokio::spawn(async move { Self::track_task(&tracking, handle).await });
    }
}

impl Default for BinanceFuturesProvider {
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

async fn fetch_open_interest(http: &reqwest::Client, symbol: &str) -> anyhow::Result<f64> {
    let url = format!("{REST_BASE}/fapi/v1/openInterest?symbol={symbol}");
    let resp = http.get(&url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("openInterest returned {}", resp.status());
    }
    let body: serde_json::Value = resp.json().await?;
    body["openInterest"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| anyhow::anyhow!("missing or invalid openInterest field"))
}

/// Exponential-backoff reconnect wrapper shared by the ticker and trade
/// streams (base 5s, cap 60s, suppressed by intentional disconnect).
async fn run_reconnect_loop<F>(shared: Arc<Shared>, label: &'static str, mut make_attempt: F)
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>,
{
    let mut backoff_ms = 5_000u64;
    loop {
        if shared.intentional_disconnect.load(Ordering::Acquire) {
            return;
        }
        *shared.state.write() = ConnectionState::Connecting;
        match make_attempt().await {
            Ok(()) => {
                backoff_ms = 5_000;
                if shared.intentional_disconnect.load(Ordering::Acquire) {
                    return;
                }
                *shared.state.write() = ConnectionState::Reconnecting;
            }
            Err(e) => {
                shared.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(stream = label, error = %e, backoff_ms, "stream error, reconnecting");
                *shared.state.write() = ConnectionState::Reconnecting;
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(60_000);
            }
        }
    }
}

async fn run_ticker_once(shared: Arc<Shared>, symbols: Vec<String>) -> anyhow::Result<()> {
    let streams: Vec<String> = symbols.iter().map(|s| format!("{}@ticker", s.to_lowercase())).collect();
    let url = format!("{WS_BASE}{}", streams.join("/"));
    info!(url = %url, "connecting to futures ticker stream");

    let (ws_stream, _) = connect_async(&url).await?;
    *shared.state.write() = ConnectionState::Connected;
    info!("futures ticker stream connected");

    let (mut write, mut read) = ws_stream.split();
    let mut ping_interval = tokio::time::interval(Duration::from_secs(20));

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    return Err(IngestError::Transport("ticker ping failed".into()).into());
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(update) = parse_ticker_message(&text) {
                            shared.last_update_ms.store(update.timestamp_ms, Ordering::Release);
                            if let Some(cb) = shared.callback.read().as_ref() {
                                cb(update);
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(IngestError::Transport(format!("ticker stream read error: {e}")).into()),
                    None => {
                        warn!("ticker stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn parse_ticker_message(text: &str) -> Option<MarketUpdate> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    let data = root.get("data").unwrap_or(&root);
    let symbol = data["s"].as_str()?.to_string();
    if !is_valid_symbol_shape(&symbol) {
        return None;
    }
    let price: f64 = data["c"].as_str()?.parse().ok()?;
    let quote_volume: f64 = data["q"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let volume: f64 = data["v"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let ts = data["E"].as_i64().unwrap_or_else(now_ms);

    let mut update = MarketUpdate::new(BinanceFuturesProvider::identity(), symbol, ts);
    if price.is_finite() && price > 0.0 {
        update = update.with_price(price);
    }
    update.volume = Some(volume);
    update.quote_volume = Some(quote_volume);
    Some(update)
}

async fn run_agg_trade_once(shared: Arc<Shared>, symbol: String) -> anyhow::Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{WS_BASE}{lower}@aggTrade");
    let (ws_stream, _) = connect_async(&url).await?;
    *shared.state.write() = ConnectionState::Connected;
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some((price, qty, is_buyer_maker)) = parse_agg_trade(&text) {
                    let quote = price * qty;
                    let mut acc = shared.accumulators.entry(symbol.clone()).or_default();
                    if is_buyer_maker {
                        acc.taker_sell_base += qty;
                        acc.taker_sell_quote += quote;
                    } else {
                        acc.taker_buy_base += qty;
                        acc.taker_buy_quote += quote;
                    }
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(IngestError::Transport(format!("aggTrade read error for {symbol}: {e}")).into()),
            None => return Ok(()),
        }
    }
}

fn parse_agg_trade(text: &str) -> Option<(f64, f64, bool)> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    let data = root.get("data").unwrap_or(&root);
    let price: f64 = data["p"].as_str()?.parse().ok()?;
    let qty: f64 = data["q"].as_str()?.parse().ok()?;
    let is_buyer_maker = data["m"].as_bool()?;
    Some((price, qty, is_buyer_maker))
}

#[async_trait]
impl VenueProvider for BinanceFuturesProvider {
    fn identity(&self) -> ProviderIdentity {
        Self::identity()
    }

    #[instrument(skip(self), name = "binance_futures::connect")]
    async fn connect(&self) -> anyhow::Result<()> {
        self.shared.intentional_disconnect.store(false, Ordering::Release);
        *self.shared.state.write() = ConnectionState::Connecting;

        let symbols: Vec<String> = self.shared.symbols.read().iter().cloned().collect();
        if symbols.is_empty() {
            return Err(IngestError::ConnectFailed("no subscribed symbols".into()).into());
        }

        for batch in symbols.chunks(SUBSCRIBE_BATCH) {
            self.spawn_ticker_stream(batch.to_vec());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.spawn_trade_streams(symbols.clone());
        self.spawn_flush_timer();
        self.spawn_oi_poller(symbols);

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
    fn parses_ticker_payload() {
        let text = r#"{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","c":"50000.00","v":"1234.5","q":"61728395.5"}"#;
        let update = parse_ticker_message(text).unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.price, Some(50_000.0));
    }

    #[test]
    fn rejects_invalid_symbol_shape_in_ticker() {
        let text = r#"{"E":1,"s":"btcusdt","c":"1"}"#;
        assert!(parse_ticker_message(text).is_none());
    }

    #[test]
    fn parses_agg_trade_payload() {
        let text = r#"{"e":"aggTrade","p":"50000.0","q":"0.5","m":true}"#;
        let (price, qty, maker) = parse_agg_trade(text).unwrap();
        assert_eq!(price, 50_000.0);
        assert_eq!(qty, 0.5);
        assert!(maker);
    }
}
