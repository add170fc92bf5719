// =============================================================================
// Market State — per-symbol latest price/OI, lifecycle, eviction
// =============================================================================
//
// Generalizes `market_data::trade_stream::TradeStreamProcessor` (one
// `RwLock`-guarded scalar state struct per symbol, atomics for monotonic
// counters) from a single symbol into a sharded per-symbol map.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Per-symbol scalar state: last price/OI, lifecycle timestamps, and the
/// out-of-order counter.
pub struct SymbolState {
    last_price_bits: AtomicU64,
    last_oi_bits: AtomicU64,
    first_seen_ms: AtomicI64,
    last_update_ms: AtomicI64,
    out_of_order_count: AtomicU64,
}

/// Sentinel stored in the atomic slot when no value has been observed yet.
/// `f64::NAN`'s bit pattern is never a valid price/OI (both must be
/// non-negative finite), so it's safe to use as "unset".
fn none_bits() -> u64 {
    f64::NAN.to_bits()
}

fn load_f64(slot: &AtomicU64) -> Option<f64> {
    let bits = slot.load(Ordering::Acquire);
    if bits == none_bits() {
        None
    } else {
        Some(f64::from_bits(bits))
    }
}

impl SymbolState {
    fn new(now_ms: i64) -> Self {
        Self {
            last_price_bits: AtomicU64::new(none_bits()),
            last_oi_bits: AtomicU64::new(none_bits()),
            first_seen_ms: AtomicI64::new(now_ms),
            last_update_ms: AtomicI64::new(now_ms),
            out_of_order_count: AtomicU64::new(0),
        }
    }

    pub fn last_price(&self) -> Option<f64> {
        load_f64(&self.last_price_bits)
    }

    pub fn last_oi(&self) -> Option<f64> {
        load_f64(&self.last_oi_bits)
    }

    pub fn first_seen_ms(&self) -> i64 {
        self.first_seen_ms.load(Ordering::Acquire)
    }

    pub fn last_update_ms(&self) -> i64 {
        self.last_update_ms.load(Ordering::Acquire)
    }

    pub fn out_of_order_count(&self) -> u64 {
        self.out_of_order_count.load(Ordering::Relaxed)
    }

    pub fn mark_out_of_order(&self) {
        self.out_of_order_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read-only snapshot of a symbol's state, handed to external callers (spec
/// §3 ownership note: "external readers obtain immutable snapshots").
#[derive(Debug, Clone, Serialize)]
pub struct SymbolStateSnapshot {
    pub last_price: Option<f64>,
    pub last_oi: Option<f64>,
    pub first_seen_ms: i64,
    pub last_update_ms: i64,
    pub out_of_order_count: u64,
}

/// Per-symbol latest price/OI tracker with TTL and cap-based eviction (spec
/// §4.2).
pub struct MarketState {
    symbols: DashMap<String, SymbolState>,
    max_tracked_symbols: usize,
    ttl_ms: i64,
}

impl MarketState {
    pub fn new(max_tracked_symbols: usize) -> Self {
        Self {
            symbols: DashMap::new(),
            max_tracked_symbols,
            // 24h idle eviction TTL.
            ttl_ms: 24 * 60 * 60 * 1000,
        }
    }

    /// Record a new observation for `symbol`. Only finite, non-negative
    /// values overwrite the stored price/OI; price must additionally be
    /// strictly positive. `last_update` always advances to `ts`, regardless
    /// of whether a value was accepted.
    pub fn update(&self, symbol: &str, ts_ms: i64, price: Option<f64>, oi: Option<f64>) {
        let entry = self
            .symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(ts_ms));

        if let Some(p) = price {
            if p.is_finite() && p > 0.0 {
                entry.last_price_bits.store(p.to_bits(), Ordering::Release);
            }
        }
        if let Some(v) = oi {
            if v.is_finite() && v >= 0.0 {
                entry.last_oi_bits.store(v.to_bits(), Ordering::Release);
            }
        }
        entry.last_update_ms.store(ts_ms, Ordering::Release);
    }

    pub fn get_price(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(|s| s.last_price())
    }

    pub fn get_oi(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(|s| s.last_oi())
    }

    pub fn first_seen_ms(&self, symbol: &str) -> Option<i64> {
        self.symbols.get(symbol).map(|s| s.first_seen_ms())
    }

    pub fn out_of_order_count(&self, symbol: &str) -> u64 {
        self.symbols.get(symbol).map(|s| s.out_of_order_count()).unwrap_or(0)
    }

    pub fn mark_out_of_order(&self, symbol: &str) {
        if let Some(s) = self.symbols.get(symbol) {
            s.mark_out_of_order();
        }
    }

    pub fn snapshot(&self, symbol: &str) -> Option<SymbolStateSnapshot> {
        self.symbols.get(symbol).map(|s| SymbolStateSnapshot {
            last_price: s.last_price(),
            last_oi: s.last_oi(),
            first_seen_ms: s.first_seen_ms(),
            last_update_ms: s.last_update_ms(),
            out_of_order_count: s.out_of_order_count(),
        })
    }

    pub fn all_symbols(&self) -> Vec<String> {
        self.symbols.iter().map(|e| e.key().clone()).collect()
    }

    /// Run TTL + cap eviction. `evict_hook` is called once per evicted
    /// symbol so the Bucket Store can purge its maps in lockstep (spec
    /// §4.2, invariant 5).
    pub fn maintenance(&self, now_ms: i64, mut evict_hook: impl FnMut(&str)) {
        let mut to_evict: Vec<String> = self
            .symbols
            .iter()
            .filter(|e| now_ms - e.value().last_update_ms() > self.ttl_ms)
            .map(|e| e.key().clone())
            .collect();

        if self.symbols.len() - to_evict.len() > self.max_tracked_symbols {
            let mut by_age: Vec<(String, i64)> = self
                .symbols
                .iter()
                .filter(|e| !to_evict.contains(e.key()))
                .map(|e| (e.key().clone(), e.value().last_update_ms()))
                .collect();
            by_age.sort_by_key(|(_, t)| *t);
            let surplus = (self.symbols.len() - to_evict.len()).saturating_sub(self.max_tracked_symbols);
            to_evict.extend(by_age.into_iter().take(surplus).map(|(s, _)| s));
        }

        for symbol in to_evict {
            self.symbols.remove(&symbol);
            evict_hook(&symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_tracks_latest_values() {
        let ms = MarketState::new(100);
        ms.update("BTCUSDT", 1000, Some(50_000.0), Some(1000.0));
        assert_eq!(ms.get_price("BTCUSDT"), Some(50_000.0));
        assert_eq!(ms.get_oi("BTCUSDT"), Some(1000.0));
        assert_eq!(ms.first_seen_ms("BTCUSDT"), Some(1000));
    }

    #[test]
    fn rejects_nonpositive_price() {
        let ms = MarketState::new(100);
        ms.update("BTCUSDT", 1000, Some(0.0), None);
        assert_eq!(ms.get_price("BTCUSDT"), None);
        ms.update("BTCUSDT", 1001, Some(-5.0), None);
        assert_eq!(ms.get_price("BTCUSDT"), None);
    }

    #[test]
    fn rejects_negative_oi() {
        let ms = MarketState::new(100);
        ms.update("BTCUSDT", 1000, None, Some(-1.0));
        assert_eq!(ms.get_oi("BTCUSDT"), None);
    }

    #[test]
    fn ttl_eviction_calls_hook() {
        let ms = MarketState::new(100);
        ms.update("BTCUSDT", 0, Some(1.0), Some(1.0));
        let mut evicted = Vec::new();
        ms.maintenance(25 * 60 * 60 * 1000, |s| evicted.push(s.to_string()));
        assert_eq!(evicted, vec!["BTCUSDT".to_string()]);
        assert_eq!(ms.get_price("BTCUSDT"), None);
    }

    #[test]
    fn cap_eviction_drops_least_recently_updated() {
        let ms = MarketState::new(2);
        ms.update("A", 1000, Some(1.0), Some(1.0));
        ms.update("B", 2000, Some(1.0), Some(1.0));
        ms.update("C", 3000, Some(1.0), Some(1.0));
        let mut evicted = Vec::new();
        ms.maintenance(3000, |s| evicted.push(s.to_string()));
        assert_eq!(evicted, vec!["A".to_string()]);
        assert_eq!(ms.all_symbols().len(), 2);
    }

    #[test]
    fn out_of_order_counter() {
        let ms = MarketState::new(100);
        ms.update("BTCUSDT", 0, Some(1.0), Some(1.0));
        ms.mark_out_of_order("BTCUSDT");
        assert_eq!(ms.out_of_order_count("BTCUSDT"), 1);
    }
}
