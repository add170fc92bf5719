// =============================================================================
// Bucket Store — dual-resolution OHLC buckets over OI, price, and volume
// =============================================================================
//
// Generalizes `market_data::candle_buffer::CandleBuffer` (thread-safe,
// per-key ring buffer over `RwLock<HashMap<Key, VecDeque<_>>>`) to a
// per-symbol, per-resolution store whose keys are bucket-start timestamps
// rather than insertion order. A `BTreeMap` is used instead of a
// hash-map-plus-sorted-index pair: a `BTreeMap` keeps its keys sorted at
// all times, giving O(log n) insert/evict and O(k) range scans natively,
// so a separate sorted index would only duplicate what the map already
// maintains.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::MarketUpdate;

/// The two time resolutions the store buckets into: 15s and 60s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    FifteenSec,
    Minute,
}

impl Resolution {
    pub fn size_ms(self) -> i64 {
        match self {
            Self::FifteenSec => 15_000,
            Self::Minute => 60_000,
        }
    }
}

/// A single per-symbol, per-resolution OHLC-style bucket.
///
/// OI and price fields are `Option` because a bucket may never receive an
/// OI or price sample at all — e.g. a volume-only update into a fresh
/// bucket leaves the OI fields `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bucket {
    pub oi_open: Option<f64>,
    pub oi_close: Option<f64>,
    pub oi_high: Option<f64>,
    pub oi_low: Option<f64>,

    pub price_open: Option<f64>,
    pub price_close: Option<f64>,

    pub volume_buy: f64,
    pub volume_sell: f64,
    pub volume_buy_quote: f64,
    pub volume_sell_quote: f64,
    pub total_volume: f64,
    pub total_quote_volume: f64,

    pub count: u64,
    pub first_ts: i64,
    pub last_ts: i64,
}

impl Bucket {
    fn open(ts: i64, opening_oi: Option<f64>, opening_price: Option<f64>) -> Self {
        Self {
            oi_open: opening_oi,
            oi_close: opening_oi,
            oi_high: opening_oi,
            oi_low: opening_oi,
            price_open: opening_price,
            price_close: opening_price,
            volume_buy: 0.0,
            volume_sell: 0.0,
            volume_buy_quote: 0.0,
            volume_sell_quote: 0.0,
            total_volume: 0.0,
            total_quote_volume: 0.0,
            count: 0,
            first_ts: ts,
            last_ts: ts,
        }
    }

    /// Merge one update into the bucket's open/high/low/close and volume
    /// accumulators. Returns `true` if the update was out-of-order relative
    /// to the bucket's accumulated span.
    fn merge(&mut self, ts: i64, update: &MarketUpdate) -> bool {
        let mut out_of_order = false;

        if ts < self.first_ts && self.count > 0 {
            out_of_order = true;
            if update.open_interest.is_some() || update.price.is_some() {
                self.first_ts = ts;
                if let Some(oi) = update.open_interest {
                    self.oi_open = Some(oi);
                }
                if let Some(p) = update.price {
                    self.price_open = Some(p);
                }
            }
        }

        if ts >= self.last_ts {
            self.last_ts = ts;
            if let Some(oi) = update.open_interest {
                self.oi_close = Some(oi);
            }
            if let Some(p) = update.price {
                self.price_close = Some(p);
            }
        }

        if let Some(oi) = update.open_interest {
            self.oi_high = Some(self.oi_high.map_or(oi, |h| h.max(oi)));
            self.oi_low = Some(self.oi_low.map_or(oi, |l| l.min(oi)));
        }

        self.volume_buy += update.volume_buy.unwrap_or(0.0);
        self.volume_sell += update.volume_sell.unwrap_or(0.0);
        self.volume_buy_quote += update.volume_buy_quote.unwrap_or(0.0);
        self.volume_sell_quote += update.volume_sell_quote.unwrap_or(0.0);
        // Rederive totals from the components after every addition so
        // accumulated rounding drift never creeps in.
        self.total_volume = self.volume_buy + self.volume_sell;
        self.total_quote_volume = self.volume_buy_quote + self.volume_sell_quote;

        self.count += 1;
        out_of_order
    }

    /// Fraction of the bucket's span that overlaps `[from, to]`, used by the
    /// metrics calculator to weight partial-window volume contributions.
    pub fn overlap_fraction(&self, resolution: Resolution, from: i64, to: i64) -> f64 {
        let bucket_start = resolution_floor(self.first_ts, resolution);
        let bucket_end = bucket_start + resolution.size_ms();
        let overlap_start = from.max(bucket_start);
        let overlap_end = to.min(bucket_end);
        if overlap_end <= overlap_start {
            return 0.0;
        }
        (overlap_end - overlap_start) as f64 / resolution.size_ms() as f64
    }
}

fn resolution_floor(ts: i64, resolution: Resolution) -> i64 {
    let size = resolution.size_ms();
    ts.div_euclid(size) * size
}

/// Result of a single [`BucketStore::add_point`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddPointOutcome {
    pub out_of_order: bool,
}

struct SymbolBuckets {
    fifteen_sec: RwLock<BTreeMap<i64, Bucket>>,
    minute: RwLock<BTreeMap<i64, Bucket>>,
}

impl SymbolBuckets {
    fn new() -> Self {
        Self {
            fifteen_sec: RwLock::new(BTreeMap::new()),
            minute: RwLock::new(BTreeMap::new()),
        }
    }

    fn map(&self, resolution: Resolution) -> &RwLock<BTreeMap<i64, Bucket>> {
        match resolution {
            Resolution::FifteenSec => &self.fifteen_sec,
            Resolution::Minute => &self.minute,
        }
    }
}

/// Dual-resolution, per-symbol bucket store.
pub struct BucketStore {
    symbols: DashMap<String, SymbolBuckets>,
    max_15s: usize,
    max_60s: usize,
}

impl BucketStore {
    pub fn new(max_15s: usize, max_60s: usize) -> Self {
        Self {
            symbols: DashMap::new(),
            max_15s,
            max_60s,
        }
    }

    fn capacity(&self, resolution: Resolution) -> usize {
        match resolution {
            Resolution::FifteenSec => self.max_15s,
            Resolution::Minute => self.max_60s,
        }
    }

    fn add_to_resolution(
        &self,
        symbol: &SymbolBuckets,
        resolution: Resolution,
        update: &MarketUpdate,
        last_price_fallback: Option<f64>,
        last_oi_fallback: Option<f64>,
    ) -> bool {
        let ts = update.timestamp_ms;
        let bucket_start = resolution_floor(ts, resolution);
        let mut map = symbol.map(resolution).write();

        let bucket = map.entry(bucket_start).or_insert_with(|| {
            let opening_oi = update.open_interest.or(last_oi_fallback);
            let opening_price = update.price.or(last_price_fallback);
            Bucket::open(ts, opening_oi, opening_price)
        });

        let out_of_order = bucket.merge(ts, update);

        while map.len() > self.capacity(resolution) {
            // Smallest key is the oldest bucket — BTreeMap iterates keys in
            // ascending order.
            if let Some(&oldest) = map.keys().next() {
                map.remove(&oldest);
            } else {
                break;
            }
        }

        out_of_order
    }

    /// Insert one normalized update into both resolutions for `symbol`.
    /// `last_price_fallback`/`last_oi_fallback` seed a newly-created
    /// bucket's opening value when the update itself doesn't carry one.
    pub fn add_point(
        &self,
        symbol: &str,
        update: &MarketUpdate,
        last_price_fallback: Option<f64>,
        last_oi_fallback: Option<f64>,
    ) -> AddPointOutcome {
        let entry = self
            .symbols
            .entry(symbol.to_string())
            .or_insert_with(SymbolBuckets::new);

        let oo15 = self.add_to_resolution(
            &entry,
            Resolution::FifteenSec,
            update,
            last_price_fallback,
            last_oi_fallback,
        );
        let oo60 = self.add_to_resolution(
            &entry,
            Resolution::Minute,
            update,
            last_price_fallback,
            last_oi_fallback,
        );

        AddPointOutcome {
            out_of_order: oo15 || oo60,
        }
    }

    /// Buckets for `symbol` at `resolution` whose span intersects
    /// `[from_ms, to_ms]`, oldest first.
    pub fn buckets_in_range(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
        resolution: Resolution,
    ) -> Vec<(i64, Bucket)> {
        let Some(entry) = self.symbols.get(symbol) else {
            return Vec::new();
        };
        let map = SymbolBuckets::map(&entry, resolution).read();
        let size = resolution.size_ms();
        // A bucket keyed at `k` spans [k, k+size); include any bucket whose
        // span could overlap the window, scanning one key before `from_ms`'s
        // own bucket start to catch partial overlap.
        let lower = resolution_floor(from_ms, resolution) - size;
        map.range(lower..=to_ms)
            .filter(|(&k, _)| k + size > from_ms && k <= to_ms)
            .map(|(&k, b)| (k, b.clone()))
            .collect()
    }

    /// Remove all buckets for `symbol` (called from `MarketState`'s
    /// eviction hook).
    pub fn cleanup_symbol(&self, symbol: &str) {
        self.symbols.remove(symbol);
    }

    /// The larger of the two resolutions' bucket counts for `symbol`.
    pub fn history_length(&self, symbol: &str) -> usize {
        match self.symbols.get(symbol) {
            Some(entry) => entry.fifteen_sec.read().len().max(entry.minute.read().len()),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, ProviderIdentity};

    fn update_at(ts: i64, oi: Option<f64>, price: Option<f64>) -> MarketUpdate {
        let mut u = MarketUpdate::new(ProviderIdentity::new("binance", MarketType::Futures), "BTCUSDT", ts);
        u.open_interest = oi;
        u.price = price;
        u
    }

    #[test]
    fn invariants_hold_after_multiple_updates() {
        let store = BucketStore::new(300, 70);
        for i in 0..10 {
            let ts = i * 1000;
            store.add_point("BTCUSDT", &update_at(ts, Some(100.0 + i as f64), Some(50.0)), None, None);
        }
        let buckets = store.buckets_in_range("BTCUSDT", 0, 15_000, Resolution::FifteenSec);
        assert_eq!(buckets.len(), 1);
        let (_, b) = &buckets[0];
        assert!(b.first_ts <= b.last_ts);
        assert_eq!(b.total_volume, b.volume_buy + b.volume_sell);
        assert_eq!(b.total_quote_volume, b.volume_buy_quote + b.volume_sell_quote);
        let (low, open, close, high) = (
            b.oi_low.unwrap(),
            b.oi_open.unwrap(),
            b.oi_close.unwrap(),
            b.oi_high.unwrap(),
        );
        assert!(low <= open.min(close));
        assert!(open.max(close) <= high);
        assert!(b.count >= 1);
    }

    #[test]
    fn out_of_order_scenario_matches_spec() {
        let store = BucketStore::new(300, 70);
        let t = 10_000i64;
        store.add_point("ETHUSDT", &update_at(t, Some(100.0), Some(10.0)), None, None);
        store.add_point("ETHUSDT", &update_at(t + 1000, Some(101.0), Some(11.0)), None, None);
        let outcome = store.add_point("ETHUSDT", &update_at(t - 500, Some(99.0), Some(9.0)), None, None);
        assert!(outcome.out_of_order);
        store.add_point("ETHUSDT", &update_at(t + 2000, Some(102.0), Some(12.0)), None, None);

        let buckets = store.buckets_in_range("ETHUSDT", 0, 15_000, Resolution::FifteenSec);
        assert_eq!(buckets.len(), 1);
        let (_, b) = &buckets[0];
        assert_eq!(b.first_ts, t - 500);
        assert_eq!(b.last_ts, t + 2000);
        assert_eq!(b.oi_high, Some(102.0));
        assert_eq!(b.oi_low, Some(99.0));
    }

    #[test]
    fn retention_bound_enforced() {
        let store = BucketStore::new(3, 2);
        for i in 0..10 {
            let ts = i * 15_000;
            store.add_point("BTCUSDT", &update_at(ts, Some(1.0), Some(1.0)), None, None);
        }
        assert!(store.history_length("BTCUSDT") <= 3);
    }

    #[test]
    fn cleanup_removes_symbol() {
        let store = BucketStore::new(300, 70);
        store.add_point("BTCUSDT", &update_at(0, Some(1.0), Some(1.0)), None, None);
        assert_eq!(store.history_length("BTCUSDT"), 1);
        store.cleanup_symbol("BTCUSDT");
        assert_eq!(store.history_length("BTCUSDT"), 0);
    }

    #[test]
    fn fallback_seeds_opening_value() {
        let store = BucketStore::new(300, 70);
        let mut u = update_at(0, None, None);
        u.volume_buy = Some(5.0);
        store.add_point("BTCUSDT", &u, Some(42.0), Some(1000.0));
        let buckets = store.buckets_in_range("BTCUSDT", 0, 15_000, Resolution::FifteenSec);
        let (_, b) = &buckets[0];
        assert_eq!(b.price_open, Some(42.0));
        assert_eq!(b.oi_open, Some(1000.0));
    }
}
