//! Aggregator - canonical price series over the tick store
//!
//! Computes per-source bin medians and the cross-source aggregate, and
//! answers "price at time T" queries with the asymmetric lookup the
//! prediction layer depends on: prefer the freshest bin at or before T,
//! tolerate a small forward slack for ingestion jitter.

use anyhow::Result;
use std::collections::HashMap;

use crate::store::TickStore;
use crate::types::{bucket_floor, AggregateBin, Exchange, SourceBin};

/// Window used by `weighted_at` source matching, milliseconds each way.
pub const WEIGHTED_WINDOW_MS: i64 = 2_000;

/// Fraction of per-source prices trimmed from each end before the
/// cross-source median.
const TRIM_FRACTION: f64 = 0.2;

/// Median with the lower-middle convention: for even counts the element at
/// index `n/2 - 1` of the ascending sort, mirroring the oracle's own
/// reduction of observation lists.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(sorted[(sorted.len() - 1) / 2])
}

/// Median after trimming `floor(n * 0.2)` values from each end of the sorted
/// list. Rejects a single outlier feed without requiring weights.
pub fn trimmed_median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let trim = (sorted.len() as f64 * TRIM_FRACTION).floor() as usize;
    let kept = &sorted[trim..sorted.len() - trim];
    median(kept)
}

/// Weighted combination over the sources with coverage at one instant
#[derive(Debug, Clone)]
pub struct WeightedPrice {
    /// Renormalized weighted value
    pub value: f64,
    /// Per-source prices that participated
    pub per_source: Vec<(Exchange, f64)>,
    /// Sum of the weights actually present
    pub used_weight: f64,
}

/// Read/rebuild interface over the binned price series
#[derive(Clone)]
pub struct Aggregator {
    store: TickStore,
    /// Backward staleness bound for `price_at`, milliseconds
    lookback_ms: i64,
    /// Forward slack tolerated by `price_at`, milliseconds
    forward_slack_ms: i64,
}

impl Aggregator {
    pub fn new(store: TickStore, lookback_ms: i64, forward_slack_ms: i64) -> Self {
        Self {
            store,
            lookback_ms,
            forward_slack_ms,
        }
    }

    /// Best known aggregate price as of `t_ms`, or None when the series has
    /// no coverage near that instant.
    pub fn price_at(&self, symbol: &str, t_ms: i64) -> Result<Option<f64>> {
        Ok(self
            .store
            .aggregate_at(symbol, t_ms, self.lookback_ms, self.forward_slack_ms)?
            .map(|bin| bin.price))
    }

    /// Recompute the source bins and the aggregate bin for the 100ms bucket
    /// containing `ts_ms` from raw trades. Upserts are idempotent; returns
    /// the new aggregate price, or None when the bucket holds no trades.
    pub fn rebuild(&self, symbol: &str, ts_ms: i64) -> Result<Option<f64>> {
        let bucket_ms = bucket_floor(ts_ms);
        let by_source = self.store.trades_in_bucket(symbol, bucket_ms)?;
        if by_source.is_empty() {
            return Ok(None);
        }

        let mut source_prices = Vec::with_capacity(by_source.len());
        for (source, prices) in &by_source {
            if let Some(price) = median(prices) {
                self.store.upsert_source_bin(&SourceBin {
                    symbol: symbol.to_string(),
                    source: *source,
                    bucket_ms,
                    price,
                })?;
                source_prices.push(price);
            }
        }

        let aggregate = match trimmed_median(&source_prices) {
            Some(price) => price,
            None => return Ok(None),
        };
        self.store.upsert_aggregate_bin(&AggregateBin {
            symbol: symbol.to_string(),
            bucket_ms,
            price: aggregate,
        })?;
        tracing::debug!(
            symbol = %symbol,
            bucket_ms,
            sources = source_prices.len(),
            price = aggregate,
            "Rebuilt bucket"
        );
        Ok(Some(aggregate))
    }

    /// Weight-combined price at `t_ms`, renormalized over the sources that
    /// actually have a bin within ±2s. None only when no source has data.
    pub fn weighted_at(
        &self,
        symbol: &str,
        t_ms: i64,
        weights: &[(Exchange, f64)],
    ) -> Result<Option<WeightedPrice>> {
        let mut numerator = 0.0;
        let mut used_weight = 0.0;
        let mut per_source = Vec::new();

        for (source, weight) in weights {
            if *weight <= 0.0 {
                continue;
            }
            let bin = self
                .store
                .source_bin_near(symbol, *source, t_ms, WEIGHTED_WINDOW_MS)?;
            if let Some(bin) = bin {
                numerator += bin.price * weight;
                used_weight += weight;
                per_source.push((*source, bin.price));
            }
        }

        if used_weight <= 0.0 {
            return Ok(None);
        }
        Ok(Some(WeightedPrice {
            value: numerator / used_weight,
            per_source,
            used_weight,
        }))
    }

    /// Per-source prices around `t_ms` without weighting (query surface).
    pub fn sources_at(&self, symbol: &str, t_ms: i64) -> Result<HashMap<Exchange, f64>> {
        let mut prices = HashMap::new();
        for source in Exchange::all() {
            if let Some(bin) = self
                .store
                .source_bin_near(symbol, source, t_ms, WEIGHTED_WINDOW_MS)?
            {
                prices.insert(source, bin.price);
            }
        }
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trade;

    fn store_with(trades: &[(Exchange, i64, f64)]) -> TickStore {
        let store = TickStore::open_memory().unwrap();
        let rows: Vec<Trade> = trades
            .iter()
            .map(|(source, ts_ms, price)| Trade {
                symbol: "BTCUSDC".to_string(),
                source: *source,
                ts_ms: *ts_ms,
                price: *price,
            })
            .collect();
        store.insert_trades(&rows).unwrap();
        store
    }

    fn aggregator(store: TickStore) -> Aggregator {
        Aggregator::new(store, 2_000, 300)
    }

    #[test]
    fn median_odd_returns_middle() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[5.0]), Some(5.0));
    }

    #[test]
    fn median_even_returns_lower_middle() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0]), Some(1.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn trimmed_median_drops_outlier_feed() {
        // five sources, one wildly off: trim floor(5*0.2)=1 from each end
        let prices = [100.0, 100.5, 101.0, 101.5, 9_000.0];
        assert_eq!(trimmed_median(&prices), Some(101.0));
        // below the trim threshold nothing is dropped
        assert_eq!(trimmed_median(&[100.0, 101.0, 102.0]), Some(101.0));
    }

    #[test]
    fn rebuild_bins_per_source_median_then_trimmed_aggregate() {
        let store = store_with(&[
            (Exchange::Binance, 1_000, 100.0),
            (Exchange::Binance, 1_030, 101.0),
            (Exchange::Binance, 1_060, 102.0),
            (Exchange::Bybit, 1_010, 100.0),
            (Exchange::Bybit, 1_040, 101.0),
            (Exchange::Bybit, 1_070, 102.0),
            (Exchange::Coinbase, 1_020, 100.0),
            (Exchange::Coinbase, 1_050, 101.0),
            (Exchange::Coinbase, 1_080, 102.0),
        ]);
        let agg = aggregator(store);

        let price = agg.rebuild("BTCUSDC", 1_042).unwrap();
        assert_eq!(price, Some(101.0));
        assert_eq!(agg.price_at("BTCUSDC", 1_100).unwrap(), Some(101.0));
    }

    #[test]
    fn rebuild_is_idempotent() {
        let store = store_with(&[(Exchange::Binance, 1_000, 100.0)]);
        let agg = aggregator(store.clone());

        assert_eq!(agg.rebuild("BTCUSDC", 1_000).unwrap(), Some(100.0));
        assert_eq!(agg.rebuild("BTCUSDC", 1_099).unwrap(), Some(100.0));
        assert_eq!(store.bin_counts().unwrap(), (1, 1));
    }

    #[test]
    fn price_at_unavailable_outside_windows() {
        let store = store_with(&[(Exchange::Binance, 1_000, 100.0)]);
        let agg = aggregator(store);
        agg.rebuild("BTCUSDC", 1_000).unwrap();

        assert_eq!(agg.price_at("BTCUSDC", 1_000).unwrap(), Some(100.0));
        // forward slack: bin at 1_000 is within +300ms of 900
        assert_eq!(agg.price_at("BTCUSDC", 900).unwrap(), Some(100.0));
        // too far in the past, too far in the future
        assert_eq!(agg.price_at("BTCUSDC", 500).unwrap(), None);
        assert_eq!(agg.price_at("BTCUSDC", 10_000).unwrap(), None);
    }

    #[test]
    fn weighted_at_renormalizes_over_present_sources() {
        // Binance and Bybit have bins, Coinbase has nothing
        let store = store_with(&[
            (Exchange::Binance, 1_000, 100.0),
            (Exchange::Bybit, 1_000, 104.0),
        ]);
        let agg = aggregator(store);
        agg.rebuild("BTCUSDC", 1_000).unwrap();

        let weights = [
            (Exchange::Binance, 3.0),
            (Exchange::Bybit, 1.0),
            (Exchange::Coinbase, 6.0),
        ];
        let combined = agg.weighted_at("BTCUSDC", 1_500, &weights).unwrap().unwrap();

        // (100*3 + 104*1) / (3 + 1) — the absent source drops out entirely
        assert!((combined.value - 101.0).abs() < 1e-12);
        assert_eq!(combined.per_source.len(), 2);
        assert!((combined.used_weight - 4.0).abs() < 1e-12);
    }

    #[test]
    fn weighted_at_none_when_no_source_has_data() {
        let store = TickStore::open_memory().unwrap();
        let agg = aggregator(store);
        let weights = [(Exchange::Binance, 1.0)];
        assert!(agg.weighted_at("BTCUSDC", 1_000, &weights).unwrap().is_none());
    }
}
