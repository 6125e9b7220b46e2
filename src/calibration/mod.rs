//! Calibration engine
//!
//! Fits, per oracle, the observation lag and the per-exchange weight vector
//! that make `weighted_at` best reproduce the oracle's historical on-chain
//! answers. The fit is a grid search over lag candidates scored by the tail
//! of the error distribution: liquidation timing is driven by worst-case
//! mispredictions, so the 90th percentile is minimized first and the median
//! only breaks ties.

use ethers::types::I256;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::Aggregator;
use crate::chain::{Transmission, TransmissionScanner};
use crate::config::{CalibrationConfig, FeedSpec, OracleSpec};
use crate::retry::RetryPolicy;
use crate::store::TickStore;
use crate::types::{CexWeight, Exchange, OracleKey, OracleSample};

#[derive(Debug, Error)]
pub enum CalibrationError {
    /// No lag candidate reached the usable-sample floor; prior configuration
    /// is left untouched.
    #[error("insufficient usable samples for every lag candidate")]
    Infeasible,
    /// A fit for this oracle is already in flight.
    #[error("calibration already running for this oracle")]
    AlreadyRunning,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One evaluated point of the grid search. Transient, never persisted.
#[derive(Debug, Clone)]
pub struct CalibrationCandidate {
    pub lag_ms: i64,
    pub weights: Vec<(Exchange, f64)>,
    pub p50_err_bps: f64,
    pub p90_err_bps: f64,
    pub used_samples: usize,
}

/// Nearest-rank percentile over ascending-sorted values.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = (pct * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Winner selection: minimize p90, break ties on p50.
pub fn select_candidate(candidates: Vec<CalibrationCandidate>) -> Option<CalibrationCandidate> {
    candidates.into_iter().min_by(|a, b| {
        a.p90_err_bps
            .total_cmp(&b.p90_err_bps)
            .then(a.p50_err_bps.total_cmp(&b.p50_err_bps))
    })
}

/// Native fixed-point answer to a quote-currency price.
fn answer_to_price(answer: I256, decimals: u32) -> Option<f64> {
    let value: f64 = answer.to_string().parse().ok()?;
    let price = value / 10f64.powi(decimals as i32);
    price.is_finite().then_some(price)
}

/// Batch calibration over the configured oracles
pub struct CalibrationEngine {
    store: TickStore,
    aggregator: Aggregator,
    feeds: Vec<FeedSpec>,
    cfg: CalibrationConfig,
    in_flight: Mutex<HashSet<OracleKey>>,
}

impl CalibrationEngine {
    pub fn new(
        store: TickStore,
        aggregator: Aggregator,
        feeds: Vec<FeedSpec>,
        cfg: CalibrationConfig,
    ) -> Self {
        Self {
            store,
            aggregator,
            feeds,
            cfg,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Uniform 1/N weights over the sources configured for a symbol.
    ///
    /// The evaluation below accepts any weight vector, so a refined fit can
    /// iterate vectors through the same harness; the base run persists the
    /// uniform one.
    pub fn uniform_weights(&self, symbol: &str) -> Vec<(Exchange, f64)> {
        let mut sources: Vec<Exchange> = self
            .feeds
            .iter()
            .filter(|f| f.symbol == symbol)
            .map(|f| f.exchange)
            .collect();
        sources.sort();
        sources.dedup();
        let n = sources.len().max(1) as f64;
        sources.into_iter().map(|s| (s, 1.0 / n)).collect()
    }

    /// Score one (lag, weights) point against the historical samples.
    /// Returns None when fewer than `min_usable` samples have coverage.
    pub fn evaluate(
        &self,
        symbol: &str,
        samples: &[Transmission],
        decimals: u32,
        lag_ms: i64,
        weights: &[(Exchange, f64)],
        min_usable: usize,
    ) -> Option<CalibrationCandidate> {
        let mut errors = Vec::with_capacity(samples.len());
        for sample in samples {
            let Ok(Some(predicted)) =
                self.aggregator
                    .weighted_at(symbol, sample.timestamp_ms - lag_ms, weights)
            else {
                continue;
            };
            let Some(onchain) = answer_to_price(sample.answer, decimals) else {
                continue;
            };
            if predicted.value <= 0.0 {
                continue;
            }
            let error_bps = ((onchain / predicted.value - 1.0) * 10_000.0).round();
            errors.push(error_bps.abs());
        }

        if errors.len() < min_usable {
            return None;
        }
        errors.sort_by(|a, b| a.total_cmp(b));
        Some(CalibrationCandidate {
            lag_ms,
            weights: weights.to_vec(),
            p50_err_bps: percentile(&errors, 0.5),
            p90_err_bps: percentile(&errors, 0.9),
            used_samples: errors.len(),
        })
    }

    fn try_begin(&self, key: OracleKey) -> Option<FlightGuard<'_>> {
        if !self.in_flight.lock().insert(key) {
            return None;
        }
        Some(FlightGuard { engine: self, key })
    }

    /// Fit one oracle and persist the winning lag and weights.
    pub async fn calibrate_oracle(
        &self,
        spec: &OracleSpec,
    ) -> Result<CalibrationCandidate, CalibrationError> {
        let oracle_addr = spec.address().map_err(CalibrationError::Other)?;
        let key = (spec.chain_id, oracle_addr);
        let Some(_guard) = self.try_begin(key) else {
            return Err(CalibrationError::AlreadyRunning);
        };

        let scanner =
            TransmissionScanner::new(&spec.rpc_url, self.cfg.chunk_blocks, RetryPolicy::default())
                .map_err(CalibrationError::Other)?;
        let samples = scanner
            .recent_transmissions(oracle_addr, self.cfg.lookback_blocks, self.cfg.max_samples)
            .await
            .map_err(CalibrationError::Other)?;
        if samples.is_empty() {
            return Err(CalibrationError::Infeasible);
        }

        let weights = self.uniform_weights(&spec.symbol);
        let min_usable = usize::max(10, (samples.len() as f64 * 0.4).ceil() as usize);

        let mut candidates = Vec::new();
        let mut lag_ms = 0i64;
        while lag_ms <= self.cfg.lag_max_ms {
            if let Some(candidate) = self.evaluate(
                &spec.symbol,
                &samples,
                spec.decimals,
                lag_ms,
                &weights,
                min_usable,
            ) {
                candidates.push(candidate);
            }
            lag_ms += self.cfg.lag_step_ms;
        }

        let winner = select_candidate(candidates).ok_or(CalibrationError::Infeasible)?;

        let lag_secs = (winner.lag_ms as f64 / 1_000.0).round() as u64;
        self.store
            .set_oracle_lag(spec.chain_id, oracle_addr, lag_secs)
            .map_err(CalibrationError::Other)?;
        let weight_rows: Vec<CexWeight> = winner
            .weights
            .iter()
            .map(|(source, weight)| CexWeight {
                chain_id: spec.chain_id,
                oracle_addr,
                source: *source,
                weight: *weight,
            })
            .collect();
        self.store
            .replace_weights(spec.chain_id, oracle_addr, &weight_rows)
            .map_err(CalibrationError::Other)?;

        // record the measured-accuracy history at the fitted lag
        for sample in &samples {
            let Ok(Some(predicted)) = self.aggregator.weighted_at(
                &spec.symbol,
                sample.timestamp_ms - winner.lag_ms,
                &winner.weights,
            ) else {
                continue;
            };
            let Some(onchain) = answer_to_price(sample.answer, spec.decimals) else {
                continue;
            };
            if predicted.value <= 0.0 {
                continue;
            }
            let error_bps = ((onchain / predicted.value - 1.0) * 10_000.0).round();
            let row = OracleSample {
                chain_id: spec.chain_id,
                oracle_addr,
                block_number: sample.block_number,
                tx_hash: sample.tx_hash,
                answer: sample.answer,
                cex_price_at_observation: predicted.value,
                event_ts_ms: sample.timestamp_ms,
                error_bps,
            };
            if let Err(e) = self.store.insert_sample(&row) {
                warn!(oracle = %spec.address, error = %e, "Failed to record oracle sample");
            }
        }

        Ok(winner)
    }

    /// Calibrate every configured oracle, one at a time, with a small pause
    /// between oracles to bound RPC and store load.
    pub async fn run_all(&self, specs: &[OracleSpec]) {
        for spec in specs {
            match self.calibrate_oracle(spec).await {
                Ok(winner) => info!(
                    oracle = %spec.address,
                    lag_ms = winner.lag_ms,
                    p50_err_bps = winner.p50_err_bps,
                    p90_err_bps = winner.p90_err_bps,
                    used_samples = winner.used_samples,
                    "Calibration complete"
                ),
                Err(CalibrationError::AlreadyRunning) => {
                    info!(oracle = %spec.address, "Calibration already in flight, skipping")
                }
                Err(CalibrationError::Infeasible) => warn!(
                    oracle = %spec.address,
                    "Calibration infeasible, leaving prior configuration untouched"
                ),
                Err(e) => warn!(oracle = %spec.address, error = %e, "Calibration failed"),
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.pause_ms)).await;
        }
    }
}

struct FlightGuard<'a> {
    engine: &'a CalibrationEngine,
    key: OracleKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.engine.in_flight.lock().remove(&self.key);
    }
}
