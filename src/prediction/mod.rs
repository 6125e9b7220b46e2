//! Prediction service
//!
//! Read-only query surface combining the aggregator, the adapter registry,
//! and the calibrated per-oracle parameters. Nothing here mutates state;
//! every "no data" case surfaces as None rather than an error.

use anyhow::Result;
use ethers::types::{I256, U256};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::collections::HashMap;

use crate::adapter::AdapterRegistry;
use crate::aggregate::Aggregator;
use crate::calibration::percentile;
use crate::store::TickStore;
use crate::types::{Exchange, OracleConfig};

fn serialize_u256_dec<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

/// Aggregated price with its per-source breakdown
#[derive(Debug, Clone, Serialize)]
pub struct PriceSummary {
    pub symbol: String,
    pub aggregated_price: f64,
    pub sources: HashMap<Exchange, f64>,
    pub count: usize,
}

/// Predicted oracle answer at one instant
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    /// Answer in quote-currency units
    pub answer: f64,
    /// 1e36-base fixed-point price, decimal string
    #[serde(serialize_with = "serialize_u256_dec")]
    pub fixed_point: U256,
    /// Aggregated input prices per required symbol
    pub inputs: HashMap<String, f64>,
    /// False when the adapter came from the unverified default fallback
    pub adapter_verified: bool,
}

/// Why a transmission is (or is not) expected
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TransmitReasons {
    /// Deviation from the last on-chain answer reached the threshold
    pub deviation: bool,
    /// The heartbeat interval has elapsed
    pub heartbeat: bool,
}

/// Transmit-now decision against the last observed on-chain answer
#[derive(Debug, Clone, Serialize)]
pub struct TransmitCheck {
    pub should_transmit: bool,
    pub reasons: TransmitReasons,
    pub predicted_answer: f64,
    pub onchain_answer: f64,
    pub deviation_bps: f64,
    pub age_secs: i64,
}

/// Realized |error| distribution over the stored samples
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub count: usize,
    pub p50_err_bps: Option<f64>,
    pub p90_err_bps: Option<f64>,
    pub max_err_bps: Option<f64>,
}

/// Native fixed-point answer as an exact decimal price.
fn answer_decimal(answer: I256, decimals: u32) -> Option<Decimal> {
    let native: i128 = answer.to_string().parse().ok()?;
    Decimal::try_from_i128_with_scale(native, decimals).ok()
}

#[derive(Clone)]
pub struct PredictionService {
    store: TickStore,
    aggregator: Aggregator,
    registry: AdapterRegistry,
}

impl PredictionService {
    pub fn new(store: TickStore, aggregator: Aggregator, registry: AdapterRegistry) -> Self {
        Self {
            store,
            aggregator,
            registry,
        }
    }

    /// Aggregated price now, with the per-source breakdown around the same
    /// instant.
    pub fn price_now(&self, symbol: &str, now_ms: i64) -> Result<Option<PriceSummary>> {
        let Some(price) = self.aggregator.price_at(symbol, now_ms)? else {
            return Ok(None);
        };
        let sources = self.aggregator.sources_at(symbol, now_ms)?;
        Ok(Some(PriceSummary {
            symbol: symbol.to_string(),
            aggregated_price: price,
            count: sources.len(),
            sources,
        }))
    }

    /// Stored weight vector for an oracle, falling back to uniform weights;
    /// `weighted_at` renormalizes over the sources with data either way.
    pub fn weights_for(&self, cfg: &OracleConfig) -> Vec<(Exchange, f64)> {
        match self.store.get_weights(cfg.chain_id, cfg.oracle_addr) {
            Ok(weights) if !weights.is_empty() => {
                weights.into_iter().map(|w| (w.source, w.weight)).collect()
            }
            _ => {
                let n = Exchange::all().len() as f64;
                Exchange::all().into_iter().map(|s| (s, 1.0 / n)).collect()
            }
        }
    }

    /// Predicted oracle answer at `ts_ms` with an explicit lag.
    pub fn predicted_at(
        &self,
        cfg: &OracleConfig,
        ts_ms: i64,
        lag_ms: i64,
    ) -> Result<Option<Prediction>> {
        let resolved = self.registry.resolve(cfg.chain_id, cfg.oracle_addr);
        let weights = self.weights_for(cfg);

        let mut inputs = HashMap::new();
        for symbol in resolved.adapter.required_symbols() {
            let Some(combined) = self.aggregator.weighted_at(&symbol, ts_ms - lag_ms, &weights)?
            else {
                return Ok(None);
            };
            inputs.insert(symbol, combined.value);
        }

        let Some(output) = resolved
            .adapter
            .compute(&inputs, cfg.decimals, cfg.scale_factor)
        else {
            return Ok(None);
        };
        Ok(Some(Prediction {
            answer: output.answer,
            fixed_point: output.fixed_point,
            inputs,
            adapter_verified: resolved.explicit,
        }))
    }

    /// Predicted answer now, using the oracle's calibrated lag.
    pub fn predicted_now(&self, cfg: &OracleConfig, now_ms: i64) -> Result<Option<Prediction>> {
        self.predicted_at(cfg, now_ms, cfg.lag_secs as i64 * 1_000)
    }

    /// Whether the oracle is expected to transmit now, with the deviation and
    /// heartbeat triggers reported independently. None when there is no
    /// on-chain sample to compare against or no CEX coverage.
    pub fn should_transmit(&self, cfg: &OracleConfig, now_ms: i64) -> Result<Option<TransmitCheck>> {
        let Some(last) = self.store.latest_sample(cfg.chain_id, cfg.oracle_addr)? else {
            return Ok(None);
        };
        let Some(prediction) = self.predicted_now(cfg, now_ms)? else {
            return Ok(None);
        };

        // threshold comparison runs in decimal so an exactly-at-threshold
        // deviation stays inclusive
        let deviation_bps = match (
            Decimal::from_f64(prediction.answer),
            answer_decimal(last.answer, cfg.decimals),
        ) {
            (Some(current), Some(onchain)) if !onchain.is_zero() => {
                ((current / onchain) - Decimal::ONE).abs() * Decimal::from(10_000u32)
            }
            _ => return Ok(None),
        };
        let deviation_hit = deviation_bps >= Decimal::from(cfg.deviation_bps);

        let age_secs = (now_ms - last.event_ts_ms) / 1_000;
        let heartbeat_hit = age_secs >= cfg.heartbeat_secs as i64;

        let onchain_answer = answer_decimal(last.answer, cfg.decimals)
            .and_then(|d| d.to_string().parse().ok())
            .unwrap_or(f64::NAN);
        Ok(Some(TransmitCheck {
            should_transmit: deviation_hit || heartbeat_hit,
            reasons: TransmitReasons {
                deviation: deviation_hit,
                heartbeat: heartbeat_hit,
            },
            predicted_answer: prediction.answer,
            onchain_answer,
            deviation_bps: deviation_bps.to_string().parse().unwrap_or(f64::NAN),
            age_secs,
        }))
    }

    /// Realized error distribution over the stored samples for one oracle.
    pub fn backtest(&self, cfg: &OracleConfig, max_samples: usize) -> Result<BacktestReport> {
        let samples = self
            .store
            .recent_samples(cfg.chain_id, cfg.oracle_addr, max_samples)?;
        let mut errors: Vec<f64> = samples.iter().map(|s| s.error_bps.abs()).collect();
        errors.sort_by(|a, b| a.total_cmp(b));

        if errors.is_empty() {
            return Ok(BacktestReport {
                count: 0,
                p50_err_bps: None,
                p90_err_bps: None,
                max_err_bps: None,
            });
        }
        Ok(BacktestReport {
            count: errors.len(),
            p50_err_bps: Some(percentile(&errors, 0.5)),
            p90_err_bps: Some(percentile(&errors, 0.9)),
            max_err_bps: errors.last().copied(),
        })
    }
}
