//! Core types used throughout oraclecast
//!
//! Defines the shared data structures for trades, time bins, oracle
//! configuration, and historical oracle samples.

use ethers::types::{Address, H256, I256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a time bin in milliseconds.
pub const BUCKET_MS: i64 = 100;

/// Floor a millisecond timestamp to its bin start.
pub fn bucket_floor(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(BUCKET_MS)
}

/// Supported trade sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Coinbase,
}

impl Exchange {
    /// Canonical lowercase identifier used in storage and query parameters
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Coinbase => "coinbase",
        }
    }

    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "binance" => Some(Exchange::Binance),
            "bybit" => Some(Exchange::Bybit),
            "coinbase" => Some(Exchange::Coinbase),
            _ => None,
        }
    }

    /// All supported exchanges
    pub fn all() -> [Exchange; 3] {
        [Exchange::Binance, Exchange::Bybit, Exchange::Coinbase]
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single trade print from an exchange, in canonical form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Canonical pair name (e.g. "BTCUSDC")
    pub symbol: String,
    /// Exchange the trade printed on
    pub source: Exchange,
    /// Trade timestamp in milliseconds (exchange time)
    pub ts_ms: i64,
    /// Trade price in quote-currency units
    pub price: f64,
}

/// Per-source 100ms bin: median of the source's trades in the bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBin {
    pub symbol: String,
    pub source: Exchange,
    /// Bucket start (floored to 100ms)
    pub bucket_ms: i64,
    pub price: f64,
}

/// Cross-source aggregate at 100ms resolution (trimmed median across sources)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateBin {
    pub symbol: String,
    pub bucket_ms: i64,
    pub price: f64,
}

/// 1-minute candle used for cold-start backfill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Open time (start of period, ms)
    pub open_time: i64,
    /// Close time (end of period, ms)
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Identifies one oracle: (chain, aggregator contract address)
pub type OracleKey = (u64, Address);

/// Per-oracle configuration row
///
/// `heartbeat_secs` and `deviation_bps` mirror the oracle's on-chain
/// transmission triggers; `lag_secs` is owned by the calibration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub chain_id: u64,
    pub oracle_addr: Address,
    /// Maximum seconds between updates regardless of price movement
    pub heartbeat_secs: u64,
    /// Minimum relative move (basis points) that triggers an early update
    pub deviation_bps: u32,
    /// Fixed-point decimals of the oracle's native answer
    pub decimals: u32,
    /// Multiplier lifting the native answer to the 1e36 common base
    pub scale_factor: U256,
    /// Calibrated observation lag, whole seconds
    pub lag_secs: u64,
}

impl OracleConfig {
    pub fn key(&self) -> OracleKey {
        (self.chain_id, self.oracle_addr)
    }
}

/// Relative trust weight for one exchange feeding one oracle's prediction
///
/// Weights need not sum to 1 at rest; consumers renormalize over the subset
/// of sources with data present at query time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CexWeight {
    pub chain_id: u64,
    pub oracle_addr: Address,
    pub source: Exchange,
    pub weight: f64,
}

/// Historical record correlating an on-chain transmission with the CEX price
/// near it. Append-only; `error_bps` is derived and recomputable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSample {
    pub chain_id: u64,
    pub oracle_addr: Address,
    pub block_number: u64,
    pub tx_hash: H256,
    /// Published answer in the oracle's native fixed-point
    pub answer: I256,
    /// Aggregated CEX price at the fitted observation instant
    pub cex_price_at_observation: f64,
    /// Block timestamp of the transmission, milliseconds
    pub event_ts_ms: i64,
    /// round((answer/predicted - 1) * 10000)
    pub error_bps: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_floor_rounds_down_to_100ms() {
        assert_eq!(bucket_floor(1_699_000_000_123), 1_699_000_000_100);
        assert_eq!(bucket_floor(1_699_000_000_100), 1_699_000_000_100);
        assert_eq!(bucket_floor(99), 0);
        assert_eq!(bucket_floor(-50), -100);
    }

    #[test]
    fn exchange_parse_round_trip() {
        for ex in Exchange::all() {
            assert_eq!(Exchange::from_str(ex.as_str()), Some(ex));
        }
        assert_eq!(Exchange::from_str("Binance"), Some(Exchange::Binance));
        assert_eq!(Exchange::from_str("kraken"), None);
    }
}
