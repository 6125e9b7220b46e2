//! Configuration management for oraclecast
//!
//! Loads from TOML files + environment variables via .env. Every recognized
//! option is a typed field with a default; downstream code receives the
//! fully-resolved struct and never does raw key lookups.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use ethers::types::{Address, U256};
use serde::Deserialize;

use crate::types::{Exchange, OracleConfig};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub calibration: CalibrationConfig,
    /// Exchange/symbol pairs to ingest
    #[serde(default)]
    pub feeds: Vec<FeedSpec>,
    /// Oracles to predict and calibrate
    #[serde(default)]
    pub oracles: Vec<OracleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind address for the query API
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite tick database
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Buffer flush interval in milliseconds
    pub flush_interval_ms: u64,
    /// Minutes of 1m candles expanded into synthetic ticks on cold start
    pub backfill_minutes: usize,
    /// Backward staleness bound for price lookups, milliseconds
    pub lookback_ms: i64,
    /// Forward slack tolerated by `price_at`, milliseconds
    pub forward_slack_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// Run calibration at startup and on the interval below
    pub enabled: bool,
    /// Seconds between calibration passes
    pub interval_secs: u64,
    /// Historical transmissions considered per oracle
    pub max_samples: usize,
    /// Largest candidate lag in milliseconds
    pub lag_max_ms: i64,
    /// Candidate lag step in milliseconds
    pub lag_step_ms: i64,
    /// Blocks scanned backwards for transmissions
    pub lookback_blocks: u64,
    /// Block-range chunk size for log scans
    pub chunk_blocks: u64,
    /// Pause between oracles, milliseconds
    pub pause_ms: u64,
}

/// One (exchange, canonical symbol) ingestion feed
#[derive(Debug, Clone, Deserialize)]
pub struct FeedSpec {
    pub exchange: Exchange,
    /// Canonical pair name (e.g. "BTCUSDC")
    pub symbol: String,
    /// Venue instrument identifier (e.g. "BTCUSDT", "BTC-USD")
    pub instrument: String,
}

/// One oracle to predict, as written in configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OracleSpec {
    pub chain_id: u64,
    /// Aggregator contract address, 0x-hex
    pub address: String,
    /// Aggregated symbol the oracle publishes
    pub symbol: String,
    /// Chain RPC endpoint for transmission scans
    pub rpc_url: String,
    pub heartbeat_secs: u64,
    pub deviation_bps: u32,
    pub decimals: u32,
    /// Decimal string; multiplies the native answer up to the 1e36 base
    pub scale_factor: String,
    /// Initial observation lag in seconds (calibration overwrites this)
    #[serde(default)]
    pub lag_secs: u64,
}

impl OracleSpec {
    pub fn address(&self) -> Result<Address> {
        self.address
            .parse()
            .with_context(|| format!("Invalid oracle address {}", self.address))
    }

    /// Resolve into the persisted configuration row shape.
    pub fn to_oracle_config(&self) -> Result<OracleConfig> {
        let scale_factor = U256::from_dec_str(&self.scale_factor)
            .with_context(|| format!("Invalid scale_factor {}", self.scale_factor))?;
        Ok(OracleConfig {
            chain_id: self.chain_id,
            oracle_addr: self.address()?,
            heartbeat_secs: self.heartbeat_secs,
            deviation_bps: self.deviation_bps,
            decimals: self.decimals,
            scale_factor,
            lag_secs: self.lag_secs,
        })
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Server defaults
            .set_default("server.bind_addr", "127.0.0.1:8080")?
            // Store defaults
            .set_default("store.db_path", "./data/ticks.db")?
            // Ingest defaults
            .set_default("ingest.flush_interval_ms", 500)?
            .set_default("ingest.backfill_minutes", 5)?
            .set_default("ingest.lookback_ms", 2_000)?
            .set_default("ingest.forward_slack_ms", 300)?
            // Calibration defaults
            .set_default("calibration.enabled", true)?
            .set_default("calibration.interval_secs", 3_600)?
            .set_default("calibration.max_samples", 60)?
            .set_default("calibration.lag_max_ms", 3_000)?
            .set_default("calibration.lag_step_ms", 100)?
            .set_default("calibration.lookback_blocks", 50_000)?
            .set_default("calibration.chunk_blocks", 5_000)?
            .set_default("calibration.pause_ms", 1_000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (ORACLECAST_*)
            .add_source(Environment::with_prefix("ORACLECAST").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Check the invariants the rest of the system assumes
    pub fn validate(&self) -> Result<()> {
        if self.ingest.flush_interval_ms == 0 {
            bail!("ingest.flush_interval_ms must be positive");
        }
        if self.calibration.lag_step_ms <= 0 || self.calibration.lag_max_ms < 0 {
            bail!("calibration lag grid must be non-negative with a positive step");
        }
        for feed in &self.feeds {
            if feed.symbol.is_empty() || feed.instrument.is_empty() {
                bail!("feed for {} has an empty symbol or instrument", feed.exchange);
            }
        }
        for oracle in &self.oracles {
            let cfg = oracle.to_oracle_config()?;
            if cfg.heartbeat_secs == 0 {
                bail!("oracle {} heartbeat_secs must be positive", oracle.address);
            }
            if cfg.scale_factor.is_zero() {
                bail!("oracle {} scale_factor must be positive", oracle.address);
            }
            if !self.feeds.iter().any(|f| f.symbol == oracle.symbol) {
                bail!(
                    "oracle {} references symbol {} with no configured feed",
                    oracle.address,
                    oracle.symbol
                );
            }
        }
        Ok(())
    }

    /// Feeds for one canonical symbol
    pub fn feeds_for_symbol(&self, symbol: &str) -> Vec<&FeedSpec> {
        self.feeds.iter().filter(|f| f.symbol == symbol).collect()
    }

    /// Baseline symbol used by the default adapter fallback
    pub fn baseline_symbol(&self) -> String {
        self.feeds
            .first()
            .map(|f| f.symbol.clone())
            .unwrap_or_else(|| "BTCUSDC".to_string())
    }

    /// Generate a digest of the config for startup logging
    pub fn digest(&self) -> String {
        format!(
            "feeds={} oracles={} flush_ms={} calibration={}",
            self.feeds.len(),
            self.oracles.len(),
            self.ingest.flush_interval_ms,
            self.calibration.enabled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(exchange: Exchange, symbol: &str, instrument: &str) -> FeedSpec {
        FeedSpec {
            exchange,
            symbol: symbol.to_string(),
            instrument: instrument.to_string(),
        }
    }

    fn base_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
            },
            store: StoreConfig {
                db_path: ":memory:".to_string(),
            },
            ingest: IngestConfig {
                flush_interval_ms: 500,
                backfill_minutes: 5,
                lookback_ms: 2_000,
                forward_slack_ms: 300,
            },
            calibration: CalibrationConfig {
                enabled: false,
                interval_secs: 3_600,
                max_samples: 60,
                lag_max_ms: 3_000,
                lag_step_ms: 100,
                lookback_blocks: 50_000,
                chunk_blocks: 5_000,
                pause_ms: 0,
            },
            feeds: vec![feed(Exchange::Binance, "BTCUSDC", "BTCUSDT")],
            oracles: vec![],
        }
    }

    #[test]
    fn validate_accepts_wellformed_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_oracle_without_feed() {
        let mut cfg = base_config();
        cfg.oracles.push(OracleSpec {
            chain_id: 42161,
            address: "0x6ce185860a4963106506C203335A2910413708e9".to_string(),
            symbol: "ETHUSDC".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            heartbeat_secs: 86_400,
            deviation_bps: 5,
            decimals: 8,
            scale_factor: "10000000000000000000000000000".to_string(),
            lag_secs: 0,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_heartbeat() {
        let mut cfg = base_config();
        cfg.oracles.push(OracleSpec {
            chain_id: 42161,
            address: "0x6ce185860a4963106506C203335A2910413708e9".to_string(),
            symbol: "BTCUSDC".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            heartbeat_secs: 0,
            deviation_bps: 5,
            decimals: 8,
            scale_factor: "10000000000000000000000000000".to_string(),
            lag_secs: 0,
        });
        assert!(cfg.validate().is_err());
    }
}
