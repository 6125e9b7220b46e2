//! Tick store
//!
//! SQLite-backed time-series store for raw exchange trades, the derived
//! 100ms bins, and the per-oracle configuration/weight/sample tables.
//! All access goes through an injected `TickStore` handle; components never
//! share an ambient connection.

use anyhow::{Context, Result};
use ethers::types::{Address, H256, I256, U256};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::types::{
    AggregateBin, CexWeight, Exchange, OracleConfig, OracleSample, SourceBin, Trade, BUCKET_MS,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS trades (
    symbol TEXT NOT NULL,
    source TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    price REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_symbol_ts
    ON trades(symbol, ts_ms);

CREATE TABLE IF NOT EXISTS source_bins (
    symbol TEXT NOT NULL,
    source TEXT NOT NULL,
    bucket_ms INTEGER NOT NULL,
    price REAL NOT NULL,
    PRIMARY KEY (symbol, source, bucket_ms)
);

CREATE TABLE IF NOT EXISTS aggregate_bins (
    symbol TEXT NOT NULL,
    bucket_ms INTEGER NOT NULL,
    price REAL NOT NULL,
    PRIMARY KEY (symbol, bucket_ms)
);

CREATE TABLE IF NOT EXISTS oracle_configs (
    chain_id INTEGER NOT NULL,
    oracle_addr TEXT NOT NULL,
    heartbeat_secs INTEGER NOT NULL,
    deviation_bps INTEGER NOT NULL,
    decimals INTEGER NOT NULL,
    scale_factor TEXT NOT NULL,
    lag_secs INTEGER NOT NULL,
    PRIMARY KEY (chain_id, oracle_addr)
);

CREATE TABLE IF NOT EXISTS cex_weights (
    chain_id INTEGER NOT NULL,
    oracle_addr TEXT NOT NULL,
    source TEXT NOT NULL,
    weight REAL NOT NULL,
    PRIMARY KEY (chain_id, oracle_addr, source)
);

CREATE TABLE IF NOT EXISTS oracle_samples (
    chain_id INTEGER NOT NULL,
    oracle_addr TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    tx_hash TEXT NOT NULL,
    answer TEXT NOT NULL,
    cex_price REAL NOT NULL,
    event_ts_ms INTEGER NOT NULL,
    error_bps REAL NOT NULL,
    UNIQUE (chain_id, oracle_addr, tx_hash)
);

CREATE INDEX IF NOT EXISTS idx_oracle_samples_event_ts
    ON oracle_samples(chain_id, oracle_addr, event_ts_ms);
"#;

fn addr_text(addr: &Address) -> String {
    format!("{addr:#x}")
}

fn hash_text(hash: &H256) -> String {
    format!("{hash:#x}")
}

/// Handle to the tick database. Cheap to clone; internally synchronized.
#[derive(Clone)]
pub struct TickStore {
    conn: Arc<Mutex<Connection>>,
}

impl TickStore {
    /// Open or create the store at `db_path`.
    pub fn open(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database: {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!(path = %db_path, "Tick store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─── Trades ──────────────────────────────────────────────────────

    /// Append a batch of trades with one multi-row insert per chunk.
    ///
    /// On batch failure, falls back to per-row inserts so one malformed row
    /// cannot drop the whole batch; rows that still fail are dropped and
    /// logged. Returns the number of rows actually written.
    pub fn insert_trades(&self, trades: &[Trade]) -> Result<usize> {
        // 4 bind variables per row; stay far under SQLite's variable limit
        const CHUNK_ROWS: usize = 500;

        if trades.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();
        let mut written = 0usize;
        for chunk in trades.chunks(CHUNK_ROWS) {
            written += Self::insert_trade_chunk(&conn, chunk);
        }
        Ok(written)
    }

    fn insert_trade_chunk(conn: &Connection, trades: &[Trade]) -> usize {
        let placeholders = vec!["(?, ?, ?, ?)"; trades.len()].join(", ");
        let sql = format!("INSERT INTO trades (symbol, source, ts_ms, price) VALUES {placeholders}");

        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(trades.len() * 4);
        for t in trades {
            values.push(t.symbol.clone().into());
            values.push(t.source.as_str().to_string().into());
            values.push(t.ts_ms.into());
            values.push(t.price.into());
        }

        match conn.execute(&sql, params_from_iter(values)) {
            Ok(n) => n,
            Err(batch_err) => {
                warn!(
                    rows = trades.len(),
                    error = %batch_err,
                    "Batch trade insert failed, falling back to per-row inserts"
                );
                let mut written = 0usize;
                for t in trades {
                    let row = conn.execute(
                        "INSERT INTO trades (symbol, source, ts_ms, price) VALUES (?1, ?2, ?3, ?4)",
                        params![t.symbol, t.source.as_str(), t.ts_ms, t.price],
                    );
                    match row {
                        Ok(_) => written += 1,
                        Err(e) => warn!(
                            symbol = %t.symbol,
                            source = %t.source,
                            ts_ms = t.ts_ms,
                            error = %e,
                            "Dropping trade row that failed to insert"
                        ),
                    }
                }
                written
            }
        }
    }

    /// Raw trade prices in one 100ms bucket, grouped by source.
    pub fn trades_in_bucket(
        &self,
        symbol: &str,
        bucket_ms: i64,
    ) -> Result<HashMap<Exchange, Vec<f64>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT source, price FROM trades
             WHERE symbol = ?1 AND ts_ms >= ?2 AND ts_ms < ?3
             ORDER BY ts_ms ASC",
        )?;

        let mut by_source: HashMap<Exchange, Vec<f64>> = HashMap::new();
        let rows = stmt.query_map(params![symbol, bucket_ms, bucket_ms + BUCKET_MS], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        for row in rows {
            let (source, price) = row?;
            if let Some(exchange) = Exchange::from_str(&source) {
                by_source.entry(exchange).or_default().push(price);
            }
        }
        Ok(by_source)
    }

    /// Whether any trade rows exist for a symbol (backfill guard).
    pub fn has_trades(&self, symbol: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM trades WHERE symbol = ?1)",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count != 0)
    }

    pub fn trade_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ─── Bins ────────────────────────────────────────────────────────

    pub fn upsert_source_bin(&self, bin: &SourceBin) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO source_bins (symbol, source, bucket_ms, price)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol, source, bucket_ms) DO UPDATE SET price = excluded.price",
            params![bin.symbol, bin.source.as_str(), bin.bucket_ms, bin.price],
        )?;
        Ok(())
    }

    pub fn upsert_aggregate_bin(&self, bin: &AggregateBin) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO aggregate_bins (symbol, bucket_ms, price)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol, bucket_ms) DO UPDATE SET price = excluded.price",
            params![bin.symbol, bin.bucket_ms, bin.price],
        )?;
        Ok(())
    }

    /// Aggregate bin at or before `t_ms` (bounded by `lookback_ms`), else the
    /// first bin in the forward slack window `(t_ms, t_ms + slack_ms]`.
    pub fn aggregate_at(
        &self,
        symbol: &str,
        t_ms: i64,
        lookback_ms: i64,
        slack_ms: i64,
    ) -> Result<Option<AggregateBin>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare_cached(
            "SELECT bucket_ms, price FROM aggregate_bins
             WHERE symbol = ?1 AND bucket_ms <= ?2 AND bucket_ms >= ?3
             ORDER BY bucket_ms DESC LIMIT 1",
        )?;
        let back = stmt
            .query_map(params![symbol, t_ms, t_ms - lookback_ms], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .next()
            .transpose()?;
        if let Some((bucket_ms, price)) = back {
            return Ok(Some(AggregateBin {
                symbol: symbol.to_string(),
                bucket_ms,
                price,
            }));
        }

        let mut stmt = conn.prepare_cached(
            "SELECT bucket_ms, price FROM aggregate_bins
             WHERE symbol = ?1 AND bucket_ms > ?2 AND bucket_ms <= ?3
             ORDER BY bucket_ms ASC LIMIT 1",
        )?;
        let fwd = stmt
            .query_map(params![symbol, t_ms, t_ms + slack_ms], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .next()
            .transpose()?;
        Ok(fwd.map(|(bucket_ms, price)| AggregateBin {
            symbol: symbol.to_string(),
            bucket_ms,
            price,
        }))
    }

    /// Source bin nearest `t_ms` within `±window_ms`, preferring bins at or
    /// before `t_ms`.
    pub fn source_bin_near(
        &self,
        symbol: &str,
        source: Exchange,
        t_ms: i64,
        window_ms: i64,
    ) -> Result<Option<SourceBin>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare_cached(
            "SELECT bucket_ms, price FROM source_bins
             WHERE symbol = ?1 AND source = ?2 AND bucket_ms <= ?3 AND bucket_ms >= ?4
             ORDER BY bucket_ms DESC LIMIT 1",
        )?;
        let back = stmt
            .query_map(
                params![symbol, source.as_str(), t_ms, t_ms - window_ms],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )?
            .next()
            .transpose()?;
        if let Some((bucket_ms, price)) = back {
            return Ok(Some(SourceBin {
                symbol: symbol.to_string(),
                source,
                bucket_ms,
                price,
            }));
        }

        let mut stmt = conn.prepare_cached(
            "SELECT bucket_ms, price FROM source_bins
             WHERE symbol = ?1 AND source = ?2 AND bucket_ms > ?3 AND bucket_ms <= ?4
             ORDER BY bucket_ms ASC LIMIT 1",
        )?;
        let fwd = stmt
            .query_map(
                params![symbol, source.as_str(), t_ms, t_ms + window_ms],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )?
            .next()
            .transpose()?;
        Ok(fwd.map(|(bucket_ms, price)| SourceBin {
            symbol: symbol.to_string(),
            source,
            bucket_ms,
            price,
        }))
    }

    pub fn bin_counts(&self) -> Result<(u64, u64)> {
        let conn = self.conn.lock();
        let source: i64 = conn.query_row("SELECT COUNT(*) FROM source_bins", [], |r| r.get(0))?;
        let aggregate: i64 =
            conn.query_row("SELECT COUNT(*) FROM aggregate_bins", [], |r| r.get(0))?;
        Ok((source as u64, aggregate as u64))
    }

    // ─── Oracle configuration ────────────────────────────────────────

    /// Seed or refresh the externally-owned fields of an oracle's
    /// configuration (heartbeat, deviation, decimals, scale). The calibrated
    /// lag is preserved, so a restart never resets it.
    pub fn seed_oracle_config(&self, cfg: &OracleConfig) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO oracle_configs
                 (chain_id, oracle_addr, heartbeat_secs, deviation_bps, decimals, scale_factor, lag_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(chain_id, oracle_addr) DO UPDATE SET
                 heartbeat_secs = excluded.heartbeat_secs,
                 deviation_bps = excluded.deviation_bps,
                 decimals = excluded.decimals,
                 scale_factor = excluded.scale_factor",
            params![
                cfg.chain_id as i64,
                addr_text(&cfg.oracle_addr),
                cfg.heartbeat_secs as i64,
                cfg.deviation_bps as i64,
                cfg.decimals as i64,
                cfg.scale_factor.to_string(),
                cfg.lag_secs as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_oracle_config(&self, chain_id: u64, oracle_addr: Address) -> Result<Option<OracleConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT heartbeat_secs, deviation_bps, decimals, scale_factor, lag_secs
             FROM oracle_configs WHERE chain_id = ?1 AND oracle_addr = ?2",
        )?;
        let row = stmt
            .query_map(params![chain_id as i64, addr_text(&oracle_addr)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .next()
            .transpose()?;

        row.map(|(heartbeat, deviation, decimals, scale, lag)| {
            let scale_factor = U256::from_dec_str(&scale)
                .with_context(|| format!("Corrupt scale_factor for {oracle_addr:#x}"))?;
            Ok(OracleConfig {
                chain_id,
                oracle_addr,
                heartbeat_secs: heartbeat as u64,
                deviation_bps: deviation as u32,
                decimals: decimals as u32,
                scale_factor,
                lag_secs: lag as u64,
            })
        })
        .transpose()
    }

    pub fn list_oracle_configs(&self) -> Result<Vec<OracleConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT chain_id, oracle_addr, heartbeat_secs, deviation_bps, decimals, scale_factor, lag_secs
             FROM oracle_configs ORDER BY chain_id, oracle_addr",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut configs = Vec::new();
        for row in rows {
            let (chain_id, addr, heartbeat, deviation, decimals, scale, lag) = row?;
            let oracle_addr: Address = addr
                .parse()
                .with_context(|| format!("Corrupt oracle_addr {addr}"))?;
            let scale_factor = U256::from_dec_str(&scale)
                .with_context(|| format!("Corrupt scale_factor for {addr}"))?;
            configs.push(OracleConfig {
                chain_id: chain_id as u64,
                oracle_addr,
                heartbeat_secs: heartbeat as u64,
                deviation_bps: deviation as u32,
                decimals: decimals as u32,
                scale_factor,
                lag_secs: lag as u64,
            });
        }
        Ok(configs)
    }

    /// Persist a calibrated lag (whole seconds).
    pub fn set_oracle_lag(&self, chain_id: u64, oracle_addr: Address, lag_secs: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE oracle_configs SET lag_secs = ?3 WHERE chain_id = ?1 AND oracle_addr = ?2",
            params![chain_id as i64, addr_text(&oracle_addr), lag_secs as i64],
        )?;
        Ok(())
    }

    // ─── Weights ─────────────────────────────────────────────────────

    /// Replace the full weight vector for one oracle atomically.
    pub fn replace_weights(&self, chain_id: u64, oracle_addr: Address, weights: &[CexWeight]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM cex_weights WHERE chain_id = ?1 AND oracle_addr = ?2",
            params![chain_id as i64, addr_text(&oracle_addr)],
        )?;
        for w in weights {
            tx.execute(
                "INSERT INTO cex_weights (chain_id, oracle_addr, source, weight)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    chain_id as i64,
                    addr_text(&oracle_addr),
                    w.source.as_str(),
                    w.weight
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_weights(&self, chain_id: u64, oracle_addr: Address) -> Result<Vec<CexWeight>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT source, weight FROM cex_weights
             WHERE chain_id = ?1 AND oracle_addr = ?2 ORDER BY source",
        )?;
        let rows = stmt.query_map(params![chain_id as i64, addr_text(&oracle_addr)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;

        let mut weights = Vec::new();
        for row in rows {
            let (source, weight) = row?;
            if let Some(exchange) = Exchange::from_str(&source) {
                weights.push(CexWeight {
                    chain_id,
                    oracle_addr,
                    source: exchange,
                    weight,
                });
            }
        }
        Ok(weights)
    }

    // ─── Samples ─────────────────────────────────────────────────────

    pub fn insert_sample(&self, sample: &OracleSample) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO oracle_samples
                 (chain_id, oracle_addr, block_number, tx_hash, answer, cex_price, event_ts_ms, error_bps)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(chain_id, oracle_addr, tx_hash) DO UPDATE SET
                 cex_price = excluded.cex_price,
                 error_bps = excluded.error_bps",
            params![
                sample.chain_id as i64,
                addr_text(&sample.oracle_addr),
                sample.block_number as i64,
                hash_text(&sample.tx_hash),
                sample.answer.to_string(),
                sample.cex_price_at_observation,
                sample.event_ts_ms,
                sample.error_bps,
            ],
        )?;
        Ok(())
    }

    /// Most recent samples, newest first.
    pub fn recent_samples(
        &self,
        chain_id: u64,
        oracle_addr: Address,
        limit: usize,
    ) -> Result<Vec<OracleSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT block_number, tx_hash, answer, cex_price, event_ts_ms, error_bps
             FROM oracle_samples
             WHERE chain_id = ?1 AND oracle_addr = ?2
             ORDER BY event_ts_ms DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![chain_id as i64, addr_text(&oracle_addr), limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, f64>(5)?,
                ))
            },
        )?;

        let mut samples = Vec::new();
        for row in rows {
            let (block_number, tx_hash, answer, cex_price, event_ts_ms, error_bps) = row?;
            let tx_hash: H256 = tx_hash
                .parse()
                .with_context(|| format!("Corrupt tx_hash {tx_hash}"))?;
            let answer =
                I256::from_dec_str(&answer).with_context(|| format!("Corrupt answer {answer}"))?;
            samples.push(OracleSample {
                chain_id,
                oracle_addr,
                block_number: block_number as u64,
                tx_hash,
                answer,
                cex_price_at_observation: cex_price,
                event_ts_ms,
                error_bps,
            });
        }
        Ok(samples)
    }

    pub fn latest_sample(&self, chain_id: u64, oracle_addr: Address) -> Result<Option<OracleSample>> {
        Ok(self.recent_samples(chain_id, oracle_addr, 1)?.into_iter().next())
    }

    pub fn sample_count(&self, chain_id: u64, oracle_addr: Address) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM oracle_samples WHERE chain_id = ?1 AND oracle_addr = ?2",
            params![chain_id as i64, addr_text(&oracle_addr)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(symbol: &str, source: Exchange, ts_ms: i64, price: f64) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            source,
            ts_ms,
            price,
        }
    }

    fn oracle_addr() -> Address {
        "0x6ce185860a4963106506c203335a2910413708e9".parse().unwrap()
    }

    #[test]
    fn batch_insert_falls_back_and_drops_only_bad_rows() {
        let store = TickStore::open_memory().unwrap();
        let trades = vec![
            trade("BTCUSDC", Exchange::Binance, 1_000, 100.0),
            // NaN cannot be bound to a NOT NULL REAL column
            trade("BTCUSDC", Exchange::Bybit, 1_010, f64::NAN),
            trade("BTCUSDC", Exchange::Coinbase, 1_020, 102.0),
        ];
        let written = store.insert_trades(&trades).unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.trade_count().unwrap(), 2);
    }

    #[test]
    fn trades_in_bucket_groups_by_source() {
        let store = TickStore::open_memory().unwrap();
        store
            .insert_trades(&[
                trade("BTCUSDC", Exchange::Binance, 1_000, 100.0),
                trade("BTCUSDC", Exchange::Binance, 1_050, 101.0),
                trade("BTCUSDC", Exchange::Bybit, 1_090, 102.0),
                // outside the bucket
                trade("BTCUSDC", Exchange::Binance, 1_100, 999.0),
            ])
            .unwrap();

        let by_source = store.trades_in_bucket("BTCUSDC", 1_000).unwrap();
        assert_eq!(by_source[&Exchange::Binance], vec![100.0, 101.0]);
        assert_eq!(by_source[&Exchange::Bybit], vec![102.0]);
    }

    #[test]
    fn aggregate_at_prefers_backward_then_forward_slack() {
        let store = TickStore::open_memory().unwrap();
        store
            .upsert_aggregate_bin(&AggregateBin {
                symbol: "BTCUSDC".to_string(),
                bucket_ms: 1_000,
                price: 100.0,
            })
            .unwrap();
        store
            .upsert_aggregate_bin(&AggregateBin {
                symbol: "BTCUSDC".to_string(),
                bucket_ms: 1_200,
                price: 101.0,
            })
            .unwrap();

        // at-or-before wins
        let bin = store.aggregate_at("BTCUSDC", 1_050, 2_000, 300).unwrap().unwrap();
        assert_eq!(bin.price, 100.0);

        // nothing at-or-before within the 100ms lookback, forward slack
        // catches the first later bin
        let bin = store.aggregate_at("BTCUSDC", 950, 100, 300).unwrap().unwrap();
        assert_eq!(bin.price, 100.0);

        // out of both windows
        assert!(store.aggregate_at("BTCUSDC", 5_000, 1_000, 300).unwrap().is_none());
    }

    #[test]
    fn upserts_are_idempotent() {
        let store = TickStore::open_memory().unwrap();
        let mut bin = SourceBin {
            symbol: "BTCUSDC".to_string(),
            source: Exchange::Binance,
            bucket_ms: 1_000,
            price: 100.0,
        };
        store.upsert_source_bin(&bin).unwrap();
        bin.price = 105.0;
        store.upsert_source_bin(&bin).unwrap();

        let found = store
            .source_bin_near("BTCUSDC", Exchange::Binance, 1_000, 2_000)
            .unwrap()
            .unwrap();
        assert_eq!(found.price, 105.0);
        assert_eq!(store.bin_counts().unwrap().0, 1);
    }

    #[test]
    fn seed_preserves_calibrated_lag() {
        let store = TickStore::open_memory().unwrap();
        let cfg = OracleConfig {
            chain_id: 42161,
            oracle_addr: oracle_addr(),
            heartbeat_secs: 86_400,
            deviation_bps: 5,
            decimals: 8,
            scale_factor: U256::exp10(28),
            lag_secs: 0,
        };
        store.seed_oracle_config(&cfg).unwrap();
        store.set_oracle_lag(42161, oracle_addr(), 2).unwrap();

        // re-seeding (restart) must not clobber the calibrated lag
        store.seed_oracle_config(&cfg).unwrap();
        let loaded = store.get_oracle_config(42161, oracle_addr()).unwrap().unwrap();
        assert_eq!(loaded.lag_secs, 2);
        assert_eq!(loaded.scale_factor, U256::exp10(28));
    }

    #[test]
    fn weights_replace_and_read_back() {
        let store = TickStore::open_memory().unwrap();
        let mk = |source, weight| CexWeight {
            chain_id: 42161,
            oracle_addr: oracle_addr(),
            source,
            weight,
        };
        store
            .replace_weights(42161, oracle_addr(), &[mk(Exchange::Binance, 0.5), mk(Exchange::Bybit, 0.5)])
            .unwrap();
        store
            .replace_weights(
                42161,
                oracle_addr(),
                &[
                    mk(Exchange::Binance, 1.0 / 3.0),
                    mk(Exchange::Bybit, 1.0 / 3.0),
                    mk(Exchange::Coinbase, 1.0 / 3.0),
                ],
            )
            .unwrap();

        let weights = store.get_weights(42161, oracle_addr()).unwrap();
        assert_eq!(weights.len(), 3);
        assert!(weights.iter().all(|w| (w.weight - 1.0 / 3.0).abs() < 1e-12));
    }

    #[test]
    fn reopened_database_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticks.db");
        let path = path.to_str().unwrap();

        let store = TickStore::open(path).unwrap();
        store
            .insert_trades(&[trade("BTCUSDC", Exchange::Binance, 1_000, 100.0)])
            .unwrap();
        drop(store);

        let store = TickStore::open(path).unwrap();
        assert_eq!(store.trade_count().unwrap(), 1);
        assert!(store.has_trades("BTCUSDC").unwrap());
    }

    #[test]
    fn samples_round_trip_large_answers() {
        let store = TickStore::open_memory().unwrap();
        let answer = I256::from_dec_str("-3138550867693340381917894711603833208051177722232017256447")
            .unwrap(); // -(2^191 - 1)
        let sample = OracleSample {
            chain_id: 42161,
            oracle_addr: oracle_addr(),
            block_number: 1_234,
            tx_hash: H256::repeat_byte(0xab),
            answer,
            cex_price_at_observation: 65_000.5,
            event_ts_ms: 1_699_000_000_000,
            error_bps: -3.0,
        };
        store.insert_sample(&sample).unwrap();
        // idempotent on (chain, oracle, tx_hash)
        store.insert_sample(&sample).unwrap();

        let samples = store.recent_samples(42161, oracle_addr(), 10).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].answer, answer);
        assert_eq!(samples[0].block_number, 1_234);
    }
}
