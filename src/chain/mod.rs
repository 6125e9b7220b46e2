//! Chain RPC scanner for historical oracle transmissions
//!
//! Walks an oracle's recent logs in fixed block-range chunks, pulls each
//! transmit transaction's calldata, and recovers the published answer via
//! the report decoder. This path does not depend on any event ABI, so it
//! stays correct when the indexer's ABI differs from the deployed contract.

use anyhow::{Context, Result};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Filter, H256, I256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::report;
use crate::retry::RetryPolicy;

/// One historical transmit call recovered from the chain
#[derive(Debug, Clone)]
pub struct Transmission {
    pub block_number: u64,
    pub tx_hash: H256,
    /// Block timestamp, milliseconds
    pub timestamp_ms: i64,
    /// Answer recovered from the transmit calldata
    pub answer: I256,
}

/// Bounded, chunked log scanner over one RPC endpoint
pub struct TransmissionScanner {
    provider: Provider<Http>,
    chunk_blocks: u64,
    retry: RetryPolicy,
}

impl TransmissionScanner {
    pub fn new(rpc_url: &str, chunk_blocks: u64, retry: RetryPolicy) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("Invalid RPC endpoint {rpc_url}"))?;
        Ok(Self {
            provider,
            chunk_blocks: chunk_blocks.max(1),
            retry,
        })
    }

    /// Up to `max` transmissions from the last `lookback_blocks` blocks,
    /// newest blocks scanned first, returned in ascending event time.
    pub async fn recent_transmissions(
        &self,
        oracle: Address,
        lookback_blocks: u64,
        max: usize,
    ) -> Result<Vec<Transmission>> {
        let latest = self
            .retry
            .run("eth_blockNumber", || self.provider.get_block_number())
            .await
            .context("Failed to fetch latest block number")?
            .as_u64();
        let floor = latest.saturating_sub(lookback_blocks);

        let mut transmissions = Vec::new();
        let mut seen_txs: HashSet<H256> = HashSet::new();
        let mut block_ts: HashMap<u64, i64> = HashMap::new();
        let mut to = latest;

        loop {
            let from = to.saturating_sub(self.chunk_blocks - 1).max(floor);
            let filter = Filter::new().address(oracle).from_block(from).to_block(to);
            let logs = self
                .retry
                .run("eth_getLogs", || self.provider.get_logs(&filter))
                .await
                .with_context(|| format!("Log scan failed for blocks {from}..{to}"))?;
            debug!(oracle = %format!("{oracle:#x}"), from, to, logs = logs.len(), "Scanned chunk");

            // newest first within the chunk so the cap keeps recent history
            for log in logs.iter().rev() {
                let (Some(tx_hash), Some(block_number)) = (log.transaction_hash, log.block_number)
                else {
                    continue;
                };
                if !seen_txs.insert(tx_hash) {
                    continue;
                }

                let tx = match self
                    .retry
                    .run("eth_getTransactionByHash", || {
                        self.provider.get_transaction(tx_hash)
                    })
                    .await
                {
                    Ok(Some(tx)) => tx,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(tx = %format!("{tx_hash:#x}"), error = %e, "Skipping unfetchable transaction");
                        continue;
                    }
                };

                // not every log on the aggregator is a transmit call
                let Some((_, answer)) = report::decode_any(&tx.input) else {
                    continue;
                };

                let block_number = block_number.as_u64();
                let timestamp_ms = match block_ts.get(&block_number) {
                    Some(ts) => *ts,
                    None => {
                        let block = match self
                            .retry
                            .run("eth_getBlockByNumber", || {
                                self.provider.get_block(block_number)
                            })
                            .await
                        {
                            Ok(Some(block)) => block,
                            Ok(None) => continue,
                            Err(e) => {
                                warn!(block = block_number, error = %e, "Skipping block without timestamp");
                                continue;
                            }
                        };
                        let ts = block.timestamp.as_u64() as i64 * 1_000;
                        block_ts.insert(block_number, ts);
                        ts
                    }
                };

                transmissions.push(Transmission {
                    block_number,
                    tx_hash,
                    timestamp_ms,
                    answer,
                });
                if transmissions.len() >= max {
                    break;
                }
            }

            if transmissions.len() >= max || from == floor || from == 0 {
                break;
            }
            to = from - 1;
        }

        transmissions.sort_by_key(|t| t.timestamp_ms);
        Ok(transmissions)
    }
}
