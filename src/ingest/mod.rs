//! Trade ingestion
//!
//! Owns the pending-trade buffer between the exchange streams and the tick
//! store. A timer-driven flush drains the buffer into one batch insert and
//! rebuilds the affected 100ms buckets; overlapping flush fires skip instead
//! of queueing. Cold-start backfill expands recent 1-minute candles into
//! per-second synthetic ticks so the aggregator has coverage before the live
//! streams catch up.

pub mod sources;

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::config::FeedSpec;
use crate::retry::RetryPolicy;
use crate::store::TickStore;
use crate::types::{bucket_floor, Candle, Exchange, Trade};

use sources::SourceEvent;

/// Buffered writer between the exchange streams and the store
pub struct TickIngestor {
    store: TickStore,
    aggregator: Aggregator,
    buffer: Mutex<Vec<Trade>>,
    flush_in_progress: AtomicBool,
    flush_interval: Duration,
}

impl TickIngestor {
    pub fn new(store: TickStore, aggregator: Aggregator, flush_interval: Duration) -> Self {
        Self {
            store,
            aggregator,
            buffer: Mutex::new(Vec::new()),
            flush_in_progress: AtomicBool::new(false),
            flush_interval,
        }
    }

    /// Add a trade to the pending buffer.
    pub fn enqueue(&self, trade: Trade) {
        self.buffer.lock().push(trade);
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Drain the buffer into the store and rebuild the touched buckets.
    ///
    /// Safe to call concurrently: an overlapping flush skips. Returns the
    /// number of rows written.
    pub fn flush(&self) -> usize {
        if self.flush_in_progress.swap(true, Ordering::SeqCst) {
            debug!("Flush already in progress, skipping");
            return 0;
        }

        let drained: Vec<Trade> = std::mem::take(&mut *self.buffer.lock());
        let mut written = 0;
        if !drained.is_empty() {
            match self.store.insert_trades(&drained) {
                Ok(n) => written = n,
                Err(e) => warn!(rows = drained.len(), error = %e, "Dropping trade batch"),
            }

            let buckets: BTreeSet<(String, i64)> = drained
                .iter()
                .map(|t| (t.symbol.clone(), bucket_floor(t.ts_ms)))
                .collect();
            for (symbol, bucket_ms) in buckets {
                if let Err(e) = self.aggregator.rebuild(&symbol, bucket_ms) {
                    warn!(symbol = %symbol, bucket_ms, error = %e, "Bucket rebuild failed");
                }
            }
        }

        self.flush_in_progress.store(false, Ordering::SeqCst);
        written
    }

    /// Background flush on a fixed interval.
    pub fn spawn_flush_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let written = self.flush();
                if written > 0 {
                    debug!(rows = written, "Flushed trade buffer");
                }
            }
        })
    }

    /// Receive stream events and feed the buffer.
    pub fn spawn_event_loop(self: Arc<Self>, mut rx: Receiver<SourceEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SourceEvent::Trade(trade) => self.enqueue(trade),
                    SourceEvent::Connected(name) => info!(source = %name, "Source connected"),
                    SourceEvent::Disconnected(name) => {
                        warn!(source = %name, "Source disconnected")
                    }
                    SourceEvent::Error(name, error) => {
                        debug!(source = %name, error = %error, "Source error")
                    }
                }
            }
        })
    }

    /// Cold-start backfill: for each feed whose symbol has no history, fetch
    /// recent 1-minute candles and expand them into one synthetic tick per
    /// second at the candle close. Symbols with any existing rows are left
    /// untouched. A feed whose fetch exhausts its retries is abandoned
    /// without failing the run.
    pub async fn backfill(&self, feeds: &[FeedSpec], minutes: usize, retry: RetryPolicy) {
        for feed in feeds {
            match self.store.has_trades(&feed.symbol) {
                Ok(true) => {
                    debug!(symbol = %feed.symbol, "Existing history found, skipping backfill");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(symbol = %feed.symbol, error = %e, "Backfill history check failed");
                    continue;
                }
            }

            let client = sources::client_for(feed.exchange);
            let candles = match retry
                .run("backfill_candles", || {
                    client.recent_candles(&feed.instrument, minutes)
                })
                .await
            {
                Ok(candles) => candles,
                Err(e) => {
                    warn!(
                        symbol = %feed.symbol,
                        source = %feed.exchange,
                        error = %e,
                        "Backfill abandoned for feed"
                    );
                    continue;
                }
            };

            let ticks = expand_candles(&feed.symbol, feed.exchange, &candles);
            info!(
                symbol = %feed.symbol,
                source = %feed.exchange,
                candles = candles.len(),
                ticks = ticks.len(),
                "Backfilling synthetic ticks"
            );
            for tick in ticks {
                self.enqueue(tick);
            }
            self.flush();
        }
    }
}

/// One synthetic tick per second at the candle close.
fn expand_candles(symbol: &str, source: Exchange, candles: &[Candle]) -> Vec<Trade> {
    let mut ticks = Vec::with_capacity(candles.len() * 60);
    for candle in candles {
        for second in 0..60 {
            ticks.push(Trade {
                symbol: symbol.to_string(),
                source,
                ts_ms: candle.open_time + second * 1_000,
                price: candle.close,
            });
        }
    }
    ticks
}

/// Spawn one streaming task per exchange present in the feed list.
pub fn spawn_sources(feeds: &[FeedSpec], tx: Sender<SourceEvent>) -> Vec<JoinHandle<()>> {
    let exchanges: BTreeSet<Exchange> = feeds.iter().map(|f| f.exchange).collect();
    let mut handles = Vec::new();

    for exchange in exchanges {
        let mut client = sources::client_for(exchange);
        let feeds = feeds.to_vec();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = client.subscribe(&feeds).await {
                tracing::error!(source = %client.name(), error = %e, "Subscribe failed");
                return;
            }
            if let Err(e) = client.connect(tx).await {
                tracing::error!(source = %client.name(), error = %e, "Stream task exited");
            }
        }));
    }
    handles
}
