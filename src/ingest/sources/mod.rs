//! Exchange stream implementations (Binance, Bybit, Coinbase)

mod binance;
mod bybit;
mod coinbase;

pub use binance::BinanceClient;
pub use bybit::BybitClient;
pub use coinbase::CoinbaseClient;

use crate::config::FeedSpec;
use crate::types::{Candle, Exchange, Trade};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc::Sender;

/// Trait for exchange trade-stream clients
#[async_trait]
pub trait ExchangeStream: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Connect to the exchange and stream trades until the connection dies
    async fn connect(&mut self, tx: Sender<SourceEvent>) -> Result<()>;

    /// Subscribe to feeds (canonical symbol + venue instrument)
    async fn subscribe(&mut self, feeds: &[FeedSpec]) -> Result<()>;

    /// Fetch recent 1-minute candles for one instrument (cold-start backfill)
    async fn recent_candles(&self, instrument: &str, limit: usize) -> Result<Vec<Candle>>;

    /// Check if connected
    fn is_connected(&self) -> bool;
}

/// Events from exchange streams
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// New trade received
    Trade(Trade),
    /// Connection status changed
    Connected(String),
    Disconnected(String),
    /// Error occurred
    Error(String, String),
}

/// Instrument → canonical symbol mapping shared by the clients
pub(crate) fn symbol_map(feeds: &[FeedSpec], exchange: Exchange) -> HashMap<String, String> {
    feeds
        .iter()
        .filter(|f| f.exchange == exchange)
        .map(|f| (f.instrument.to_uppercase(), f.symbol.clone()))
        .collect()
}

/// Construct the client for one exchange
pub fn client_for(exchange: Exchange) -> Box<dyn ExchangeStream> {
    match exchange {
        Exchange::Binance => Box::new(BinanceClient::new()),
        Exchange::Bybit => Box::new(BybitClient::new()),
        Exchange::Coinbase => Box::new(CoinbaseClient::new()),
    }
}
