//! Binance WebSocket client for real-time trade data
//!
//! Connects to Binance spot market combined streams for aggregate trades,
//! and serves 1-minute kline backfill over REST.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::FeedSpec;
use crate::ingest::sources::{symbol_map, ExchangeStream, SourceEvent};
use crate::types::{Candle, Exchange, Trade};

const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/stream";
const BINANCE_REST_URL: &str = "https://api.binance.com/api/v3/klines";

#[derive(Debug, Clone)]
pub struct BinanceClient {
    connected: bool,
    feeds: Vec<FeedSpec>,
    symbols: HashMap<String, String>,
}

impl BinanceClient {
    pub fn new() -> Self {
        Self {
            connected: false,
            feeds: Vec::new(),
            symbols: HashMap::new(),
        }
    }

    fn build_stream_url(feeds: &[FeedSpec]) -> String {
        let streams: Vec<String> = feeds
            .iter()
            .map(|f| format!("{}@aggTrade", f.instrument.to_lowercase()))
            .collect();
        format!("{}?streams={}", BINANCE_WS_URL, streams.join("/"))
    }

    fn handle_message(&self, text: &str) -> Result<Option<Trade>> {
        // Combined stream messages: {"stream":"btcusdt@aggTrade","data":{...}}
        let wrapper: serde_json::Value = serde_json::from_str(text)?;
        let stream = wrapper["stream"].as_str().unwrap_or_default();
        if !stream.contains("@aggTrade") {
            return Ok(None);
        }
        let data = &wrapper["data"];

        let instrument = data["s"].as_str().context("Missing symbol")?;
        let Some(symbol) = self.symbols.get(&instrument.to_uppercase()) else {
            return Ok(None);
        };

        let trade = Trade {
            symbol: symbol.clone(),
            source: Exchange::Binance,
            ts_ms: data["T"].as_i64().context("Missing trade time")?,
            price: data["p"].as_str().context("Missing price")?.parse()?,
        };
        Ok(Some(trade))
    }
}

#[async_trait]
impl ExchangeStream for BinanceClient {
    fn name(&self) -> &'static str {
        "Binance"
    }

    async fn connect(&mut self, tx: Sender<SourceEvent>) -> Result<()> {
        if self.feeds.is_empty() {
            bail!("No subscriptions configured for Binance");
        }
        let url = Self::build_stream_url(&self.feeds);
        let mut reconnect_attempts = 0u32;
        let max_reconnect_attempts = 10u32;
        let base_delay = Duration::from_secs(1);
        let max_delay = Duration::from_secs(60);

        'reconnect_loop: loop {
            tracing::info!(
                source = %"Binance",
                attempt = reconnect_attempts,
                "Connecting to Binance WebSocket..."
            );

            let (ws_stream, _) = match connect_async(&url).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(source = %"Binance", error = %e, "Connection failed");
                    let _ = tx
                        .send(SourceEvent::Error("Binance".to_string(), e.to_string()))
                        .await;
                    reconnect_attempts += 1;
                    if reconnect_attempts > max_reconnect_attempts {
                        bail!("Max reconnection attempts ({max_reconnect_attempts}) reached");
                    }
                    let delay = std::cmp::min(base_delay * reconnect_attempts, max_delay);
                    tokio::time::sleep(delay).await;
                    continue 'reconnect_loop;
                }
            };

            let (mut write, mut read) = ws_stream.split();
            self.connected = true;
            reconnect_attempts = 0;
            let _ = tx.send(SourceEvent::Connected("Binance".to_string())).await;
            tracing::info!(source = %"Binance", "Connected to Binance WebSocket");

            let should_reconnect = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match self.handle_message(&text) {
                        Ok(Some(trade)) => {
                            let _ = tx.send(SourceEvent::Trade(trade)).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(source = %"Binance", error = %e, "Failed to parse message");
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::warn!(source = %"Binance", "Connection closed by server");
                        break true;
                    }
                    Some(Err(e)) => {
                        tracing::error!(source = %"Binance", error = %e, "WebSocket error");
                        let _ = tx
                            .send(SourceEvent::Error("Binance".to_string(), e.to_string()))
                            .await;
                        break true;
                    }
                    None => {
                        tracing::warn!(source = %"Binance", "Stream ended");
                        break true;
                    }
                    _ => {}
                }
            };

            self.connected = false;
            let _ = tx
                .send(SourceEvent::Disconnected("Binance".to_string()))
                .await;

            if should_reconnect {
                reconnect_attempts += 1;
                if reconnect_attempts > max_reconnect_attempts {
                    bail!("Max reconnection attempts ({max_reconnect_attempts}) reached");
                }
                let delay = std::cmp::min(base_delay * reconnect_attempts, max_delay);
                tracing::info!(
                    source = %"Binance",
                    delay_secs = delay.as_secs(),
                    attempt = reconnect_attempts,
                    "Reconnecting in {} seconds...", delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            } else {
                break 'reconnect_loop;
            }
        }

        Ok(())
    }

    async fn subscribe(&mut self, feeds: &[FeedSpec]) -> Result<()> {
        self.symbols = symbol_map(feeds, Exchange::Binance);
        self.feeds = feeds
            .iter()
            .filter(|f| f.exchange == Exchange::Binance)
            .cloned()
            .collect();
        Ok(())
    }

    /// Fetch historical 1m klines from the Binance REST API
    async fn recent_candles(&self, instrument: &str, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}?symbol={}&interval=1m&limit={}",
            BINANCE_REST_URL,
            instrument.to_uppercase(),
            limit
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        let response = client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch klines from Binance")?;
        if !response.status().is_success() {
            bail!("Binance API returned error: {}", response.status());
        }

        // [[open_time, open, high, low, close, volume, close_time, ...], ...]
        let klines: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("Failed to parse Binance klines response")?;

        let candles: Vec<Candle> = klines
            .into_iter()
            .filter_map(|kline| {
                if kline.len() < 7 {
                    return None;
                }
                Some(Candle {
                    open_time: kline[0].as_i64()?,
                    close_time: kline[6].as_i64()?,
                    open: kline[1].as_str()?.parse().ok()?,
                    high: kline[2].as_str()?.parse().ok()?,
                    low: kline[3].as_str()?.parse().ok()?,
                    close: kline[4].as_str()?.parse().ok()?,
                    volume: kline[5].as_str()?.parse().ok()?,
                })
            })
            .collect();

        Ok(candles)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
