//! Coinbase Exchange WebSocket client for real-time trade data
//!
//! Subscribes to the matches channel for trade prints, and serves 1-minute
//! candle backfill over REST.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::FeedSpec;
use crate::ingest::sources::{symbol_map, ExchangeStream, SourceEvent};
use crate::types::{Candle, Exchange, Trade};

const COINBASE_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";
const COINBASE_REST_URL: &str = "https://api.exchange.coinbase.com";

#[derive(Debug, Clone, Serialize)]
struct SubscribeMsg {
    #[serde(rename = "type")]
    msg_type: String,
    product_ids: Vec<String>,
    channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CoinbaseMatch {
    #[serde(rename = "type")]
    msg_type: String,
    product_id: Option<String>,
    price: Option<String>,
    time: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CoinbaseClient {
    connected: bool,
    feeds: Vec<FeedSpec>,
    symbols: HashMap<String, String>,
}

impl CoinbaseClient {
    pub fn new() -> Self {
        Self {
            connected: false,
            feeds: Vec::new(),
            symbols: HashMap::new(),
        }
    }

    fn handle_message(&self, text: &str) -> Result<Option<Trade>> {
        let msg: CoinbaseMatch = serde_json::from_str(text)?;
        if msg.msg_type != "match" && msg.msg_type != "last_match" {
            return Ok(None);
        }

        let product_id = msg.product_id.context("Missing product_id")?;
        let Some(symbol) = self.symbols.get(&product_id.to_uppercase()) else {
            return Ok(None);
        };

        let time = msg.time.context("Missing match time")?;
        let ts_ms = DateTime::parse_from_rfc3339(&time)
            .context("Bad match timestamp")?
            .timestamp_millis();

        Ok(Some(Trade {
            symbol: symbol.clone(),
            source: Exchange::Coinbase,
            ts_ms,
            price: msg.price.context("Missing price")?.parse()?,
        }))
    }
}

#[async_trait]
impl ExchangeStream for CoinbaseClient {
    fn name(&self) -> &'static str {
        "Coinbase"
    }

    async fn connect(&mut self, tx: Sender<SourceEvent>) -> Result<()> {
        let product_ids: Vec<String> = self
            .feeds
            .iter()
            .map(|f| f.instrument.to_uppercase())
            .collect();
        if product_ids.is_empty() {
            bail!("No subscriptions configured for Coinbase");
        }

        let mut reconnect_attempts = 0u32;
        let max_reconnect_attempts = 10u32;
        let base_delay = Duration::from_secs(1);
        let max_delay = Duration::from_secs(60);

        'reconnect_loop: loop {
            tracing::info!(
                source = %"Coinbase",
                url = %COINBASE_WS_URL,
                attempt = reconnect_attempts,
                "Connecting to Coinbase WebSocket..."
            );

            let (ws_stream, _) = match connect_async(COINBASE_WS_URL).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(source = %"Coinbase", error = %e, "Connection failed");
                    let _ = tx
                        .send(SourceEvent::Error("Coinbase".to_string(), e.to_string()))
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

            let sub_msg = SubscribeMsg {
                msg_type: "subscribe".to_string(),
                product_ids: product_ids.clone(),
                channels: vec!["matches".to_string()],
            };
            write
                .send(Message::Text(serde_json::to_string(&sub_msg)?))
                .await?;

            self.connected = true;
            reconnect_attempts = 0;
            let _ = tx
                .send(SourceEvent::Connected("Coinbase".to_string()))
                .await;
            tracing::info!(source = %"Coinbase", "Connected to Coinbase WebSocket");

            let should_reconnect = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match self.handle_message(&text) {
                        Ok(Some(trade)) => {
                            let _ = tx.send(SourceEvent::Trade(trade)).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(source = %"Coinbase", error = %e, "Failed to parse message");
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::warn!(source = %"Coinbase", "Connection closed by server");
                        break true;
                    }
                    Some(Err(e)) => {
                        tracing::error!(source = %"Coinbase", error = %e, "WebSocket error");
                        let _ = tx
                            .send(SourceEvent::Error("Coinbase".to_string(), e.to_string()))
                            .await;
                        break true;
                    }
                    None => {
                        tracing::warn!(source = %"Coinbase", "Stream ended");
                        break true;
                    }
                    _ => {}
                }
            };

            self.connected = false;
            let _ = tx
                .send(SourceEvent::Disconnected("Coinbase".to_string()))
                .await;

            if should_reconnect {
                reconnect_attempts += 1;
                if reconnect_attempts > max_reconnect_attempts {
                    bail!("Max reconnection attempts ({max_reconnect_attempts}) reached");
                }
                let delay = std::cmp::min(base_delay * reconnect_attempts, max_delay);
                tokio::time::sleep(delay).await;
            } else {
                break 'reconnect_loop;
            }
        }

        Ok(())
    }

    async fn subscribe(&mut self, feeds: &[FeedSpec]) -> Result<()> {
        self.symbols = symbol_map(feeds, Exchange::Coinbase);
        self.feeds = feeds
            .iter()
            .filter(|f| f.exchange == Exchange::Coinbase)
            .cloned()
            .collect();
        Ok(())
    }

    /// Fetch historical 1m candles from the Coinbase Exchange REST API
    async fn recent_candles(&self, instrument: &str, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/products/{}/candles?granularity=60",
            COINBASE_REST_URL,
            instrument.to_uppercase()
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("oraclecast/0.1")
            .build()
            .context("Failed to create HTTP client")?;
        let response = client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch candles from Coinbase")?;
        if !response.status().is_success() {
            bail!("Coinbase API returned error: {}", response.status());
        }

        // [[time, low, high, open, close, volume], ...] newest first, time in seconds
        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("Failed to parse Coinbase candles response")?;

        let mut candles: Vec<Candle> = rows
            .into_iter()
            .filter_map(|row| {
                if row.len() < 6 {
                    return None;
                }
                let open_time = row[0].as_i64()? * 1_000;
                Some(Candle {
                    open_time,
                    close_time: open_time + 60_000,
                    low: row[1].as_f64()?,
                    high: row[2].as_f64()?,
                    open: row[3].as_f64()?,
                    close: row[4].as_f64()?,
                    volume: row[5].as_f64()?,
                })
            })
            .take(limit)
            .collect();
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
