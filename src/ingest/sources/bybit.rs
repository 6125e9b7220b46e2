//! Bybit WebSocket client for real-time trade data
//!
//! Connects to Bybit V5 public spot streams for trade prints, and serves
//! 1-minute kline backfill over REST.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::FeedSpec;
use crate::ingest::sources::{symbol_map, ExchangeStream, SourceEvent};
use crate::types::{Candle, Exchange, Trade};

const BYBIT_WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const BYBIT_REST_URL: &str = "https://api.bybit.com/v5/market/kline";

#[derive(Debug, Clone, Serialize)]
struct SubscribeMsg {
    req_id: Option<String>,
    op: String,
    args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BybitMessage {
    topic: Option<String>,
    data: Option<serde_json::Value>,
    success: Option<bool>,
    op: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BybitTrade {
    #[serde(rename = "T")]
    ts: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
}

#[derive(Debug, Clone, Deserialize)]
struct BybitKlineResponse {
    result: BybitKlineResult,
}

#[derive(Debug, Clone, Deserialize)]
struct BybitKlineResult {
    #[serde(default)]
    list: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub struct BybitClient {
    connected: bool,
    feeds: Vec<FeedSpec>,
    symbols: HashMap<String, String>,
}

impl BybitClient {
    pub fn new() -> Self {
        Self {
            connected: false,
            feeds: Vec::new(),
            symbols: HashMap::new(),
        }
    }

    fn handle_message(&self, text: &str) -> Result<Vec<Trade>> {
        let msg: BybitMessage = serde_json::from_str(text)?;

        if msg.op.as_deref() == Some("pong") {
            return Ok(Vec::new());
        }
        if msg.success.is_some() {
            tracing::debug!(source = %"Bybit", success = ?msg.success, "Subscription response");
            return Ok(Vec::new());
        }

        let Some(topic) = msg.topic else {
            return Ok(Vec::new());
        };
        let Some(data) = msg.data else {
            return Ok(Vec::new());
        };
        if !topic.starts_with("publicTrade.") {
            return Ok(Vec::new());
        }

        let prints: Vec<BybitTrade> = serde_json::from_value(data)?;
        let mut trades = Vec::with_capacity(prints.len());
        for print in prints {
            let Some(symbol) = self.symbols.get(&print.symbol.to_uppercase()) else {
                continue;
            };
            trades.push(Trade {
                symbol: symbol.clone(),
                source: Exchange::Bybit,
                ts_ms: print.ts,
                price: print.price.parse()?,
            });
        }
        Ok(trades)
    }
}

#[async_trait]
impl ExchangeStream for BybitClient {
    fn name(&self) -> &'static str {
        "Bybit"
    }

    async fn connect(&mut self, tx: Sender<SourceEvent>) -> Result<()> {
        let topics: Vec<String> = self
            .feeds
            .iter()
            .map(|f| format!("publicTrade.{}", f.instrument.to_uppercase()))
            .collect();
        if topics.is_empty() {
            bail!("No subscriptions configured for Bybit");
        }

        let mut reconnect_attempts = 0u32;
        let max_reconnect_attempts = 10u32;
        let base_delay = Duration::from_secs(1);
        let max_delay = Duration::from_secs(60);

        'reconnect_loop: loop {
            tracing::info!(
                source = %"Bybit",
                url = %BYBIT_WS_URL,
                attempt = reconnect_attempts,
                "Connecting to Bybit WebSocket..."
            );

            let (ws_stream, _) = match connect_async(BYBIT_WS_URL).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(source = %"Bybit", error = %e, "Connection failed");
                    let _ = tx
                        .send(SourceEvent::Error("Bybit".to_string(), e.to_string()))
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
                req_id: Some("sub_1".to_string()),
                op: "subscribe".to_string(),
                args: topics.clone(),
            };
            write
                .send(Message::Text(serde_json::to_string(&sub_msg)?))
                .await?;

            self.connected = true;
            reconnect_attempts = 0;
            let _ = tx.send(SourceEvent::Connected("Bybit".to_string())).await;
            tracing::info!(source = %"Bybit", "Connected to Bybit WebSocket");

            // Bybit drops idle connections without a client ping
            let mut ping_interval = tokio::time::interval(Duration::from_secs(20));

            let should_reconnect = loop {
                tokio::select! {
                    _ = ping_interval.tick() => {
                        let ping = serde_json::json!({"op": "ping"}).to_string();
                        if write.send(Message::Text(ping)).await.is_err() {
                            break true;
                        }
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => match self.handle_message(&text) {
                            Ok(trades) => {
                                for trade in trades {
                                    let _ = tx.send(SourceEvent::Trade(trade)).await;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(source = %"Bybit", error = %e, "Failed to parse message");
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::warn!(source = %"Bybit", "Connection closed by server");
                            break true;
                        }
                        Some(Err(e)) => {
                            tracing::error!(source = %"Bybit", error = %e, "WebSocket error");
                            let _ = tx
                                .send(SourceEvent::Error("Bybit".to_string(), e.to_string()))
                                .await;
                            break true;
                        }
                        None => {
                            tracing::warn!(source = %"Bybit", "Stream ended");
                            break true;
                        }
                        _ => {}
                    }
                }
            };

            self.connected = false;
            let _ = tx
                .send(SourceEvent::Disconnected("Bybit".to_string()))
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
        self.symbols = symbol_map(feeds, Exchange::Bybit);
        self.feeds = feeds
            .iter()
            .filter(|f| f.exchange == Exchange::Bybit)
            .cloned()
            .collect();
        Ok(())
    }

    /// Fetch historical 1m klines from the Bybit V5 REST API
    async fn recent_candles(&self, instrument: &str, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}?category=spot&symbol={}&interval=1&limit={}",
            BYBIT_REST_URL,
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
            .context("Failed to fetch klines from Bybit")?;
        if !response.status().is_success() {
            bail!("Bybit API returned error: {}", response.status());
        }

        // result.list: [[startTime, open, high, low, close, volume, turnover], ...] newest first
        let parsed: BybitKlineResponse = response
            .json()
            .await
            .context("Failed to parse Bybit kline response")?;

        let mut candles: Vec<Candle> = parsed
            .result
            .list
            .into_iter()
            .filter_map(|kline| {
                if kline.len() < 6 {
                    return None;
                }
                let open_time: i64 = kline[0].as_str()?.parse().ok()?;
                Some(Candle {
                    open_time,
                    close_time: open_time + 60_000,
                    open: kline[1].as_str()?.parse().ok()?,
                    high: kline[2].as_str()?.parse().ok()?,
                    low: kline[3].as_str()?.parse().ok()?,
                    close: kline[4].as_str()?.parse().ok()?,
                    volume: kline[5].as_str()?.parse().ok()?,
                })
            })
            .collect();
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
