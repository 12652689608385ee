//! Websocket top-of-book feed.
//!
//! Subscribes to the `<symbol>@bookTicker` combined stream of every relevant
//! market and turns each update into two [`OrderBookRecord`]s, one per side.
//!
//! Features:
//! - Automatic reconnection with exponential backoff
//! - Records delivered through a bounded mpsc channel

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::{BookSide, Market, OrderBookRecord};
use crate::error::ExchangeError;
use crate::metrics;

/// Reconnection configuration for WebSocket.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum backoff delay in seconds.
    pub max_delay_s: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_s: 30,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculate next delay with exponential backoff.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let max_delay_ms = self.max_delay_s * 1000;
        let clamped_ms = delay_ms.min(max_delay_ms as f64) as u64;
        Duration::from_millis(clamped_ms)
    }
}

/// Combined stream envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    data: BookTickerEvent,
}

/// `bookTicker` payload.
#[derive(Debug, Deserialize)]
struct BookTickerEvent {
    /// Exchange symbol.
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid_price: String,
    #[serde(rename = "B")]
    bid_qty: String,
    #[serde(rename = "a")]
    ask_price: String,
    #[serde(rename = "A")]
    ask_qty: String,
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server closed the connection or it failed.
    Disconnected,
    /// Nobody is listening for records anymore.
    ReceiverClosed,
}

/// Top-of-book websocket feed for a set of markets.
pub struct BookTickerStream {
    ws_url: String,
    /// Exchange id -> unified symbol.
    symbols: HashMap<String, String>,
    reconnect_config: ReconnectConfig,
    connected: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU64>,
}

impl BookTickerStream {
    /// Create a feed for `markets`.
    pub fn new(ws_url: &str, markets: &[Market]) -> Self {
        Self::with_reconnect_config(ws_url, markets, ReconnectConfig::default())
    }

    /// Create with custom reconnection config.
    pub fn with_reconnect_config(ws_url: &str, markets: &[Market], config: ReconnectConfig) -> Self {
        Self {
            ws_url: ws_url.trim_end_matches('/').to_string(),
            symbols: markets
                .iter()
                .map(|m| (m.id.to_uppercase(), m.symbol.clone()))
                .collect(),
            reconnect_config: config,
            connected: Arc::new(AtomicBool::new(false)),
            reconnect_attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get reconnection attempt count.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Combined stream URL for all markets.
    pub fn stream_url(&self) -> String {
        let mut streams: Vec<String> = self
            .symbols
            .keys()
            .map(|id| format!("{}@bookTicker", id.to_lowercase()))
            .collect();
        streams.sort();
        format!("{}/stream?streams={}", self.ws_url, streams.join("/"))
    }

    /// Turn one text message into bid and ask records. Unknown markets and
    /// malformed payloads yield nothing.
    pub fn parse_message(&self, text: &str) -> Vec<OrderBookRecord> {
        let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
            debug!(message = %text, "Ignoring unrecognised message");
            return Vec::new();
        };
        let event = envelope.data;
        let Some(symbol) = self.symbols.get(&event.symbol) else {
            return Vec::new();
        };

        let parse = |v: &str| Decimal::from_str(v).ok();
        let sides = [
            (BookSide::Bid, parse(&event.bid_price), parse(&event.bid_qty)),
            (BookSide::Ask, parse(&event.ask_price), parse(&event.ask_qty)),
        ];

        sides
            .into_iter()
            .filter_map(|(side, price, volume)| {
                Some(OrderBookRecord {
                    symbol: symbol.clone(),
                    side,
                    price: price?,
                    volume: volume?,
                })
            })
            .filter(|r| r.price > Decimal::ZERO)
            .collect()
    }

    /// Connect once and forward records until the connection ends.
    pub async fn run(&self, tx: &mpsc::Sender<OrderBookRecord>) -> Result<StreamEnd, ExchangeError> {
        let url = self.stream_url();
        info!(markets = self.symbols.len(), "Connecting to WebSocket");

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        self.connected.store(true, Ordering::SeqCst);
        let (_write, mut read) = ws_stream.split();

        let end = 'read: loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    for record in self.parse_message(&text) {
                        if tx.send(record).await.is_err() {
                            break 'read StreamEnd::ReceiverClosed;
                        }
                    }
                    if tx.is_closed() {
                        break StreamEnd::ReceiverClosed;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!(frame = ?frame, "WebSocket closed");
                    break StreamEnd::Disconnected;
                }
                // tungstenite answers pings itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket error");
                    break StreamEnd::Disconnected;
                }
                None => break StreamEnd::Disconnected,
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        Ok(end)
    }

    /// Run with automatic reconnection on disconnect.
    /// Returns a channel receiver that yields records.
    pub fn run_with_reconnect(self: Arc<Self>) -> mpsc::Receiver<OrderBookRecord> {
        let (tx, rx) = mpsc::channel(1000);
        let ws = self;

        tokio::spawn(async move {
            let mut attempt = 0u32;

            loop {
                match ws.run(&tx).await {
                    Ok(StreamEnd::ReceiverClosed) => {
                        info!("Channel closed, stopping WebSocket");
                        return;
                    }
                    Ok(StreamEnd::Disconnected) => {
                        attempt = 0;
                        warn!("WebSocket stream ended, will reconnect");
                    }
                    Err(e) => {
                        error!(error = %e, attempt = attempt, "WebSocket connection failed");
                    }
                }

                let delay = ws.reconnect_config.next_delay(attempt);
                ws.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                metrics::inc_ws_reconnects();

                info!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
                tokio::time::sleep(delay).await;

                attempt = attempt.saturating_add(1);
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn stream() -> BookTickerStream {
        BookTickerStream::new(
            "wss://stream.example.com/",
            &[
                Market::new("ETH", "BTC", dec!(0.001), dec!(0)),
                Market::new("BTC", "USDT", dec!(0.001), dec!(0)),
            ],
        )
    }

    #[test]
    fn url_lists_all_markets() {
        assert_eq!(
            stream().stream_url(),
            "wss://stream.example.com/stream?streams=btcusdt@bookTicker/ethbtc@bookTicker"
        );
    }

    #[test]
    fn message_yields_bid_and_ask_records() {
        let text = r#"{"stream":"ethbtc@bookTicker","data":{"u":400900217,"s":"ETHBTC","b":"0.05000","B":"31.2","a":"0.05010","A":"40.6"}}"#;

        let records = stream().parse_message(text);

        assert_eq!(
            records,
            vec![
                OrderBookRecord {
                    symbol: "ETH/BTC".to_string(),
                    side: BookSide::Bid,
                    price: dec!(0.05),
                    volume: dec!(31.2),
                },
                OrderBookRecord {
                    symbol: "ETH/BTC".to_string(),
                    side: BookSide::Ask,
                    price: dec!(0.0501),
                    volume: dec!(40.6),
                },
            ]
        );
    }

    #[test]
    fn unknown_market_and_garbage_are_ignored() {
        let stream = stream();
        let unknown = r#"{"stream":"xrpbtc@bookTicker","data":{"s":"XRPBTC","b":"1","B":"1","a":"1","A":"1"}}"#;

        assert!(stream.parse_message(unknown).is_empty());
        assert!(stream.parse_message(r#"{"result":null,"id":1}"#).is_empty());
    }

    const ETHBTC_UPDATE: &str = r#"{"stream":"ethbtc@bookTicker","data":{"s":"ETHBTC","b":"0.05","B":"2","a":"0.051","A":"3"}}"#;

    /// Local websocket server sending `messages`, then a close frame.
    async fn serve(messages: Vec<&'static str>) -> String {
        use futures::SinkExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            for message in messages {
                if ws.send(Message::Text(message.to_string())).await.is_err() {
                    return;
                }
            }
            let _ = ws.close(None).await;
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn run_forwards_records_until_close() {
        let url = serve(vec![ETHBTC_UPDATE]).await;
        let stream = BookTickerStream::new(&url, &[Market::new("ETH", "BTC", dec!(0.001), dec!(0))]);
        let (tx, mut rx) = mpsc::channel(16);

        let end = stream.run(&tx).await.unwrap();

        assert_eq!(end, StreamEnd::Disconnected);
        assert!(!stream.is_connected());
        assert_eq!(rx.recv().await.unwrap().side, BookSide::Bid);
        assert_eq!(rx.recv().await.unwrap().side, BookSide::Ask);
    }

    #[tokio::test]
    async fn run_stops_when_receiver_is_gone() {
        let url = serve(vec![ETHBTC_UPDATE, ETHBTC_UPDATE]).await;
        let stream = BookTickerStream::new(&url, &[Market::new("ETH", "BTC", dec!(0.001), dec!(0))]);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let end = stream.run(&tx).await.unwrap();

        assert_eq!(end, StreamEnd::ReceiverClosed);
    }

    #[test]
    fn reconnect_config_backoff() {
        let config = ReconnectConfig::default();

        assert_eq!(config.next_delay(0), Duration::from_millis(1000));
        assert_eq!(config.next_delay(1), Duration::from_millis(2000));
        assert_eq!(config.next_delay(2), Duration::from_millis(4000));
        // Should cap at max_delay_s
        assert_eq!(config.next_delay(10), Duration::from_secs(30));
    }
}
