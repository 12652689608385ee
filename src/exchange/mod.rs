//! Exchange collaborator module.
//!
//! This module handles:
//! - Market, ticker, order book and order types
//! - The `Exchange` trait every client implements
//! - A Binance-compatible REST client and top-of-book websocket stream
//! - An order book cache with in-flight de-duplication
//! - A mock exchange for testing and dry runs

pub mod cache;
pub mod client;
pub mod mock;
pub mod rest;
pub mod stream;
pub mod types;

pub use cache::CachedExchange;
pub use client::Exchange;
pub use mock::{FillBehavior, MockConfig, MockExchange, MockExchangeBuilder, MockOrder};
pub use rest::RestExchange;
pub use stream::{BookTickerStream, ReconnectConfig};
pub use types::{
    BookSide, Currency, FreeBalance, Market, OrderBook, OrderBookRecord, OrderResponse, OrderSide,
    OrderStatus, OrderType, PriceLevel, Ticker,
};
