//! The exchange collaborator contract.
//!
//! Everything in the core talks to the exchange through [`Exchange`]; the
//! REST client, the order book cache and the mock all implement it.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{FreeBalance, Market, OrderBook, OrderResponse, OrderSide, Ticker};
use crate::error::ExchangeError;

/// Asynchronous exchange client.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Exchange identifier (e.g. "binance").
    fn name(&self) -> &str;

    /// Load all tradable markets.
    async fn load_markets(&self) -> Result<Vec<Market>, ExchangeError>;

    /// Best bid/ask for every market, keyed by unified symbol.
    async fn fetch_tickers(&self) -> Result<HashMap<String, Ticker>, ExchangeError>;

    /// Order book of one market, truncated to `depth` levels per side.
    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError>;

    /// Free balance per currency.
    async fn fetch_balance(&self) -> Result<FreeBalance, ExchangeError>;

    /// Place a limit sell of `amount` base units. Returns the order id.
    async fn create_limit_sell_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError>;

    /// Place a limit buy of `amount` base units. Returns the order id.
    async fn create_limit_buy_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError>;

    /// Current state of an order.
    async fn fetch_order(&self, id: &str, symbol: &str) -> Result<OrderResponse, ExchangeError>;

    /// Cancel an open order.
    async fn cancel_order(&self, id: &str, symbol: &str) -> Result<(), ExchangeError>;

    /// Place a limit order on the given side.
    async fn create_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        match side {
            OrderSide::Sell => self.create_limit_sell_order(symbol, amount, price).await,
            OrderSide::Buy => self.create_limit_buy_order(symbol, amount, price).await,
        }
    }
}

#[async_trait]
impl<E: Exchange + ?Sized> Exchange for std::sync::Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn load_markets(&self) -> Result<Vec<Market>, ExchangeError> {
        (**self).load_markets().await
    }

    async fn fetch_tickers(&self) -> Result<HashMap<String, Ticker>, ExchangeError> {
        (**self).fetch_tickers().await
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError> {
        (**self).fetch_order_book(symbol, depth).await
    }

    async fn fetch_balance(&self) -> Result<FreeBalance, ExchangeError> {
        (**self).fetch_balance().await
    }

    async fn create_limit_sell_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        (**self).create_limit_sell_order(symbol, amount, price).await
    }

    async fn create_limit_buy_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        (**self).create_limit_buy_order(symbol, amount, price).await
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> Result<OrderResponse, ExchangeError> {
        (**self).fetch_order(id, symbol).await
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> Result<(), ExchangeError> {
        (**self).cancel_order(id, symbol).await
    }
}
