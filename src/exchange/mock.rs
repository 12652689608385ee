//! In-memory exchange for tests and dry runs.
//!
//! Markets, tickers, order books and balances are set up front. Orders fill
//! according to a [`FillBehavior`] and update the simulated balance when they
//! close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::client::Exchange;
use super::types::{
    FreeBalance, Market, OrderBook, OrderResponse, OrderSide, OrderStatus, PriceLevel, Ticker,
};
use crate::error::ExchangeError;

/// How placed orders progress when polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillBehavior {
    /// Closed on the first status fetch.
    #[default]
    Immediate,
    /// Open for the given number of fetches, closed afterwards.
    AfterPolls(u32),
    /// Never fills.
    Never,
}

/// Configuration for mock exchange behavior.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    /// Whether to fail market loading.
    pub fail_markets: bool,
    /// Whether to fail ticker requests.
    pub fail_tickers: bool,
    /// Whether to fail order book requests.
    pub fail_order_book: bool,
    /// Whether to fail balance requests.
    pub fail_balance: bool,
    /// Whether to reject every order placement.
    pub fail_place: bool,
    /// Whether to fail order status requests.
    pub fail_fetch_order: bool,
    /// Whether to fail cancellations.
    pub fail_cancel: bool,
    /// Default fill behavior for new orders.
    pub fill: FillBehavior,
    /// Simulated latency in milliseconds.
    pub latency_ms: u64,
}

/// An order placed on the mock exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockOrder {
    /// Order id.
    pub id: String,
    /// Market symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Amount in base units.
    pub amount: Decimal,
    /// Limit price.
    pub price: Decimal,
    /// Current status.
    pub status: OrderStatus,
    /// Status fetches so far.
    pub polls: u32,
    fill: FillBehavior,
}

#[derive(Debug, Default)]
struct MockState {
    markets: Vec<Market>,
    tickers: HashMap<String, Ticker>,
    books: HashMap<String, OrderBook>,
    balance: FreeBalance,
    orders: Vec<MockOrder>,
    fill_overrides: HashMap<String, FillBehavior>,
    rejected_symbols: Vec<String>,
    order_book_fetches: usize,
    next_id: u64,
}

/// Mock exchange for testing.
#[derive(Debug, Clone)]
pub struct MockExchange {
    config: MockConfig,
    state: Arc<Mutex<MockState>>,
}

impl MockExchange {
    /// Create a new mock exchange with default configuration.
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    /// Create a mock exchange with custom configuration.
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    /// Add a market.
    pub fn add_market(&self, market: Market) {
        self.state().markets.push(market);
    }

    /// Set the best bid/ask of a market.
    pub fn set_ticker(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.state().tickers.insert(symbol.to_string(), Ticker { bid, ask });
    }

    /// Set the order book of a market.
    pub fn set_order_book(&self, book: OrderBook) {
        self.state().books.insert(book.symbol.clone(), book);
    }

    /// Set a single-level book of `size` on both sides at the given prices.
    pub fn set_top_of_book(&self, symbol: &str, bid: Decimal, ask: Decimal, size: Decimal) {
        self.set_order_book(OrderBook::new(
            symbol,
            vec![PriceLevel::new(bid, size)],
            vec![PriceLevel::new(ask, size)],
        ));
    }

    /// Set the free balance of one currency.
    pub fn set_balance(&self, currency: &str, amount: Decimal) {
        self.state().balance.insert(currency.to_string(), amount);
    }

    /// Override the fill behavior of orders on one market.
    pub fn set_fill_behavior(&self, symbol: &str, fill: FillBehavior) {
        self.state().fill_overrides.insert(symbol.to_string(), fill);
    }

    /// Reject every order placed on one market.
    pub fn reject_orders_on(&self, symbol: &str) {
        self.state().rejected_symbols.push(symbol.to_string());
    }

    /// Orders placed so far, in placement order.
    pub fn orders(&self) -> Vec<MockOrder> {
        self.state().orders.clone()
    }

    /// Number of order book requests served.
    pub fn order_book_fetches(&self) -> usize {
        self.state().order_book_fetches
    }

    /// Current simulated free balance.
    pub fn balance(&self) -> FreeBalance {
        self.state().balance.clone()
    }

    fn place(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        if self.config.fail_place {
            return Err(ExchangeError::Rejected("Mock order failure".to_string()));
        }

        let mut state = self.state();
        if state.rejected_symbols.iter().any(|s| s == symbol) {
            return Err(ExchangeError::Rejected(format!("Mock order failure on {}", symbol)));
        }
        if !state.markets.iter().any(|m| m.symbol == symbol) {
            return Err(ExchangeError::UnknownMarket(symbol.to_string()));
        }

        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        let fill = state
            .fill_overrides
            .get(symbol)
            .copied()
            .unwrap_or(self.config.fill);

        state.orders.push(MockOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            amount,
            price,
            status: OrderStatus::Open,
            polls: 0,
            fill,
        });

        Ok(id)
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a closed order to the balance and build its response.
fn settle(state: &mut MockState, index: usize) -> OrderResponse {
    let order = state.orders[index].clone();
    let Some(market) = state.markets.iter().find(|m| m.symbol == order.symbol).cloned() else {
        return OrderResponse::bare(order.id, order.status);
    };

    let cost = order.amount * order.price;
    let (fee, base_delta, quote_delta) = match order.side {
        OrderSide::Sell => {
            let fee = cost * market.taker_fee;
            (Some(fee), -order.amount, cost - fee)
        }
        OrderSide::Buy => (None, order.amount, -cost),
    };

    *state.balance.entry(market.base.clone()).or_insert(Decimal::ZERO) += base_delta;
    *state.balance.entry(market.quote.clone()).or_insert(Decimal::ZERO) += quote_delta;

    OrderResponse {
        id: order.id,
        status: OrderStatus::Closed,
        amount: Some(order.amount),
        filled: Some(order.amount),
        cost: Some(cost),
        fee,
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load_markets(&self) -> Result<Vec<Market>, ExchangeError> {
        self.simulate_latency().await;
        if self.config.fail_markets {
            return Err(ExchangeError::Parse("Mock markets failure".to_string()));
        }
        Ok(self.state().markets.clone())
    }

    async fn fetch_tickers(&self) -> Result<HashMap<String, Ticker>, ExchangeError> {
        self.simulate_latency().await;
        if self.config.fail_tickers {
            return Err(ExchangeError::Parse("Mock tickers failure".to_string()));
        }
        Ok(self.state().tickers.clone())
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError> {
        self.simulate_latency().await;
        if self.config.fail_order_book {
            return Err(ExchangeError::Parse("Mock order book failure".to_string()));
        }

        let mut state = self.state();
        state.order_book_fetches += 1;

        // Unconfigured markets get an empty book
        let mut book = state
            .books
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| OrderBook::new(symbol, Vec::new(), Vec::new()));
        book.bids.truncate(depth);
        book.asks.truncate(depth);
        book.updated_at = time::OffsetDateTime::now_utc();

        Ok(book)
    }

    async fn fetch_balance(&self) -> Result<FreeBalance, ExchangeError> {
        self.simulate_latency().await;
        if self.config.fail_balance {
            return Err(ExchangeError::Parse("Mock balance failure".to_string()));
        }
        Ok(self.state().balance.clone())
    }

    async fn create_limit_sell_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        self.simulate_latency().await;
        self.place(symbol, OrderSide::Sell, amount, price)
    }

    async fn create_limit_buy_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        self.simulate_latency().await;
        self.place(symbol, OrderSide::Buy, amount, price)
    }

    async fn fetch_order(&self, id: &str, _symbol: &str) -> Result<OrderResponse, ExchangeError> {
        self.simulate_latency().await;
        if self.config.fail_fetch_order {
            return Err(ExchangeError::Parse("Mock fetch order failure".to_string()));
        }

        let mut state = self.state();
        let index = state
            .orders
            .iter()
            .position(|o| o.id == id)
            .ok_or_else(|| ExchangeError::UnknownOrder(id.to_string()))?;

        let order = &mut state.orders[index];
        if order.status != OrderStatus::Open {
            return Ok(OrderResponse::bare(order.id.clone(), order.status));
        }

        order.polls += 1;
        let fills = match order.fill {
            FillBehavior::Immediate => true,
            FillBehavior::AfterPolls(n) => order.polls > n,
            FillBehavior::Never => false,
        };

        if !fills {
            let mut response = OrderResponse::bare(order.id.clone(), OrderStatus::Open);
            response.amount = Some(order.amount);
            response.filled = Some(Decimal::ZERO);
            return Ok(response);
        }

        order.status = OrderStatus::Closed;
        Ok(settle(&mut state, index))
    }

    async fn cancel_order(&self, id: &str, _symbol: &str) -> Result<(), ExchangeError> {
        self.simulate_latency().await;
        if self.config.fail_cancel {
            return Err(ExchangeError::Parse("Mock cancel failure".to_string()));
        }

        let mut state = self.state();
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| ExchangeError::UnknownOrder(id.to_string()))?;
        if order.status == OrderStatus::Open {
            order.status = OrderStatus::Canceled;
        }

        Ok(())
    }
}

/// Builder for a mock exchange pre-loaded with markets and prices.
pub struct MockExchangeBuilder {
    config: MockConfig,
    markets: Vec<Market>,
    books: Vec<(String, Decimal, Decimal, Decimal)>,
    balances: Vec<(String, Decimal)>,
}

impl MockExchangeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: MockConfig::default(),
            markets: Vec::new(),
            books: Vec::new(),
            balances: Vec::new(),
        }
    }

    /// Use the given configuration.
    pub fn config(mut self, config: MockConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a market quoted at `bid`/`ask` with `size` available on each side.
    pub fn market(mut self, base: &str, quote: &str, fee: Decimal, bid: Decimal, ask: Decimal, size: Decimal) -> Self {
        let market = Market::new(base, quote, fee, Decimal::ZERO);
        self.books.push((market.symbol.clone(), bid, ask, size));
        self.markets.push(market);
        self
    }

    /// Set a free balance.
    pub fn balance(mut self, currency: &str, amount: Decimal) -> Self {
        self.balances.push((currency.to_string(), amount));
        self
    }

    /// Build the exchange.
    pub fn build(self) -> MockExchange {
        let exchange = MockExchange::with_config(self.config);
        for market in self.markets {
            exchange.add_market(market);
        }
        for (symbol, bid, ask, size) in self.books {
            exchange.set_ticker(&symbol, bid, ask);
            exchange.set_top_of_book(&symbol, bid, ask, size);
        }
        for (currency, amount) in self.balances {
            exchange.set_balance(&currency, amount);
        }
        exchange
    }
}

impl Default for MockExchangeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
