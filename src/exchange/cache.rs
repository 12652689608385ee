//! Order book cache in front of an [`Exchange`].
//!
//! Each market has its own async slot. A caller holds the slot's lock while
//! fetching, so a second caller for the same market waits for that result
//! instead of issuing a duplicate request. Entries expire after `ttl`. The
//! map never holds more than `capacity` markets: expired idle entries are
//! evicted first, then the oldest idle one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use super::client::Exchange;
use super::types::{FreeBalance, Market, OrderBook, OrderResponse, Ticker};
use crate::error::ExchangeError;

#[derive(Debug)]
struct CachedBook {
    fetched_at: Instant,
    depth: usize,
    book: OrderBook,
}

type Slot = Arc<Mutex<Option<CachedBook>>>;

/// Exchange wrapper caching order books.
pub struct CachedExchange<E: Exchange + ?Sized> {
    inner: Arc<E>,
    ttl: Duration,
    capacity: usize,
    books: DashMap<String, Slot>,
}

impl<E: Exchange + ?Sized> CachedExchange<E> {
    /// Cache books fetched from `inner` for `ttl`, keeping at most
    /// `capacity` markets.
    pub fn new(inner: Arc<E>, ttl: Duration, capacity: usize) -> Self {
        Self {
            inner,
            ttl,
            capacity: capacity.max(1),
            books: DashMap::new(),
        }
    }

    /// Wrapped exchange.
    pub fn inner(&self) -> &Arc<E> {
        &self.inner
    }

    /// Number of cached markets.
    pub fn len(&self) -> usize {
        self.books.len()
    }

    /// Whether no market is cached.
    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// Drop the cached book of one market.
    pub fn invalidate(&self, symbol: &str) {
        self.books.remove(symbol);
    }

    fn slot(&self, symbol: &str) -> Slot {
        if !self.books.contains_key(symbol) && self.books.len() >= self.capacity {
            self.evict();
        }
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Remove expired entries nobody is fetching, then the oldest idle
    /// entry if the map is still full.
    fn evict(&self) {
        let ttl = self.ttl;
        let before = self.books.len();
        self.books.retain(|_, slot| match slot.try_lock() {
            Ok(cached) => cached.as_ref().is_some_and(|c| c.fetched_at.elapsed() < ttl),
            Err(_) => true,
        });

        if self.books.len() >= self.capacity {
            if let Some(oldest) = self.oldest_idle() {
                self.books.remove(&oldest);
            }
        }
        debug!(evicted = before - self.books.len(), "Order book cache eviction");
    }

    fn oldest_idle(&self) -> Option<String> {
        self.books
            .iter()
            .filter_map(|entry| {
                let cached = entry.value().try_lock().ok()?;
                let fetched_at = cached.as_ref().map(|c| c.fetched_at);
                Some((fetched_at, entry.key().clone()))
            })
            .min()
            .map(|(_, symbol)| symbol)
    }
}

#[async_trait]
impl<E: Exchange + ?Sized> Exchange for CachedExchange<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn load_markets(&self) -> Result<Vec<Market>, ExchangeError> {
        self.inner.load_markets().await
    }

    async fn fetch_tickers(&self) -> Result<HashMap<String, Ticker>, ExchangeError> {
        self.inner.fetch_tickers().await
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError> {
        let slot = self.slot(symbol);
        let mut cached = slot.lock().await;

        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl && entry.depth >= depth {
                let mut book = entry.book.clone();
                book.bids.truncate(depth);
                book.asks.truncate(depth);
                return Ok(book);
            }
        }

        let book = self.inner.fetch_order_book(symbol, depth).await?;
        *cached = Some(CachedBook {
            fetched_at: Instant::now(),
            depth,
            book: book.clone(),
        });
        Ok(book)
    }

    async fn fetch_balance(&self) -> Result<FreeBalance, ExchangeError> {
        self.inner.fetch_balance().await
    }

    async fn create_limit_sell_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        self.invalidate(symbol);
        self.inner.create_limit_sell_order(symbol, amount, price).await
    }

    async fn create_limit_buy_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        self.invalidate(symbol);
        self.inner.create_limit_buy_order(symbol, amount, price).await
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> Result<OrderResponse, ExchangeError> {
        self.inner.fetch_order(id, symbol).await
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> Result<(), ExchangeError> {
        self.inner.cancel_order(id, symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockConfig, MockExchange, MockExchangeBuilder};
    use rust_decimal_macros::dec;

    fn slow_exchange() -> Arc<MockExchange> {
        Arc::new(
            MockExchangeBuilder::new()
                .market("ETH", "BTC", dec!(0), dec!(0.05), dec!(0.051), dec!(10))
                .market("BTC", "USD", dec!(0), dec!(20000), dec!(20010), dec!(1))
                .config(MockConfig {
                    latency_ms: 20,
                    ..Default::default()
                })
                .build(),
        )
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_request() {
        let inner = slow_exchange();
        let cache = CachedExchange::new(inner.clone(), Duration::from_secs(5), 16);

        let (a, b) = tokio::join!(
            cache.fetch_order_book("ETH/BTC", 5),
            cache.fetch_order_book("ETH/BTC", 5)
        );

        assert_eq!(a.unwrap().best_bid(), b.unwrap().best_bid());
        assert_eq!(inner.order_book_fetches(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let inner = slow_exchange();
        let cache = CachedExchange::new(inner.clone(), Duration::from_millis(1), 16);

        cache.fetch_order_book("ETH/BTC", 5).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.fetch_order_book("ETH/BTC", 5).await.unwrap();

        assert_eq!(inner.order_book_fetches(), 2);
    }

    #[tokio::test]
    async fn deeper_request_bypasses_shallow_entry() {
        let inner = slow_exchange();
        let cache = CachedExchange::new(inner.clone(), Duration::from_secs(5), 16);

        cache.fetch_order_book("ETH/BTC", 1).await.unwrap();
        cache.fetch_order_book("ETH/BTC", 5).await.unwrap();
        cache.fetch_order_book("ETH/BTC", 3).await.unwrap();

        assert_eq!(inner.order_book_fetches(), 2);
    }

    #[tokio::test]
    async fn capacity_evicts_expired_entries() {
        let inner = slow_exchange();
        let cache = CachedExchange::new(inner.clone(), Duration::from_millis(1), 1);

        cache.fetch_order_book("ETH/BTC", 5).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.fetch_order_book("BTC/USD", 5).await.unwrap();

        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_fresh_entry() {
        let inner = slow_exchange();
        let cache = CachedExchange::new(inner.clone(), Duration::from_secs(60), 1);
        assert!(cache.is_empty());

        cache.fetch_order_book("ETH/BTC", 5).await.unwrap();
        cache.fetch_order_book("BTC/USD", 5).await.unwrap();
        assert_eq!(cache.len(), 1);

        // BTC/USD is still cached, ETH/BTC was evicted
        cache.fetch_order_book("BTC/USD", 5).await.unwrap();
        assert_eq!(inner.order_book_fetches(), 2);
    }

    #[tokio::test]
    async fn placing_an_order_invalidates_the_market() {
        let inner = slow_exchange();
        let cache = CachedExchange::new(inner.clone(), Duration::from_secs(5), 16);

        cache.fetch_order_book("ETH/BTC", 5).await.unwrap();
        cache
            .create_limit_sell_order("ETH/BTC", dec!(1), dec!(0.05))
            .await
            .unwrap();
        cache.fetch_order_book("ETH/BTC", 5).await.unwrap();

        assert_eq!(inner.order_book_fetches(), 2);
    }
}
