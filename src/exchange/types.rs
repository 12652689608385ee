//! Exchange data types shared by the client, the cache and the core.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

/// Currency symbol (e.g. "BTC").
pub type Currency = String;

/// Free balance per currency as returned by the exchange.
pub type FreeBalance = HashMap<Currency, Decimal>;

/// Tradable market metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    /// Unified symbol, "BASE/QUOTE".
    pub symbol: String,
    /// Base currency.
    pub base: Currency,
    /// Quote currency.
    pub quote: Currency,
    /// Exchange-native symbol (e.g. "ETHBTC").
    pub id: String,
    /// Taker fee as a fraction.
    pub taker_fee: Decimal,
    /// Minimum order amount in base units.
    pub min_amount: Decimal,
    /// Decimal places of the amount (base side).
    pub amount_precision: u32,
    /// Decimal places of the price (quote side).
    pub price_precision: u32,
}

impl Market {
    /// Create a market with default precisions and the exchange id derived
    /// from the symbol.
    pub fn new(base: &str, quote: &str, taker_fee: Decimal, min_amount: Decimal) -> Self {
        Self {
            symbol: format!("{}/{}", base, quote),
            base: base.to_string(),
            quote: quote.to_string(),
            id: format!("{}{}", base, quote),
            taker_fee,
            min_amount,
            amount_precision: 8,
            price_precision: 8,
        }
    }
}

/// Best bid/ask of one market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    /// Best bid price.
    pub bid: Decimal,
    /// Best ask price.
    pub ask: Decimal,
}

/// Single price level in an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceLevel {
    /// Price at this level.
    pub price: Decimal,
    /// Total size available at this price.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new price level.
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// L2 order book for one market. Index 0 is the best level on each side.
#[derive(Debug, Clone)]
pub struct OrderBook {
    /// Unified market symbol.
    pub symbol: String,
    /// Bid levels sorted by price descending.
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted by price ascending.
    pub asks: Vec<PriceLevel>,
    /// When this book was fetched.
    pub updated_at: OffsetDateTime,
}

impl OrderBook {
    /// Create a book, sorting both sides best-first.
    pub fn new(symbol: impl Into<String>, mut bids: Vec<PriceLevel>, mut asks: Vec<PriceLevel>) -> Self {
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        Self {
            symbol: symbol.into(),
            bids,
            asks,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Best bid level.
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    /// Best ask level.
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    /// Best level of the given side.
    pub fn best(&self, side: BookSide) -> Option<PriceLevel> {
        match side {
            BookSide::Bid => self.best_bid(),
            BookSide::Ask => self.best_ask(),
        }
    }
}

/// Side of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    /// Buyers' side.
    #[strum(to_string = "bid", serialize = "bids")]
    Bid,
    /// Sellers' side.
    #[strum(to_string = "ask", serialize = "asks")]
    Ask,
}

/// A single top-of-book change for one side of one market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookRecord {
    /// Unified market symbol.
    pub symbol: String,
    /// Changed side.
    pub side: BookSide,
    /// New best price.
    pub price: Decimal,
    /// New best size, in base units.
    pub volume: Decimal,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    /// Buy order.
    #[strum(to_string = "BUY", serialize = "buy")]
    Buy,
    /// Sell order.
    #[strum(to_string = "SELL", serialize = "sell")]
    Sell,
}

/// How aggressively a leg is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum OrderType {
    /// At the observed top-of-book price.
    #[default]
    #[strum(serialize = "limit")]
    Limit,
    /// Limit order shifted by the slippage margin so it crosses the book.
    #[strum(serialize = "market")]
    Market,
}

/// Order status reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Resting on the book, possibly partially filled.
    #[strum(to_string = "open", serialize = "NEW", serialize = "PARTIALLY_FILLED")]
    Open,
    /// Fully filled.
    #[strum(to_string = "closed", serialize = "FILLED")]
    Closed,
    /// Cancelled.
    #[strum(
        to_string = "canceled",
        serialize = "cancelled",
        serialize = "CANCELED",
        serialize = "PENDING_CANCEL"
    )]
    Canceled,
    /// Rejected.
    #[strum(to_string = "rejected", serialize = "REJECTED")]
    Rejected,
    /// Expired.
    #[strum(to_string = "expired", serialize = "EXPIRED", serialize = "EXPIRED_IN_MATCH")]
    Expired,
}

/// Order state returned by `fetch_order`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderResponse {
    /// Order id.
    pub id: String,
    /// Current status.
    pub status: OrderStatus,
    /// Requested amount in base units.
    pub amount: Option<Decimal>,
    /// Filled amount in base units.
    pub filled: Option<Decimal>,
    /// Filled cost in quote units.
    pub cost: Option<Decimal>,
    /// Fee charged, in the currency the proceeds were paid in.
    pub fee: Option<Decimal>,
}

impl OrderResponse {
    /// Response carrying only an id and a status.
    pub fn bare(id: impl Into<String>, status: OrderStatus) -> Self {
        Self {
            id: id.into(),
            status,
            amount: None,
            filled: None,
            cost: None,
            fee: None,
        }
    }

    /// Whether the order is fully filled.
    pub fn is_closed(&self) -> bool {
        self.status == OrderStatus::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn order_book_sorts_best_first() {
        let book = OrderBook::new(
            "ETH/BTC",
            vec![PriceLevel::new(dec!(0.049), dec!(5)), PriceLevel::new(dec!(0.05), dec!(2))],
            vec![PriceLevel::new(dec!(0.052), dec!(1)), PriceLevel::new(dec!(0.051), dec!(3))],
        );

        assert_eq!(book.best_bid(), Some(PriceLevel::new(dec!(0.05), dec!(2))));
        assert_eq!(book.best_ask(), Some(PriceLevel::new(dec!(0.051), dec!(3))));
        assert_eq!(book.best(BookSide::Ask).map(|l| l.size), Some(dec!(3)));
    }

    #[test]
    fn order_status_from_exchange_strings() {
        assert_eq!(OrderStatus::from_str("FILLED").unwrap(), OrderStatus::Closed);
        assert_eq!(OrderStatus::from_str("closed").unwrap(), OrderStatus::Closed);
        assert_eq!(OrderStatus::from_str("PARTIALLY_FILLED").unwrap(), OrderStatus::Open);
        assert_eq!(OrderStatus::from_str("cancelled").unwrap(), OrderStatus::Canceled);
        assert!(OrderStatus::from_str("bogus").is_err());
    }

    #[test]
    fn market_new_derives_symbol_and_id() {
        let market = Market::new("ETH", "BTC", dec!(0.001), dec!(0.01));
        assert_eq!(market.symbol, "ETH/BTC");
        assert_eq!(market.id, "ETHBTC");
    }
}
