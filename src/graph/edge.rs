//! A single tradable leg between two currencies.
//!
//! A market `BASE/QUOTE` yields two edges: a [`EdgeKind::Direct`] edge
//! `BASE -> QUOTE` (sell base at the bid) and an [`EdgeKind::Inverse`] edge
//! `QUOTE -> BASE` (buy base at the ask, paying in quote). Both store `price`
//! as target units per source unit and `volume` in source units, so the
//! opportunity math never needs to know which kind it is walking.

use std::fmt;
use std::time::{Duration, Instant};

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::error::{ExchangeError, GraphError, TraversalError};
use crate::exchange::{
    BookSide, Currency, Exchange, OrderBookRecord, OrderResponse, OrderSide, OrderStatus, OrderType,
};
use crate::metrics;
use crate::opportunity::EdgeRecord;

/// Default number of status polls before an order is cancelled.
pub const DEFAULT_FILL_RETRIES: u32 = 20;

/// Edge orientation relative to its market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Sell the source (market base) for the target (market quote).
    Direct,
    /// Buy the target (market base) paying with the source (market quote).
    Inverse,
}

impl EdgeKind {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Direct => "direct",
            EdgeKind::Inverse => "inverse",
        }
    }
}

/// When the exchange fee is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeApplication {
    /// Deducted from the traded volume before the order is submitted.
    Before,
    /// Deducted from the settled proceeds.
    After,
}

/// Order-wait parameters shared by every leg.
#[derive(Debug, Clone)]
pub struct FillPolicy {
    /// Status polls before giving up and cancelling.
    pub retries: u32,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Price margin applied to market orders.
    pub market_slippage: Decimal,
}

impl Default for FillPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_FILL_RETRIES,
            poll_interval: Duration::from_millis(250),
            market_slippage: Decimal::new(1, 2),
        }
    }
}

/// What to execute on one leg.
#[derive(Debug, Clone, Copy)]
pub struct OrderSpec {
    /// Input volume in the edge's source currency.
    pub volume: Decimal,
    /// Limit at the observed price, or market with the slippage margin.
    pub order_type: OrderType,
    /// Skip the exchange and return the estimate.
    pub mock: bool,
}

impl OrderSpec {
    /// Limit order for `volume` source units.
    pub fn limit(volume: Decimal, mock: bool) -> Self {
        Self {
            volume,
            order_type: OrderType::Limit,
            mock,
        }
    }

    /// Market order for `volume` source units.
    pub fn market(volume: Decimal, mock: bool) -> Self {
        Self {
            volume,
            order_type: OrderType::Market,
            mock,
        }
    }
}

/// One directed leg `source -> target`.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Currency spent.
    pub source: Currency,
    /// Currency received.
    pub target: Currency,
    /// Direct or inverse.
    pub kind: EdgeKind,
    /// Fee fraction.
    pub fee: Decimal,
    /// When the fee is taken.
    pub fee_application: FeeApplication,
    /// Minimum tradable size in source units.
    pub min_volume: Decimal,
    /// Decimal places of the source currency.
    pub source_precision: u32,
    /// Decimal places of the target currency.
    pub target_precision: u32,
    price: Decimal,
    real_price: Decimal,
    volume: Option<Decimal>,
    last_updated_at: Option<Instant>,
}

impl Edge {
    /// Direct edge `base -> quote` for a market. The fee is taken from the
    /// sale proceeds.
    pub fn direct(base: &str, quote: &str, fee: Decimal, min_volume: Decimal) -> Self {
        Self::new(base, quote, EdgeKind::Direct, fee, FeeApplication::After, min_volume)
    }

    /// Inverse edge `quote -> base` for a market. The fee is taken from the
    /// bought amount before submission.
    pub fn inverse(base: &str, quote: &str, fee: Decimal, min_volume: Decimal) -> Self {
        Self::new(quote, base, EdgeKind::Inverse, fee, FeeApplication::Before, min_volume)
    }

    fn new(
        source: &str,
        target: &str,
        kind: EdgeKind,
        fee: Decimal,
        fee_application: FeeApplication,
        min_volume: Decimal,
    ) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            fee,
            fee_application,
            min_volume,
            source_precision: 8,
            target_precision: 8,
            price: Decimal::ZERO,
            real_price: Decimal::ZERO,
            volume: None,
            last_updated_at: None,
        }
    }

    /// Set currency precisions (source, target).
    pub fn with_precisions(mut self, source: u32, target: u32) -> Self {
        self.source_precision = source;
        self.target_precision = target;
        self
    }

    /// Target units per source unit.
    pub fn price(&self) -> Decimal {
        self.price
    }

    /// Top-of-book volume in source units, `None` until observed.
    pub fn volume(&self) -> Option<Decimal> {
        self.volume
    }

    /// Price in the underlying market's orientation (quote per base).
    pub fn real_price(&self) -> Decimal {
        self.real_price
    }

    /// Set the price as quoted by the market. Inverse edges store its
    /// reciprocal.
    pub fn set_real_price(&mut self, real_price: Decimal) -> Result<(), GraphError> {
        let invalid = || GraphError::InvalidPrice {
            market: self.market(),
            price: real_price,
        };
        if real_price <= Decimal::ZERO {
            return Err(invalid());
        }

        self.price = match self.kind {
            EdgeKind::Direct => real_price,
            EdgeKind::Inverse => Decimal::ONE.checked_div(real_price).ok_or_else(invalid)?,
        };
        self.real_price = real_price;
        self.touch();
        Ok(())
    }

    /// Set the volume as quoted by the market (base units). Inverse edges
    /// convert it to source units with the current real price, so set the
    /// price first.
    pub fn set_real_volume(&mut self, real_volume: Decimal) {
        self.volume = Some(match self.kind {
            EdgeKind::Direct => real_volume,
            EdgeKind::Inverse => real_volume * self.real_price,
        });
        self.touch();
    }

    /// Refresh the staleness timestamp.
    pub fn touch(&mut self) {
        self.last_updated_at = Some(Instant::now());
    }

    /// Time since the last refresh, `None` if never refreshed.
    pub fn age(&self) -> Option<Duration> {
        self.last_updated_at.map(|at| at.elapsed())
    }

    /// Last refresh instant.
    pub fn last_updated_at(&self) -> Option<Instant> {
        self.last_updated_at
    }

    /// Whether price or volume has not been observed yet.
    pub fn has_empty_values(&self) -> bool {
        self.price.is_zero() || self.volume.is_none()
    }

    /// Underlying market symbol.
    pub fn market(&self) -> String {
        match self.kind {
            EdgeKind::Direct => format!("{}/{}", self.source, self.target),
            EdgeKind::Inverse => format!("{}/{}", self.target, self.source),
        }
    }

    /// Order side placed when traversing.
    pub fn side(&self) -> OrderSide {
        match self.kind {
            EdgeKind::Direct => OrderSide::Sell,
            EdgeKind::Inverse => OrderSide::Buy,
        }
    }

    /// Book side this edge prices from.
    pub fn book_side(&self) -> BookSide {
        match self.kind {
            EdgeKind::Direct => BookSide::Bid,
            EdgeKind::Inverse => BookSide::Ask,
        }
    }

    /// Expected output in target units for `input` source units.
    pub fn output_volume(&self, input: Decimal) -> Decimal {
        input * self.price * (Decimal::ONE - self.fee)
    }

    /// Realized output in target units from a filled order, if the response
    /// carries enough to compute it.
    pub fn cost_after_fees(&self, response: &OrderResponse) -> Option<Decimal> {
        match self.kind {
            EdgeKind::Direct => response
                .cost
                .map(|cost| cost - response.fee.unwrap_or(Decimal::ZERO)),
            EdgeKind::Inverse => response.filled.or(response.amount),
        }
    }

    /// Apply a top-of-book change. Returns `true` if price or volume changed;
    /// otherwise only the staleness timestamp is refreshed.
    pub fn update_from_record(&mut self, record: &OrderBookRecord) -> Result<bool, GraphError> {
        let unchanged = self.real_price == record.price
            && self.volume == Some(self.source_volume(record.price, record.volume));
        if unchanged {
            self.touch();
            return Ok(false);
        }

        self.set_real_price(record.price)?;
        self.set_real_volume(record.volume);
        Ok(true)
    }

    fn source_volume(&self, real_price: Decimal, real_volume: Decimal) -> Decimal {
        match self.kind {
            EdgeKind::Direct => real_volume,
            EdgeKind::Inverse => real_volume * real_price,
        }
    }

    /// Refresh price and volume from the live order book.
    #[instrument(skip(self, exchange), fields(edge = %self))]
    pub async fn update_from_api<E: Exchange + ?Sized>(
        &mut self,
        exchange: &E,
        depth: usize,
    ) -> Result<(), ExchangeError> {
        let symbol = self.market();
        let start = Instant::now();
        let book = exchange.fetch_order_book(&symbol, depth).await?;
        metrics::record_orderbook_fetch_latency(start, &symbol);

        let side = self.book_side();
        let level = book
            .best(side)
            .ok_or_else(|| ExchangeError::Parse(format!("order book {} has no {}", symbol, side)))?;

        self.set_real_price(level.price)
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        self.set_real_volume(level.size);
        debug!(price = %self.price, volume = ?self.volume, "Edge refreshed from order book");
        Ok(())
    }

    /// Limit price and base amount for an order spending `volume` source units.
    fn order_terms(&self, spec: &OrderSpec, slippage: Decimal) -> (Decimal, Decimal) {
        let price = match (spec.order_type, self.kind) {
            (OrderType::Limit, _) => self.real_price,
            (OrderType::Market, EdgeKind::Direct) => self.real_price * (Decimal::ONE - slippage),
            (OrderType::Market, EdgeKind::Inverse) => self.real_price * (Decimal::ONE + slippage),
        };

        let mut amount = match self.kind {
            EdgeKind::Direct => spec.volume,
            EdgeKind::Inverse if price.is_zero() => Decimal::ZERO,
            EdgeKind::Inverse => spec.volume / price,
        };
        if self.fee_application == FeeApplication::Before {
            amount *= Decimal::ONE - self.fee;
        }

        let (base_precision, quote_precision) = match self.kind {
            EdgeKind::Direct => (self.source_precision, self.target_precision),
            EdgeKind::Inverse => (self.target_precision, self.source_precision),
        };

        (
            price.round_dp(quote_precision),
            amount.round_dp_with_strategy(base_precision, RoundingStrategy::ToZero),
        )
    }

    /// Execute this leg for `spec.volume` source units and return the output
    /// in target units.
    ///
    /// Places a limit order, polls its status up to `policy.retries` times
    /// and cancels it if it never closes. In mock mode the exchange is not
    /// touched and the estimate is returned.
    #[instrument(skip(self, exchange, policy), fields(edge = %self, volume = %spec.volume, order_type = %spec.order_type))]
    pub async fn traverse<E: Exchange + ?Sized>(
        &self,
        exchange: &E,
        spec: OrderSpec,
        policy: &FillPolicy,
    ) -> Result<Decimal, TraversalError> {
        let estimated = self.output_volume(spec.volume);
        if spec.mock {
            debug!(estimated = %estimated, "Mock traversal");
            return Ok(estimated);
        }

        let symbol = self.market();
        let (price, amount) = self.order_terms(&spec, policy.market_slippage);

        let timer = metrics::timer_order_fill();
        let order_id = exchange
            .create_limit_order(&symbol, self.side(), amount, price)
            .await
            .map_err(|e| self.api_error("create_order", e))?;
        metrics::inc_orders_placed(self.kind.as_str());
        info!(order_id = %order_id, market = %symbol, side = %self.side(), amount = %amount, price = %price, "Order placed");

        let response = self.wait_for_fill(exchange, &order_id, &symbol, policy).await?;
        drop(timer);
        metrics::inc_orders_filled();

        let actual = self.cost_after_fees(&response);
        if let Some(actual) = actual {
            if !estimated.is_zero() {
                let deviation = (actual - estimated) / estimated * Decimal::ONE_HUNDRED;
                info!(
                    order_id = %order_id,
                    estimated = %estimated,
                    actual = %actual,
                    deviation_pct = %deviation.round_dp(4),
                    "Leg filled"
                );
            }
        } else {
            warn!(order_id = %order_id, estimated = %estimated, "Fill carries no cost data, using estimate");
        }

        Ok(actual.unwrap_or(estimated))
    }

    async fn wait_for_fill<E: Exchange + ?Sized>(
        &self,
        exchange: &E,
        order_id: &str,
        symbol: &str,
        policy: &FillPolicy,
    ) -> Result<OrderResponse, TraversalError> {
        for attempt in 1..=policy.retries {
            let response = exchange
                .fetch_order(order_id, symbol)
                .await
                .map_err(|e| self.api_error("fetch_order", e))?;

            match response.status {
                OrderStatus::Closed => return Ok(response),
                OrderStatus::Open => {
                    debug!(order_id = %order_id, attempt, "Order not filled yet");
                }
                status => {
                    metrics::inc_orders_failed("fetch_order");
                    return Err(TraversalError::Api {
                        edge: Box::new(self.clone()),
                        operation: "fetch_order",
                        message: format!("order {} ended as {}", order_id, status),
                    });
                }
            }

            if attempt < policy.retries {
                sleep(policy.poll_interval).await;
            }
        }

        warn!(order_id = %order_id, tries = policy.retries, "Order not filled, cancelling");
        exchange
            .cancel_order(order_id, symbol)
            .await
            .map_err(|e| self.api_error("cancel_order", e))?;
        metrics::inc_order_timeouts();

        Err(TraversalError::FillTimeout {
            edge: Box::new(self.clone()),
            order_id: order_id.to_string(),
            tries: policy.retries,
        })
    }

    fn api_error(&self, operation: &'static str, error: ExchangeError) -> TraversalError {
        metrics::inc_orders_failed(operation);
        warn!(edge = %self, operation, error = %error, "Exchange call failed");
        TraversalError::Api {
            edge: Box::new(self.clone()),
            operation,
            message: error.to_string(),
        }
    }

    /// Persistence record of this edge, optionally with the order placed on it.
    pub fn record(&self, opportunity_id: &str, order: Option<&OrderResponse>) -> EdgeRecord {
        EdgeRecord {
            opportunity_id: opportunity_id.to_string(),
            source: self.source.clone(),
            target: self.target.clone(),
            kind: self.kind,
            price: self.price,
            fee: self.fee,
            volume: self.volume,
            last_update_age_ms: self.age().map(|age| age.as_millis() as u64),
            order_id: order.map(|o| o.id.clone()),
            order_status: order.map(|o| o.status),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FillBehavior, MockConfig, MockExchange, MockExchangeBuilder};
    use rust_decimal_macros::dec;

    fn quick_policy(retries: u32) -> FillPolicy {
        FillPolicy {
            retries,
            poll_interval: Duration::from_millis(1),
            market_slippage: dec!(0.01),
        }
    }

    fn eth_btc_edges() -> (Edge, Edge) {
        let mut direct = Edge::direct("ETH", "BTC", dec!(0.001), dec!(0.01));
        let mut inverse = Edge::inverse("ETH", "BTC", dec!(0.001), dec!(0));
        direct.set_real_price(dec!(0.05)).unwrap();
        direct.set_real_volume(dec!(10));
        inverse.set_real_price(dec!(0.05)).unwrap();
        inverse.set_real_volume(dec!(10));
        (direct, inverse)
    }

    fn exchange() -> MockExchange {
        MockExchangeBuilder::new()
            .market("ETH", "BTC", dec!(0.001), dec!(0.05), dec!(0.05), dec!(10))
            .balance("ETH", dec!(10))
            .balance("BTC", dec!(1))
            .build()
    }

    #[test]
    fn inverse_stores_reciprocal_price_and_source_volume() {
        let (direct, inverse) = eth_btc_edges();

        assert_eq!(direct.price(), dec!(0.05));
        assert_eq!(direct.volume(), Some(dec!(10)));
        assert_eq!(inverse.price(), dec!(20));
        assert_eq!(inverse.real_price(), dec!(0.05));
        assert_eq!(inverse.volume(), Some(dec!(0.5)));
    }

    #[test]
    fn inverse_price_is_reciprocal_for_many_prices() {
        for (price, volume) in [(dec!(0.25), dec!(3)), (dec!(4), dec!(0.5)), (dec!(20000), dec!(1.5))] {
            let mut edge = Edge::inverse("BTC", "USD", dec!(0), dec!(0));
            edge.set_real_price(price).unwrap();
            edge.set_real_volume(volume);

            assert_eq!(edge.price() * price, dec!(1));
            assert_eq!(edge.volume(), Some(volume * price));
        }
    }

    #[test]
    fn market_and_side_follow_kind() {
        let (direct, inverse) = eth_btc_edges();

        assert_eq!(direct.market(), "ETH/BTC");
        assert_eq!(inverse.market(), "ETH/BTC");
        assert_eq!(direct.side(), OrderSide::Sell);
        assert_eq!(inverse.side(), OrderSide::Buy);
        assert_eq!(inverse.to_string(), "BTC -> ETH");
    }

    #[test]
    fn rejects_non_positive_price() {
        let mut edge = Edge::direct("ETH", "BTC", dec!(0), dec!(0));
        assert!(matches!(
            edge.set_real_price(dec!(0)),
            Err(GraphError::InvalidPrice { .. })
        ));
        assert!(edge.has_empty_values());
    }

    #[test]
    fn identical_record_reports_no_change() {
        let (mut direct, mut inverse) = eth_btc_edges();
        let bid = OrderBookRecord {
            symbol: "ETH/BTC".into(),
            side: BookSide::Bid,
            price: dec!(0.05),
            volume: dec!(10),
        };
        let ask = OrderBookRecord {
            side: BookSide::Ask,
            ..bid.clone()
        };

        assert!(!direct.update_from_record(&bid).unwrap());
        assert!(!inverse.update_from_record(&ask).unwrap());
        assert_eq!(direct.price(), dec!(0.05));

        let moved = OrderBookRecord {
            volume: dec!(11),
            ..bid
        };
        assert!(direct.update_from_record(&moved).unwrap());
        assert_eq!(direct.volume(), Some(dec!(11)));
    }

    #[tokio::test]
    async fn mock_traversal_returns_estimate() {
        let (direct, _) = eth_btc_edges();
        let exchange = MockExchange::new();

        let output = direct
            .traverse(&exchange, OrderSpec::limit(dec!(2), true), &quick_policy(1))
            .await
            .unwrap();

        assert_eq!(output, dec!(2) * dec!(0.05) * dec!(0.999));
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn direct_traversal_returns_cost_minus_fee() {
        let (direct, _) = eth_btc_edges();
        let exchange = exchange();

        let output = direct
            .traverse(&exchange, OrderSpec::limit(dec!(2), false), &quick_policy(3))
            .await
            .unwrap();

        assert_eq!(output, dec!(0.0999));
        let order = &exchange.orders()[0];
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.amount, dec!(2));
        assert_eq!(order.price, dec!(0.05));
    }

    #[tokio::test]
    async fn inverse_traversal_buys_fee_reduced_amount() {
        let (_, inverse) = eth_btc_edges();
        let exchange = exchange();

        let output = inverse
            .traverse(&exchange, OrderSpec::limit(dec!(0.1), false), &quick_policy(3))
            .await
            .unwrap();

        // 0.1 BTC buys 2 ETH, minus the fee taken before submission
        assert_eq!(output, dec!(1.998));
        assert_eq!(exchange.orders()[0].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn market_order_applies_slippage() {
        let (direct, inverse) = eth_btc_edges();
        let exchange = exchange();

        direct
            .traverse(&exchange, OrderSpec::market(dec!(1), false), &quick_policy(1))
            .await
            .unwrap();
        inverse
            .traverse(&exchange, OrderSpec::market(dec!(0.0505), false), &quick_policy(1))
            .await
            .unwrap();

        let orders = exchange.orders();
        assert_eq!(orders[0].price, dec!(0.0495));
        assert_eq!(orders[1].price, dec!(0.0505));
        assert_eq!(orders[1].amount, dec!(0.999));
    }

    #[tokio::test]
    async fn unfilled_order_is_cancelled_and_times_out() {
        let (direct, _) = eth_btc_edges();
        let exchange = exchange();
        exchange.set_fill_behavior("ETH/BTC", FillBehavior::Never);

        let err = direct
            .traverse(&exchange, OrderSpec::limit(dec!(1), false), &quick_policy(3))
            .await
            .unwrap_err();

        match err {
            TraversalError::FillTimeout { edge, tries, .. } => {
                assert_eq!(tries, 3);
                assert_eq!(edge.to_string(), "ETH -> BTC");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(exchange.orders()[0].status, OrderStatus::Canceled);
        assert_eq!(exchange.orders()[0].polls, 3);
    }

    #[tokio::test]
    async fn placement_failure_is_api_error() {
        let (direct, _) = eth_btc_edges();
        let exchange = MockExchange::with_config(MockConfig {
            fail_place: true,
            ..Default::default()
        });

        let err = direct
            .traverse(&exchange, OrderSpec::limit(dec!(1), false), &quick_policy(3))
            .await
            .unwrap_err();

        assert!(matches!(err, TraversalError::Api { operation: "create_order", .. }));
    }

    #[tokio::test]
    async fn cancel_failure_is_api_error() {
        let (direct, _) = eth_btc_edges();
        let exchange = MockExchange::with_config(MockConfig {
            fail_cancel: true,
            fill: FillBehavior::Never,
            ..Default::default()
        });
        exchange.add_market(crate::exchange::Market::new("ETH", "BTC", dec!(0.001), dec!(0)));

        let err = direct
            .traverse(&exchange, OrderSpec::limit(dec!(1), false), &quick_policy(2))
            .await
            .unwrap_err();

        assert!(matches!(err, TraversalError::Api { operation: "cancel_order", .. }));
    }

    #[tokio::test]
    async fn update_from_api_reads_best_level() {
        let (mut direct, mut inverse) = eth_btc_edges();
        let exchange = exchange();
        exchange.set_top_of_book("ETH/BTC", dec!(0.049), dec!(0.051), dec!(4));

        direct.update_from_api(&exchange, 5).await.unwrap();
        inverse.update_from_api(&exchange, 5).await.unwrap();

        assert_eq!(direct.price(), dec!(0.049));
        assert_eq!(direct.volume(), Some(dec!(4)));
        assert_eq!(inverse.real_price(), dec!(0.051));
        assert_eq!(inverse.volume(), Some(dec!(0.204)));
    }
}
