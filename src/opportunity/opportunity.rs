//! A profitable triangle and the orchestration of its three legs.

use std::fmt;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use super::record::{rfc3339, OpportunityRecord};
use crate::error::{ExchangeError, GraphError, OpportunityError, TraversalError};
use crate::exchange::{Currency, Exchange};
use crate::graph::{CurrencyGraph, Edge, EdgeKind, FillPolicy, OrderSpec, Triangle};

/// Currencies the fallback unwind is allowed to stop in.
pub const DEFAULT_NEUTRAL_CURRENCIES: [&str; 6] = ["BTC", "ETH", "USD", "USDT", "EUR", "CAD"];

/// Parameters for executing an opportunity.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Per-leg order wait.
    pub fill: FillPolicy,
    /// Currencies where an unwind may stop.
    pub neutral_currencies: Vec<Currency>,
    /// Simulate orders instead of placing them.
    pub mock: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            fill: FillPolicy::default(),
            neutral_currencies: DEFAULT_NEUTRAL_CURRENCIES.iter().map(|c| c.to_string()).collect(),
            mock: true,
        }
    }
}

/// Result of an exploit attempt that got past validation.
#[derive(Debug)]
pub enum ExploitOutcome {
    /// All three legs filled.
    Completed {
        /// Final volume in the reference currency.
        output: Decimal,
    },
    /// A leg failed.
    Failed {
        /// The leg failure.
        error: TraversalError,
        /// Currency held when the leg failed.
        stranded_currency: Currency,
        /// Volume held when the leg failed.
        stranded_volume: Decimal,
        /// Unwind result: where the volume ended up. `None` if the first leg
        /// failed and nothing had been converted.
        unwind: Option<Result<(Currency, Decimal), OpportunityError>>,
    },
}

impl ExploitOutcome {
    /// Whether all legs filled.
    pub fn is_completed(&self) -> bool {
        matches!(self, ExploitOutcome::Completed { .. })
    }
}

/// One triangle whose arbitrage crossed the threshold.
#[derive(Debug, Clone)]
pub struct Opportunity {
    id: String,
    exchange: String,
    edges: [Edge; 3],
    arbitrage: Decimal,
    min_volume: Decimal,
    max_volume: Option<Decimal>,
    created_at: OffsetDateTime,
    detected_at: Instant,
    closed_at: Option<OffsetDateTime>,
}

impl Opportunity {
    /// Wrap three chained edges.
    pub fn new(exchange: &str, edges: [Edge; 3]) -> Self {
        let mut nodes: Vec<&str> = edges.iter().map(|e| e.source.as_str()).collect();
        nodes.sort_unstable();

        let mut opportunity = Self {
            id: nodes.concat(),
            exchange: exchange.to_string(),
            arbitrage: Self::compute_arbitrage(&edges),
            edges,
            min_volume: Decimal::ZERO,
            max_volume: None,
            created_at: OffsetDateTime::now_utc(),
            detected_at: Instant::now(),
            closed_at: None,
        };
        opportunity.refresh_volumes();
        opportunity
    }

    /// Build from the graph's current edges.
    pub fn from_triangle(graph: &CurrencyGraph, triangle: &Triangle) -> Result<Self, GraphError> {
        Ok(Self::new(graph.exchange(), graph.edges_of(triangle)?))
    }

    /// Product of `price * (1 - fee)` over the edges.
    pub fn compute_arbitrage(edges: &[Edge; 3]) -> Decimal {
        edges
            .iter()
            .fold(Decimal::ONE, |acc, edge| edge.output_volume(acc))
    }

    fn refresh_volumes(&mut self) {
        self.min_volume = self.compute_min_volume();
        self.max_volume = self.compute_max_volume();
    }

    /// Smallest trade, in the reference currency, that satisfies every leg's
    /// minimum.
    fn compute_min_volume(&self) -> Decimal {
        let mut volume = self.edges[0].min_volume;
        for edge in &self.edges {
            volume = volume.max(edge.min_volume);
            volume = edge.output_volume(volume);
        }
        volume
    }

    /// Largest trade, in the reference currency, the observed books can take.
    /// `None` until every leg's volume has been observed.
    fn compute_max_volume(&self) -> Option<Decimal> {
        let mut volume = self.edges[0].volume()?;
        for edge in &self.edges {
            volume = volume.min(edge.volume()?);
            volume = edge.output_volume(volume);
        }
        Some(volume)
    }

    /// Deterministic id: sorted concatenation of the currencies.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exchange name.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Compounded, fee-adjusted ratio.
    pub fn arbitrage(&self) -> Decimal {
        self.arbitrage
    }

    /// Minimum trade volume in the reference currency.
    pub fn min_volume(&self) -> Decimal {
        self.min_volume
    }

    /// Maximum trade volume in the reference currency, `None` if undefined.
    pub fn max_volume(&self) -> Option<Decimal> {
        self.max_volume
    }

    /// Currency the volume bounds are expressed in.
    pub fn reference_unit(&self) -> &str {
        &self.edges[0].source
    }

    /// Currencies in cycle order starting at the reference unit.
    pub fn nodes(&self) -> Vec<Currency> {
        self.edges.iter().map(|e| e.source.clone()).collect()
    }

    /// Edges in cycle order.
    pub fn edges(&self) -> &[Edge; 3] {
        &self.edges
    }

    /// Whether `currency` is one of the three nodes.
    pub fn contains(&self, currency: &str) -> bool {
        self.edges.iter().any(|e| e.source == currency)
    }

    /// Time since first detection.
    pub fn duration(&self) -> Duration {
        self.detected_at.elapsed()
    }

    /// Wall-clock time of first detection.
    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    /// Mark as closed now.
    pub fn close(&mut self) {
        self.closed_at = Some(OffsetDateTime::now_utc());
    }

    /// Take prices and arbitrage from a fresher instance of the same triangle,
    /// keeping the detection time and any volume the fresher edges lack.
    pub fn absorb(&mut self, newer: Opportunity) {
        let reference = self.reference_unit().to_string();
        let mut edges = newer.edges;

        for edge in edges.iter_mut() {
            if edge.volume().is_some() {
                continue;
            }
            let previous = self
                .edges
                .iter()
                .find(|e| e.source == edge.source && e.target == edge.target)
                .and_then(Edge::volume);
            if let Some(volume) = previous {
                let real_volume = volume_in_market_units(edge, volume);
                edge.set_real_volume(real_volume);
            }
        }

        self.edges = edges;
        self.arbitrage = newer.arbitrage;
        self.refresh_volumes();
        if let Err(e) = self.change_starting_point(&reference) {
            error!(opportunity = %self.id, error = %e, "Failed to restore reference unit");
        }
    }

    /// Rotate so that the first edge starts at `currency`.
    pub fn change_starting_point(&mut self, currency: &str) -> Result<(), OpportunityError> {
        let index = self
            .edges
            .iter()
            .position(|e| e.source == currency)
            .ok_or_else(|| OpportunityError::InvalidReferenceUnit {
                currency: currency.to_string(),
                triangle: self.id.clone(),
            })?;

        self.edges.rotate_left(index);
        if self.edges[0].source != currency {
            error!(opportunity = %self.id, currency = %currency, "Triangle rotation failed");
            return Err(OpportunityError::RotationFailed {
                currency: currency.to_string(),
                triangle: self.id.clone(),
            });
        }

        self.refresh_volumes();
        Ok(())
    }

    /// Refresh every leg from the live order books, then recompute the
    /// maximum volume. All three fetches complete before anything is read.
    #[instrument(skip(self, exchange), fields(opportunity = %self.id))]
    pub async fn update_from_api<E: Exchange + ?Sized>(
        &mut self,
        exchange: &E,
        depth: usize,
    ) -> Result<(), ExchangeError> {
        let [a, b, c] = &mut self.edges;
        tokio::try_join!(
            a.update_from_api(exchange, depth),
            b.update_from_api(exchange, depth),
            c.update_from_api(exchange, depth),
        )?;

        self.max_volume = self.compute_max_volume();
        info!(max_volume = ?self.max_volume, "Opportunity volumes fetched");
        Ok(())
    }

    /// Trade `starting_volume` of `currency` around the triangle.
    ///
    /// Fails before trading if `currency` is not part of the triangle or the
    /// maximum volume is undefined. A failing leg triggers
    /// [`Opportunity::back_to_safety`] with whatever is held at that point.
    #[instrument(skip(self, exchange, settings), fields(opportunity = %self.id, currency = %currency, volume = %starting_volume))]
    pub async fn exploit<E: Exchange + ?Sized>(
        &mut self,
        exchange: &E,
        currency: &str,
        starting_volume: Decimal,
        settings: &ExecutionSettings,
    ) -> Result<ExploitOutcome, OpportunityError> {
        self.change_starting_point(currency)?;

        if self.max_volume.is_none() {
            error!("Max volume is not defined, exploit cancelled");
            return Err(OpportunityError::UndefinedVolumeBound(self.id.clone()));
        }

        info!(
            expected_gain = %(starting_volume * (self.arbitrage - Decimal::ONE)),
            mock = settings.mock,
            "Exploiting opportunity"
        );

        let edges = self.edges.clone();
        let mut volume = starting_volume;

        for (index, edge) in edges.iter().enumerate() {
            let spec = OrderSpec::limit(volume, settings.mock);
            match edge.traverse(exchange, spec, &settings.fill).await {
                Ok(output) => {
                    info!(edge = %edge, input = %volume, output = %output, "Edge traversed");
                    volume = output;
                }
                Err(e) => {
                    warn!(edge = %e.edge(), error = %e, "Leg failed");
                    let unwind = if index == 0 {
                        None
                    } else {
                        Some(self.back_to_safety(exchange, &edge.source, volume, settings).await)
                    };

                    return Ok(ExploitOutcome::Failed {
                        error: e,
                        stranded_currency: edge.source.clone(),
                        stranded_volume: volume,
                        unwind,
                    });
                }
            }
        }

        Ok(ExploitOutcome::Completed { output: volume })
    }

    /// Move `volume` of `currency` along the triangle with market orders until
    /// a neutral currency is reached. Returns where the volume ended up.
    #[instrument(skip(self, exchange, settings), fields(opportunity = %self.id, currency = %currency, volume = %volume))]
    pub async fn back_to_safety<E: Exchange + ?Sized>(
        &mut self,
        exchange: &E,
        currency: &str,
        volume: Decimal,
        settings: &ExecutionSettings,
    ) -> Result<(Currency, Decimal), OpportunityError> {
        info!("Starting fallback unwind");
        self.change_starting_point(currency)?;

        let edges = self.edges.clone();
        let mut volume = volume;

        for edge in &edges {
            if settings.neutral_currencies.iter().any(|c| c == &edge.source) {
                info!(currency = %edge.source, volume = %volume, "Back to neutral currency");
                return Ok((edge.source.clone(), volume));
            }

            info!(edge = %edge, "Leaving non-neutral currency with a market order");
            volume = edge
                .traverse(exchange, OrderSpec::market(volume, settings.mock), &settings.fill)
                .await?;
        }

        warn!(currency = %currency, volume = %volume, "Unwind went full circle without a neutral currency");
        Ok((currency.to_string(), volume))
    }

    /// Persistence record.
    pub fn record(&self) -> OpportunityRecord {
        OpportunityRecord {
            id: self.id.clone(),
            exchange: self.exchange.clone(),
            arbitrage: self.arbitrage,
            cycle: self.nodes(),
            min_volume: self.min_volume,
            max_volume: self.max_volume,
            created_at: rfc3339(self.created_at),
            closed_at: self.closed_at.map(rfc3339),
            duration_ms: self.duration().as_millis() as u64,
            edges: self.edges.iter().map(|e| e.record(&self.id, None)).collect(),
        }
    }
}

/// Convert a source-unit volume back to the market's base units.
fn volume_in_market_units(edge: &Edge, volume: Decimal) -> Decimal {
    match edge.kind {
        EdgeKind::Direct => volume,
        EdgeKind::Inverse if edge.real_price().is_zero() => Decimal::ZERO,
        EdgeKind::Inverse => volume / edge.real_price(),
    }
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} -> {} ({})",
            self.edges[0].source, self.edges[1].source, self.edges[2].source, self.arbitrage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FillBehavior, MockExchange, MockExchangeBuilder, OrderSide};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn edge(source: &str, target: &str, price: Decimal, fee: Decimal, min: Decimal) -> Edge {
        let mut edge = Edge::direct(source, target, fee, min);
        edge.set_real_price(price).unwrap();
        edge
    }

    fn triangle(prices: [Decimal; 3], fee: Decimal) -> Opportunity {
        Opportunity::new(
            "mock",
            [
                edge("A", "B", prices[0], fee, dec!(0)),
                edge("B", "C", prices[1], fee, dec!(0)),
                edge("C", "A", prices[2], fee, dec!(0)),
            ],
        )
    }

    fn settings(mock: bool) -> ExecutionSettings {
        ExecutionSettings {
            fill: FillPolicy {
                retries: 2,
                poll_interval: Duration::from_millis(1),
                market_slippage: dec!(0.01),
            },
            mock,
            ..Default::default()
        }
    }

    #[test]
    fn arbitrage_is_product_of_prices() {
        assert_eq!(triangle([dec!(1), dec!(2), dec!(3)], dec!(0)).arbitrage(), dec!(6));

        let fee = dec!(0.001);
        let expected = dec!(6) * (Decimal::ONE - fee) * (Decimal::ONE - fee) * (Decimal::ONE - fee);
        assert_eq!(triangle([dec!(1), dec!(2), dec!(3)], fee).arbitrage(), expected);
    }

    #[test]
    fn id_is_rotation_invariant() {
        let mut opportunity = triangle([dec!(1), dec!(2), dec!(3)], dec!(0));
        assert_eq!(opportunity.id(), "ABC");

        opportunity.change_starting_point("C").unwrap();
        assert_eq!(opportunity.id(), "ABC");
        assert_eq!(opportunity.reference_unit(), "C");
        assert_eq!(opportunity.nodes(), vec!["C", "A", "B"]);
        assert_eq!(opportunity.arbitrage(), dec!(6));
    }

    #[test]
    fn rotation_to_foreign_currency_fails() {
        let mut opportunity = triangle([dec!(1), dec!(2), dec!(3)], dec!(0));

        let err = opportunity.change_starting_point("XMR").unwrap_err();

        assert!(matches!(err, OpportunityError::InvalidReferenceUnit { .. }));
        assert_eq!(opportunity.reference_unit(), "A");
    }

    #[test]
    fn min_volume_walks_the_cycle() {
        let opportunity = Opportunity::new(
            "mock",
            [
                edge("A", "B", dec!(2), dec!(0), dec!(1)),
                edge("B", "C", dec!(1), dec!(0), dec!(5)),
                edge("C", "A", dec!(0.5), dec!(0), dec!(1)),
            ],
        );

        // 1 A -> 2 B, raised to 5 B -> 5 C -> 2.5 A
        assert_eq!(opportunity.min_volume(), dec!(2.5));
    }

    #[test]
    fn min_volume_is_monotonic_in_leg_minimum() {
        let mut previous = Decimal::ZERO;
        for min in [dec!(0), dec!(0.5), dec!(1), dec!(3), dec!(10)] {
            let opportunity = Opportunity::new(
                "mock",
                [
                    edge("A", "B", dec!(2), dec!(0.001), dec!(1)),
                    edge("B", "C", dec!(1.5), dec!(0.001), min),
                    edge("C", "A", dec!(0.4), dec!(0.001), dec!(0.2)),
                ],
            );
            assert!(opportunity.min_volume() >= previous);
            previous = opportunity.min_volume();
        }
    }

    #[test]
    fn max_volume_undefined_until_all_volumes_observed() {
        let mut edges = [
            edge("A", "B", dec!(2), dec!(0), dec!(0)),
            edge("B", "C", dec!(1), dec!(0), dec!(0)),
            edge("C", "A", dec!(0.5), dec!(0), dec!(0)),
        ];
        edges[0].set_real_volume(dec!(10));
        edges[1].set_real_volume(dec!(4));
        assert_eq!(Opportunity::new("mock", edges.clone()).max_volume(), None);

        edges[2].set_real_volume(dec!(100));
        // 10 A -> 20 B, capped to 4 B -> 4 C -> 2 A
        assert_eq!(Opportunity::new("mock", edges).max_volume(), Some(dec!(2)));
    }

    #[tokio::test]
    async fn exploit_refuses_undefined_max_volume() {
        let mut opportunity = triangle([dec!(1), dec!(2), dec!(3)], dec!(0));

        let err = opportunity
            .exploit(&MockExchange::new(), "A", dec!(1), &settings(true))
            .await
            .unwrap_err();

        assert!(matches!(err, OpportunityError::UndefinedVolumeBound(_)));
    }

    fn eth_btc_usd() -> MockExchange {
        MockExchangeBuilder::new()
            .market("ETH", "BTC", dec!(0), dec!(0.05), dec!(0.05), dec!(100))
            .market("BTC", "USD", dec!(0), dec!(20000), dec!(20000), dec!(100))
            .market("ETH", "USD", dec!(0), dec!(1100), dec!(1100), dec!(100))
            .balance("USD", dec!(10000))
            .build()
    }

    async fn observed(exchange: &MockExchange) -> Opportunity {
        let markets = exchange.load_markets().await.unwrap();
        let graph = CurrencyGraph::new("mock", &markets);
        let triangle = graph.triangles()[0].clone();
        let mut opportunity = Opportunity::from_triangle(&graph, &triangle).unwrap();
        opportunity.update_from_api(exchange, 5).await.unwrap();
        opportunity
    }

    #[tokio::test]
    async fn update_from_api_defines_max_volume() {
        let exchange = eth_btc_usd();
        let opportunity = observed(&exchange).await;

        assert!(opportunity.max_volume().is_some());
        assert_eq!(exchange.order_book_fetches(), 3);
    }

    #[tokio::test]
    async fn exploit_traverses_all_legs() {
        let exchange = eth_btc_usd();
        let mut opportunity = observed(&exchange).await;

        let outcome = opportunity
            .exploit(&exchange, "USD", dec!(1100), &settings(false))
            .await
            .unwrap();

        // 1100 USD buys 0.055 BTC, which buys 1.1 ETH, which sells for 1210 USD
        match outcome {
            ExploitOutcome::Completed { output } => assert_eq!(output, dec!(1210)),
            other => panic!("unexpected outcome {other:?}"),
        }
        let sides: Vec<OrderSide> = exchange.orders().iter().map(|o| o.side).collect();
        assert_eq!(sides, vec![OrderSide::Buy, OrderSide::Buy, OrderSide::Sell]);
    }

    #[tokio::test]
    async fn failed_leg_unwinds_to_neutral_currency() {
        let exchange = eth_btc_usd();
        let mut opportunity = observed(&exchange).await;
        exchange.set_fill_behavior("ETH/BTC", FillBehavior::Never);

        let outcome = opportunity
            .exploit(&exchange, "USD", dec!(1100), &settings(false))
            .await
            .unwrap();

        match outcome {
            ExploitOutcome::Failed {
                error,
                stranded_currency,
                stranded_volume,
                unwind,
            } => {
                assert!(matches!(error, TraversalError::FillTimeout { .. }));
                assert_eq!(stranded_currency, "BTC");
                assert_eq!(stranded_volume, dec!(0.055));
                // BTC is neutral, nothing else is traded
                let (currency, volume) = unwind.unwrap().unwrap();
                assert_eq!(currency, "BTC");
                assert_eq!(volume, dec!(0.055));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(exchange.orders().len(), 2);
    }

    #[tokio::test]
    async fn back_to_safety_trades_out_of_non_neutral_currency() {
        let mut opportunity = triangle([dec!(2), dec!(3), dec!(0.25)], dec!(0));
        let settings = ExecutionSettings {
            neutral_currencies: vec!["C".to_string()],
            ..settings(true)
        };

        let (currency, volume) = opportunity
            .back_to_safety(&MockExchange::new(), "A", dec!(1), &settings)
            .await
            .unwrap();

        assert_eq!(currency, "C");
        assert_eq!(volume, dec!(6));
    }

    #[test]
    fn absorb_keeps_creation_time_and_volumes() {
        let mut edges = [
            edge("A", "B", dec!(2), dec!(0), dec!(0)),
            edge("B", "C", dec!(1), dec!(0), dec!(0)),
            edge("C", "A", dec!(0.6), dec!(0), dec!(0)),
        ];
        for e in edges.iter_mut() {
            e.set_real_volume(dec!(10));
        }
        let mut current = Opportunity::new("mock", edges);
        let created = current.created_at();

        let newer = triangle([dec!(2), dec!(1), dec!(0.7)], dec!(0));
        current.absorb(newer);

        assert_eq!(current.created_at(), created);
        assert_eq!(current.arbitrage(), dec!(1.4));
        assert!(current.max_volume().is_some());
    }

    #[test]
    fn record_lists_cycle_and_edges() {
        let mut opportunity = triangle([dec!(1), dec!(2), dec!(3)], dec!(0));
        opportunity.close();

        let record = opportunity.record();

        assert_eq!(record.cycle, vec!["A", "B", "C"]);
        assert_eq!(record.edges.len(), 3);
        assert_eq!(record.max_volume, None);
        assert!(record.closed_at.is_some());
    }
}
