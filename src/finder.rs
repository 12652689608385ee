//! Opportunity detection loop.
//!
//! The finder owns the currency graph and the map of open opportunities.
//! Each cycle it refreshes prices (polled tickers or a streamed top-of-book
//! record), rebuilds the set of triangles above the threshold and diffs it
//! against the previous set:
//!
//! 1. ids that disappeared are emitted as [`OpportunityEvent::Closed`]
//! 2. new ids are emitted as [`OpportunityEvent::Added`]
//! 3. ids whose arbitrage changed are emitted as [`OpportunityEvent::Updated`]
//!
//! The new map is published through a `watch` channel before the events
//! are sent, so a subscriber reacting to an event always finds it there.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExchangeError;
use crate::exchange::{Exchange, Market, OrderBookRecord};
use crate::graph::CurrencyGraph;
use crate::metrics;
use crate::opportunity::{Opportunity, OpportunityStore};

/// Read-only view of the open opportunities.
pub type OpportunityMap = Arc<HashMap<String, Opportunity>>;

/// Opportunity lifecycle event.
#[derive(Debug, Clone)]
pub enum OpportunityEvent {
    /// A triangle crossed the threshold.
    Added {
        /// Opportunity id.
        id: String,
    },
    /// An open opportunity's arbitrage changed.
    Updated {
        /// Opportunity id.
        id: String,
        /// Arbitrage before the change.
        previous_arbitrage: Decimal,
    },
    /// An opportunity fell below the threshold or disappeared.
    Closed {
        /// Final state.
        opportunity: Box<Opportunity>,
        /// Time it stayed open.
        duration: Duration,
    },
}

impl OpportunityEvent {
    /// Id of the opportunity the event is about.
    pub fn id(&self) -> &str {
        match self {
            OpportunityEvent::Added { id } | OpportunityEvent::Updated { id, .. } => id,
            OpportunityEvent::Closed { opportunity, .. } => opportunity.id(),
        }
    }
}

/// Detection loop settings.
#[derive(Debug, Clone)]
pub struct FinderSettings {
    /// Minimum arbitrage for a triangle to be an opportunity.
    pub threshold: Decimal,
    /// Fetch order books for new opportunities to define their max volume.
    pub fetch_volumes: bool,
    /// Ticker polling period.
    pub poll_interval: Duration,
    /// Order book depth requested when fetching volumes.
    pub order_book_depth: usize,
    /// Period of the graph staleness log.
    pub stats_interval: Duration,
}

impl Default for FinderSettings {
    fn default() -> Self {
        Self {
            threshold: Decimal::new(1001, 3),
            fetch_volumes: true,
            poll_interval: Duration::from_millis(1000),
            order_book_depth: 5,
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// Detection loop.
pub struct Finder<E: Exchange + ?Sized> {
    exchange: Arc<E>,
    settings: FinderSettings,
    store: Arc<dyn OpportunityStore>,
    graph: CurrencyGraph,
    opportunities: HashMap<String, Opportunity>,
    snapshot: watch::Sender<OpportunityMap>,
    subscribers: Vec<mpsc::UnboundedSender<OpportunityEvent>>,
}

impl<E: Exchange + ?Sized> Finder<E> {
    /// Create a finder. Call [`Finder::init`] or [`Finder::load`] before running.
    pub fn new(exchange: Arc<E>, settings: FinderSettings, store: Arc<dyn OpportunityStore>) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(HashMap::new()));
        Self {
            exchange,
            settings,
            store,
            graph: CurrencyGraph::default(),
            opportunities: HashMap::new(),
            snapshot,
            subscribers: Vec::new(),
        }
    }

    /// Build the graph from a market list.
    pub fn init(&mut self, markets: &[Market]) {
        self.graph = CurrencyGraph::new(self.exchange.name(), markets);
    }

    /// Load markets from the exchange and build the graph. Returns the markets.
    pub async fn load(&mut self) -> Result<Vec<Market>, ExchangeError> {
        let markets = self.exchange.load_markets().await?;
        self.init(&markets);
        Ok(markets)
    }

    /// Receive lifecycle events.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<OpportunityEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Watch the published opportunity map.
    pub fn snapshot(&self) -> watch::Receiver<OpportunityMap> {
        self.snapshot.subscribe()
    }

    /// The currency graph.
    pub fn graph(&self) -> &CurrencyGraph {
        &self.graph
    }

    /// Open opportunities.
    pub fn opportunities(&self) -> &HashMap<String, Opportunity> {
        &self.opportunities
    }

    /// Poll tickers and run one detection cycle. A failed ticker fetch skips
    /// the cycle and returns no events.
    #[instrument(skip(self))]
    pub async fn poll_once(&mut self) -> Vec<OpportunityEvent> {
        let tickers = {
            let _timer = metrics::timer_ticker_fetch();
            self.exchange.fetch_tickers().await
        };

        match tickers {
            Ok(tickers) => {
                self.graph.update(&tickers);
                self.detect(false).await
            }
            Err(e) => {
                metrics::inc_ticker_fetch_failures();
                error!(error = %e, "Could not fetch tickers, skipping cycle");
                Vec::new()
            }
        }
    }

    /// Apply a streamed top-of-book record; run a detection cycle over the
    /// fully observed triangles if it changed an edge.
    pub async fn apply_record(&mut self, record: &OrderBookRecord) -> Vec<OpportunityEvent> {
        metrics::inc_stream_records();
        match self.graph.update_from_order_book_record(record) {
            Ok(true) => self.detect(true).await,
            Ok(false) => Vec::new(),
            Err(e) => {
                debug!(market = %record.symbol, error = %e, "Record ignored");
                Vec::new()
            }
        }
    }

    fn candidates(&self, observed_only: bool) -> BTreeMap<String, Opportunity> {
        let triangles: Vec<_> = if observed_only {
            self.graph.observed_triangles()
        } else {
            self.graph.triangles().iter().collect()
        };

        triangles
            .into_iter()
            .filter_map(|triangle| match Opportunity::from_triangle(&self.graph, triangle) {
                Ok(opportunity) => Some(opportunity),
                Err(e) => {
                    error!(triangle = %triangle, error = %e, "Triangle references a missing edge");
                    None
                }
            })
            .filter(|o| o.arbitrage() > self.settings.threshold)
            .map(|o| (o.id().to_string(), o))
            .collect()
    }

    /// Diff the current candidates against the open set, publish the new set
    /// and send the resulting events in close, add, update order.
    pub async fn detect(&mut self, observed_only: bool) -> Vec<OpportunityEvent> {
        let _timer = metrics::timer_detection_cycle();
        let candidates = self.candidates(observed_only);
        let mut events = Vec::new();

        let closed: Vec<String> = self
            .opportunities
            .keys()
            .filter(|id| !candidates.contains_key(*id))
            .cloned()
            .collect();
        for id in closed {
            let Some(mut opportunity) = self.opportunities.remove(&id) else {
                continue;
            };
            opportunity.close();
            let duration = opportunity.duration();
            info!(
                opportunity = %id,
                arbitrage = %opportunity.arbitrage(),
                duration_ms = duration.as_millis() as u64,
                "Opportunity closed"
            );
            if let Err(e) = self.store.save(&opportunity.record()).await {
                warn!(opportunity = %id, error = %e, "Failed to save closed opportunity");
            }
            metrics::inc_opportunities_closed();
            events.push(OpportunityEvent::Closed {
                opportunity: Box::new(opportunity),
                duration,
            });
        }

        let mut updated = Vec::new();
        for (id, candidate) in candidates {
            if let Some(existing) = self.opportunities.get_mut(&id) {
                let previous_arbitrage = existing.arbitrage();
                if previous_arbitrage != candidate.arbitrage() {
                    existing.absorb(candidate);
                    if self.settings.fetch_volumes {
                        if let Err(e) = existing
                            .update_from_api(self.exchange.as_ref(), self.settings.order_book_depth)
                            .await
                        {
                            warn!(opportunity = %id, error = %e, "Could not refresh opportunity volumes");
                        }
                    }
                    info!(
                        opportunity = %id,
                        previous = %previous_arbitrage,
                        arbitrage = %existing.arbitrage(),
                        "Opportunity updated"
                    );
                    metrics::inc_opportunities_updated();
                    updated.push(OpportunityEvent::Updated { id, previous_arbitrage });
                }
                continue;
            }

            let mut opportunity = candidate;
            if self.settings.fetch_volumes {
                if let Err(e) = opportunity
                    .update_from_api(self.exchange.as_ref(), self.settings.order_book_depth)
                    .await
                {
                    warn!(opportunity = %id, error = %e, "Could not fetch opportunity volumes");
                }
            }
            info!(
                opportunity = %id,
                cycle = %opportunity,
                min_volume = %opportunity.min_volume(),
                max_volume = ?opportunity.max_volume(),
                "Opportunity found"
            );
            metrics::inc_opportunities_added();
            self.opportunities.insert(id.clone(), opportunity);
            events.push(OpportunityEvent::Added { id });
        }
        events.extend(updated);

        metrics::set_open_opportunities(self.opportunities.len());
        self.snapshot.send_replace(Arc::new(self.opportunities.clone()));
        self.publish(&events);
        events
    }

    fn publish(&mut self, events: &[OpportunityEvent]) {
        for event in events {
            self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Log edge staleness.
    pub fn log_stats(&self) {
        let stats = self.graph.stats();
        info!(
            edges = stats.edges,
            observed = stats.observed,
            min_age_ms = stats.min_age.map(|d| d.as_millis() as u64),
            max_age_ms = stats.max_age.map(|d| d.as_millis() as u64),
            mean_age_ms = stats.mean_age.map(|d| d.as_millis() as u64),
            std_dev_ms = stats.std_dev_age.map(|d| d.as_millis() as u64),
            stalest = stats.stalest.as_deref().unwrap_or("-"),
            freshest = stats.freshest.as_deref().unwrap_or("-"),
            open = self.opportunities.len(),
            "Graph statistics"
        );
    }

    /// Poll tickers every `poll_interval` until `shutdown` flips.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            triangles = self.graph.triangles().len(),
            threshold = %self.settings.threshold,
            "Finder started (polling)"
        );
        let mut poll = interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = interval(self.settings.stats_interval);
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = poll.tick() => {
                    self.poll_once().await;
                }
                _ = stats.tick() => self.log_stats(),
            }
        }

        info!("Finder stopped");
    }

    /// Consume streamed records until the stream ends or `shutdown` flips.
    pub async fn run_stream(
        &mut self,
        mut records: mpsc::Receiver<OrderBookRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            triangles = self.graph.triangles().len(),
            threshold = %self.settings.threshold,
            "Finder started (streaming)"
        );
        let mut stats = interval(self.settings.stats_interval);
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                record = records.recv() => match record {
                    Some(record) => {
                        self.apply_record(&record).await;
                    }
                    None => {
                        warn!("Record stream ended");
                        break;
                    }
                },
                _ = stats.tick() => self.log_stats(),
            }
        }

        info!("Finder stopped");
    }
}
