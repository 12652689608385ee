//! Directed currency graph and triangle enumeration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::edge::Edge;
use crate::error::GraphError;
use crate::exchange::{BookSide, Currency, Market, OrderBookRecord, Ticker};

static MARKET_SYMBOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z0-9]{2,10})/([A-Z0-9]{2,10})$").expect("valid regex"));

/// Split a `BASE/QUOTE` symbol. `None` if it does not match the pattern.
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let caps = MARKET_SYMBOL.captures(symbol)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

/// Whether a market can be turned into edges.
pub fn is_valid_market(market: &Market) -> bool {
    split_symbol(&market.symbol).is_some()
        && market.symbol == format!("{}/{}", market.base, market.quote)
}

/// Three currencies in cycle order. Edge `i` goes from `nodes[i]` to
/// `nodes[(i + 1) % 3]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Triangle {
    nodes: [Currency; 3],
}

impl Triangle {
    /// Create a triangle from currencies in cycle order.
    pub fn new(a: impl Into<Currency>, b: impl Into<Currency>, c: impl Into<Currency>) -> Self {
        Self {
            nodes: [a.into(), b.into(), c.into()],
        }
    }

    /// Currencies in cycle order.
    pub fn nodes(&self) -> &[Currency; 3] {
        &self.nodes
    }

    /// Rotation-invariant identity: the sorted concatenation of the currencies.
    pub fn id(&self) -> String {
        let mut sorted = self.nodes.clone();
        sorted.sort();
        sorted.concat()
    }

    /// `(source, target)` of each leg.
    pub fn legs(&self) -> [(&str, &str); 3] {
        [
            (&self.nodes[0], &self.nodes[1]),
            (&self.nodes[1], &self.nodes[2]),
            (&self.nodes[2], &self.nodes[0]),
        ]
    }
}

impl fmt::Display for Triangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} -> {}", self.nodes[0], self.nodes[1], self.nodes[2])
    }
}

/// Edge staleness summary.
#[derive(Debug, Clone, Default)]
pub struct GraphStats {
    /// Total edges.
    pub edges: usize,
    /// Edges refreshed at least once.
    pub observed: usize,
    /// Age of the freshest edge.
    pub min_age: Option<Duration>,
    /// Age of the stalest edge.
    pub max_age: Option<Duration>,
    /// Mean age.
    pub mean_age: Option<Duration>,
    /// Standard deviation of ages.
    pub std_dev_age: Option<Duration>,
    /// Freshest edge.
    pub freshest: Option<String>,
    /// Stalest edge.
    pub stalest: Option<String>,
}

/// Directed graph of currencies. Each valid market contributes a Direct and
/// an Inverse edge.
#[derive(Debug, Clone, Default)]
pub struct CurrencyGraph {
    exchange: String,
    nodes: BTreeMap<Currency, BTreeMap<Currency, Edge>>,
    triangles: Vec<Triangle>,
}

impl CurrencyGraph {
    /// Build the graph from market metadata and enumerate its triangles.
    pub fn new(exchange: &str, markets: &[Market]) -> Self {
        let mut graph = Self {
            exchange: exchange.to_string(),
            ..Default::default()
        };

        for market in markets {
            if !is_valid_market(market) {
                warn!(market = %market.symbol, "Skipping invalid market");
                continue;
            }

            let direct = Edge::direct(&market.base, &market.quote, market.taker_fee, market.min_amount)
                .with_precisions(market.amount_precision, market.price_precision);
            let inverse = Edge::inverse(&market.base, &market.quote, market.taker_fee, Decimal::ZERO)
                .with_precisions(market.price_precision, market.amount_precision);
            graph.insert(direct);
            graph.insert(inverse);
        }

        graph.refresh_triangles();
        info!(
            exchange = %graph.exchange,
            currencies = graph.nodes.len(),
            edges = graph.edge_count(),
            triangles = graph.triangles.len(),
            "Currency graph built"
        );
        graph
    }

    fn insert(&mut self, edge: Edge) {
        self.nodes.entry(edge.target.clone()).or_default();
        self.nodes
            .entry(edge.source.clone())
            .or_default()
            .insert(edge.target.clone(), edge);
    }

    /// Exchange name.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// All currencies, sorted.
    pub fn currencies(&self) -> impl Iterator<Item = &Currency> {
        self.nodes.keys()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(BTreeMap::len).sum()
    }

    /// All edges.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.nodes.values().flat_map(BTreeMap::values)
    }

    /// Edge `from -> to`, if any.
    pub fn edge(&self, from: &str, to: &str) -> Option<&Edge> {
        self.nodes.get(from)?.get(to)
    }

    fn edge_mut(&mut self, from: &str, to: &str) -> Result<&mut Edge, GraphError> {
        self.nodes
            .get_mut(from)
            .and_then(|out| out.get_mut(to))
            .ok_or_else(|| GraphError::UnknownEdge {
                from: from.to_string(),
                to: to.to_string(),
            })
    }

    /// Apply polled tickers. Direct edges take the bid, Inverse edges the
    /// ask. Returns the number of markets updated.
    pub fn update(&mut self, tickers: &HashMap<String, Ticker>) -> usize {
        let mut updated = 0;

        for (symbol, ticker) in tickers {
            if ticker.bid.is_zero() || ticker.ask.is_zero() {
                continue;
            }
            let Some((base, quote)) = split_symbol(symbol) else {
                continue;
            };
            if self.edge(base, quote).is_none() {
                continue;
            }

            match self.apply_ticker(base, quote, ticker) {
                Ok(()) => updated += 1,
                Err(e) => warn!(market = %symbol, error = %e, "Ticker rejected"),
            }
        }

        debug!(updated, "Graph updated from tickers");
        updated
    }

    fn apply_ticker(&mut self, base: &str, quote: &str, ticker: &Ticker) -> Result<(), GraphError> {
        let direct = self.edge_mut(base, quote)?;
        direct.set_real_price(ticker.bid)?;
        let direct_min = direct.min_volume;

        let inverse = self.edge_mut(quote, base)?;
        inverse.set_real_price(ticker.ask)?;
        if inverse.min_volume.is_zero() {
            inverse.min_volume = direct_min * ticker.ask;
        }
        Ok(())
    }

    /// Apply one top-of-book change. Returns `true` if the edge's price or
    /// volume changed.
    pub fn update_from_order_book_record(&mut self, record: &OrderBookRecord) -> Result<bool, GraphError> {
        let (base, quote) =
            split_symbol(&record.symbol).ok_or_else(|| GraphError::InvalidMarket(record.symbol.clone()))?;

        match record.side {
            BookSide::Bid => self.edge_mut(base, quote)?.update_from_record(record),
            BookSide::Ask => {
                let direct_min = self.edge_mut(base, quote)?.min_volume;
                let inverse = self.edge_mut(quote, base)?;
                let changed = inverse.update_from_record(record)?;
                if inverse.min_volume.is_zero() {
                    inverse.min_volume = direct_min * record.price;
                }
                Ok(changed)
            }
        }
    }

    /// Cached triangles.
    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    /// Triangles whose three edges all carry observed price and volume.
    pub fn observed_triangles(&self) -> Vec<&Triangle> {
        self.triangles
            .iter()
            .filter(|t| {
                t.legs().iter().all(|(from, to)| {
                    self.edge(from, to)
                        .map(|e| !e.has_empty_values())
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    /// Current copies of a triangle's edges.
    pub fn edges_of(&self, triangle: &Triangle) -> Result<[Edge; 3], GraphError> {
        let [a, b, c] = triangle.legs();
        let get = |(from, to): (&str, &str)| {
            self.edge(from, to).cloned().ok_or_else(|| GraphError::UnknownEdge {
                from: from.to_string(),
                to: to.to_string(),
            })
        };
        Ok([get(a)?, get(b)?, get(c)?])
    }

    /// Re-enumerate triangles. Each set of three mutually connected
    /// currencies is kept once, in the first orientation found walking nodes
    /// in sorted order.
    pub fn refresh_triangles(&mut self) {
        let mut seen = HashSet::new();
        let mut triangles = Vec::new();

        for (n1, out1) in &self.nodes {
            for n2 in out1.keys() {
                let Some(out2) = self.nodes.get(n2) else {
                    continue;
                };
                for n3 in out2.keys() {
                    if n3 == n1 || self.edge(n3, n1).is_none() {
                        continue;
                    }

                    let triangle = Triangle::new(n1.clone(), n2.clone(), n3.clone());
                    if seen.insert(triangle.id()) {
                        triangles.push(triangle);
                    }
                }
            }
        }

        self.triangles = triangles;
    }

    /// Markets whose two currencies each trade against more than one other
    /// currency, i.e. markets that can be part of some triangle.
    pub fn relevant_markets(markets: &[Market]) -> Vec<Market> {
        let mut neighbours: HashMap<&str, HashSet<&str>> = HashMap::new();
        for market in markets.iter().filter(|m| is_valid_market(m)) {
            neighbours.entry(&market.base).or_default().insert(&market.quote);
            neighbours.entry(&market.quote).or_default().insert(&market.base);
        }

        let degree = |c: &str| neighbours.get(c).map(HashSet::len).unwrap_or(0);
        markets
            .iter()
            .filter(|m| is_valid_market(m) && degree(&m.base) > 1 && degree(&m.quote) > 1)
            .cloned()
            .collect()
    }

    /// Staleness of observed edges.
    pub fn stats(&self) -> GraphStats {
        let ages: Vec<(String, Duration)> = self
            .edges()
            .filter_map(|e| e.age().map(|age| (e.to_string(), age)))
            .collect();

        let mut stats = GraphStats {
            edges: self.edge_count(),
            observed: ages.len(),
            ..Default::default()
        };
        if ages.is_empty() {
            return stats;
        }

        let secs: Vec<f64> = ages.iter().map(|(_, age)| age.as_secs_f64()).collect();
        let mean = secs.iter().sum::<f64>() / secs.len() as f64;
        let variance = secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / secs.len() as f64;

        let freshest = ages.iter().min_by_key(|(_, age)| *age);
        let stalest = ages.iter().max_by_key(|(_, age)| *age);

        stats.min_age = freshest.map(|(_, age)| *age);
        stats.max_age = stalest.map(|(_, age)| *age);
        stats.freshest = freshest.map(|(edge, _)| edge.clone());
        stats.stalest = stalest.map(|(edge, _)| edge.clone());
        stats.mean_age = Some(Duration::from_secs_f64(mean));
        stats.std_dev_age = Some(Duration::from_secs_f64(variance.sqrt()));
        stats
    }
}
