//! Currency graph, its edges and triangle enumeration.

pub mod currency_graph;
pub mod edge;

pub use currency_graph::{is_valid_market, split_symbol, CurrencyGraph, GraphStats, Triangle};
pub use edge::{Edge, EdgeKind, FeeApplication, FillPolicy, OrderSpec, DEFAULT_FILL_RETRIES};
