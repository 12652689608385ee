//! Single-exchange triangular arbitrage.
//!
//! Every market `BASE/QUOTE` becomes two edges of a currency graph: a
//! direct edge `BASE -> QUOTE` priced at the best bid and an inverse edge
//! `QUOTE -> BASE` priced at one over the best ask. A triangle `A -> B -> C -> A`
//! is an opportunity when the product of its edge prices, net of fees,
//! exceeds a threshold:
//!
//! ```text
//! BTC -> ETH   1 / 0.05   = 20
//! ETH -> USD   1100
//! USD -> BTC   1 / 20000  = 0.00005
//! ─────────────────────────────────
//! arbitrage    20 * 1100 * 0.00005 = 1.1
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`exchange`]: Exchange trait, REST client, cache, stream and mock
//! - [`graph`]: Edges, the currency graph and triangle enumeration
//! - [`opportunity`]: Opportunities, exploit protocol and persistence records
//! - [`finder`]: Detection loop and lifecycle events
//! - [`engine`]: Balance and the exploit gate
//! - [`api`]: HTTP API for health/status/metrics
//! - [`metrics`]: Metrics names and helpers
//! - [`signing`]: Authenticated request signing

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod finder;
pub mod graph;
pub mod metrics;
pub mod opportunity;
pub mod signing;

pub use config::Config;
pub use error::{BotError, Result};
