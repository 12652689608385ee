//! Unified error types for the arbitrage bot.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::graph::Edge;

/// Unified error type for the arbitrage bot.
#[derive(Error, Debug)]
pub enum BotError {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Exchange collaborator error.
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// Currency graph error.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Opportunity rotation/exploit error.
    #[error("opportunity error: {0}")]
    Opportunity(#[from] OpportunityError),

    /// Single-leg order error.
    #[error("traversal error: {0}")]
    Traversal(#[from] TraversalError),

    /// Persistence sink error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the exchange client, surfaced separately from core invariant
/// violations.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// HTTP request failed.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The exchange answered with a non-success status.
    #[error("{endpoint} failed: HTTP {status} - {body}")]
    Status {
        /// Endpoint that failed.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Failed to parse exchange data.
    #[error("failed to parse exchange data: {0}")]
    Parse(String),

    /// Market symbol is not known to the exchange.
    #[error("unknown market {0}")]
    UnknownMarket(String),

    /// Order id is not known to the exchange.
    #[error("unknown order {0}")]
    UnknownOrder(String),

    /// The exchange rejected the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Authenticated endpoint called without credentials.
    #[error("missing api credentials")]
    MissingCredentials,

    /// Request signing failed.
    #[error("signing error: {0}")]
    Signing(String),

    /// WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Failure of one leg of a cycle. Both variants carry the edge they happened on.
#[derive(Error, Debug)]
pub enum TraversalError {
    /// An exchange call for this leg failed (place, fetch status or cancel).
    #[error("{operation} failed on edge {edge}: {message}")]
    Api {
        /// Edge being traversed.
        edge: Box<Edge>,
        /// Exchange operation that failed.
        operation: &'static str,
        /// Message returned by the client.
        message: String,
    },

    /// The order was placed, never closed, and was cancelled afterwards.
    #[error("order {order_id} on edge {edge} not filled after {tries} tries")]
    FillTimeout {
        /// Edge being traversed.
        edge: Box<Edge>,
        /// Cancelled order id.
        order_id: String,
        /// Number of status polls performed.
        tries: u32,
    },
}

impl TraversalError {
    /// Edge the failure happened on.
    pub fn edge(&self) -> &Edge {
        match self {
            TraversalError::Api { edge, .. } | TraversalError::FillTimeout { edge, .. } => edge,
        }
    }
}

/// Errors raised by an opportunity.
#[derive(Error, Debug)]
pub enum OpportunityError {
    /// Rotation requested to a currency absent from the triangle.
    #[error("invalid reference unit {currency} for triangle {triangle}")]
    InvalidReferenceUnit {
        /// Requested currency.
        currency: String,
        /// Triangle id.
        triangle: String,
    },

    /// Rotation did not place the requested currency first.
    #[error("rotation of triangle {triangle} to {currency} did not work as expected")]
    RotationFailed {
        /// Requested currency.
        currency: String,
        /// Triangle id.
        triangle: String,
    },

    /// Exploit attempted before per-leg volumes were observed.
    #[error("max volume of triangle {0} is undefined")]
    UndefinedVolumeBound(String),

    /// Fallback unwind failed on a leg.
    #[error("fallback unwind failed: {0}")]
    Traversal(#[from] TraversalError),
}

/// Currency graph errors.
#[derive(Error, Debug)]
pub enum GraphError {
    /// No edge between the two currencies.
    #[error("no edge {from} -> {to}")]
    UnknownEdge {
        /// Source currency.
        from: String,
        /// Target currency.
        to: String,
    },

    /// Market symbol failed validation.
    #[error("invalid market {0}")]
    InvalidMarket(String),

    /// Non-positive price given to an edge.
    #[error("invalid price {price} for market {market}")]
    InvalidPrice {
        /// Market symbol.
        market: String,
        /// Rejected price.
        price: Decimal,
    },
}

/// Persistence sink errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, BotError>;
