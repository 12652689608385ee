//! Prometheus metrics for the detection loop and order execution.
//!
//! Counters cover the opportunity lifecycle, exploit outcomes and per-leg
//! order results. Histograms track exchange round trips and fill waits.

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use tracing::debug;

// === Metric Name Constants ===

/// Ticker fetch latency metric name.
pub const METRIC_TICKER_FETCH_LATENCY: &str = "ticker_fetch_latency_ms";
/// Order book fetch latency metric name.
pub const METRIC_ORDERBOOK_FETCH_LATENCY: &str = "orderbook_fetch_latency_ms";
/// Order fill wait latency metric name.
pub const METRIC_ORDER_FILL_LATENCY: &str = "order_fill_latency_ms";
/// Detection cycle latency metric name.
pub const METRIC_DETECTION_CYCLE_LATENCY: &str = "detection_cycle_latency_ms";
/// Opportunities added counter metric name.
pub const METRIC_OPPORTUNITIES_ADDED: &str = "opportunities_added_total";
/// Opportunities updated counter metric name.
pub const METRIC_OPPORTUNITIES_UPDATED: &str = "opportunities_updated_total";
/// Opportunities closed counter metric name.
pub const METRIC_OPPORTUNITIES_CLOSED: &str = "opportunities_closed_total";
/// Exploit attempts counter metric name, labelled by outcome.
pub const METRIC_EXPLOITS: &str = "exploits_total";
/// Orders placed counter metric name, labelled by edge kind.
pub const METRIC_ORDERS_PLACED: &str = "orders_placed_total";
/// Orders filled counter metric name.
pub const METRIC_ORDERS_FILLED: &str = "orders_filled_total";
/// Fill timeouts counter metric name.
pub const METRIC_ORDER_TIMEOUTS: &str = "order_timeouts_total";
/// Failed order calls counter metric name, labelled by operation.
pub const METRIC_ORDERS_FAILED: &str = "orders_failed_total";
/// Ticker fetch failures counter metric name.
pub const METRIC_TICKER_FETCH_FAILURES: &str = "ticker_fetch_failures_total";
/// Stream records received counter metric name.
pub const METRIC_STREAM_RECORDS: &str = "stream_records_total";
/// WebSocket reconnects counter metric name.
pub const METRIC_WS_RECONNECTS: &str = "ws_reconnects_total";
/// Open opportunities gauge metric name.
pub const METRIC_OPEN_OPPORTUNITIES: &str = "open_opportunities";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    describe_histogram!(METRIC_TICKER_FETCH_LATENCY, "Ticker fetch latency in milliseconds");
    describe_histogram!(
        METRIC_ORDERBOOK_FETCH_LATENCY,
        "Order book fetch latency in milliseconds"
    );
    describe_histogram!(
        METRIC_ORDER_FILL_LATENCY,
        "Time from order placement to fill in milliseconds"
    );
    describe_histogram!(
        METRIC_DETECTION_CYCLE_LATENCY,
        "Duration of one detection cycle in milliseconds"
    );

    describe_counter!(METRIC_OPPORTUNITIES_ADDED, "Opportunities that crossed the threshold");
    describe_counter!(METRIC_OPPORTUNITIES_UPDATED, "Open opportunities whose arbitrage changed");
    describe_counter!(METRIC_OPPORTUNITIES_CLOSED, "Opportunities that disappeared");
    describe_counter!(METRIC_EXPLOITS, "Exploit attempts by outcome");
    describe_counter!(METRIC_ORDERS_PLACED, "Orders placed by edge kind");
    describe_counter!(METRIC_ORDERS_FILLED, "Orders that reached the closed status");
    describe_counter!(METRIC_ORDER_TIMEOUTS, "Orders cancelled after the fill wait ran out");
    describe_counter!(METRIC_ORDERS_FAILED, "Order calls that failed, by operation");
    describe_counter!(METRIC_TICKER_FETCH_FAILURES, "Detection cycles skipped on ticker errors");
    describe_counter!(METRIC_STREAM_RECORDS, "Top-of-book records received from the stream");
    describe_counter!(METRIC_WS_RECONNECTS, "Total number of WebSocket reconnections");

    describe_gauge!(METRIC_OPEN_OPPORTUNITIES, "Currently open opportunities");

    debug!("Metrics initialized");
}

/// Record order book fetch latency.
pub fn record_orderbook_fetch_latency(start: Instant, symbol: &str) {
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_ORDERBOOK_FETCH_LATENCY, "symbol" => symbol.to_string()).record(latency_ms);
}

/// Increment opportunities added counter.
pub fn inc_opportunities_added() {
    counter!(METRIC_OPPORTUNITIES_ADDED).increment(1);
}

/// Increment opportunities updated counter.
pub fn inc_opportunities_updated() {
    counter!(METRIC_OPPORTUNITIES_UPDATED).increment(1);
}

/// Increment opportunities closed counter.
pub fn inc_opportunities_closed() {
    counter!(METRIC_OPPORTUNITIES_CLOSED).increment(1);
}

/// Increment exploit counter for the given outcome.
pub fn inc_exploits(outcome: &'static str) {
    counter!(METRIC_EXPLOITS, "outcome" => outcome).increment(1);
}

/// Increment orders placed counter.
pub fn inc_orders_placed(kind: &'static str) {
    counter!(METRIC_ORDERS_PLACED, "kind" => kind).increment(1);
}

/// Increment orders filled counter.
pub fn inc_orders_filled() {
    counter!(METRIC_ORDERS_FILLED).increment(1);
}

/// Increment fill timeout counter.
pub fn inc_order_timeouts() {
    counter!(METRIC_ORDER_TIMEOUTS).increment(1);
}

/// Increment failed order call counter.
pub fn inc_orders_failed(operation: &'static str) {
    counter!(METRIC_ORDERS_FAILED, "operation" => operation).increment(1);
}

/// Increment ticker fetch failure counter.
pub fn inc_ticker_fetch_failures() {
    counter!(METRIC_TICKER_FETCH_FAILURES).increment(1);
}

/// Increment stream records counter.
pub fn inc_stream_records() {
    counter!(METRIC_STREAM_RECORDS).increment(1);
}

/// Increment WebSocket reconnects counter.
pub fn inc_ws_reconnects() {
    counter!(METRIC_WS_RECONNECTS).increment(1);
}

/// Set the open opportunities gauge.
pub fn set_open_opportunities(count: usize) {
    gauge!(METRIC_OPEN_OPPORTUNITIES).set(count as f64);
}

/// RAII guard for timing operations.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for the given metric.
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(self.metric_name).record(self.elapsed_ms());
    }
}

/// Create a latency timer for ticker fetches.
pub fn timer_ticker_fetch() -> LatencyTimer {
    LatencyTimer::new(METRIC_TICKER_FETCH_LATENCY)
}

/// Create a latency timer for order fill waits.
pub fn timer_order_fill() -> LatencyTimer {
    LatencyTimer::new(METRIC_ORDER_FILL_LATENCY)
}

/// Create a latency timer for one detection cycle.
pub fn timer_detection_cycle() -> LatencyTimer {
    LatencyTimer::new(METRIC_DETECTION_CYCLE_LATENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn latency_timer_measures_time() {
        let timer = timer_order_fill();
        sleep(Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 9.0);
    }

    #[test]
    fn helpers_do_not_panic_without_recorder() {
        init_metrics();
        inc_exploits("completed");
        inc_orders_placed("direct");
        set_open_opportunities(3);
    }
}
