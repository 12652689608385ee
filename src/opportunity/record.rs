//! Persistence records for closed opportunities and traversed edges.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::exchange::OrderStatus;
use crate::graph::EdgeKind;

/// One edge of a saved opportunity, or one leg of an executed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Opportunity the edge belongs to.
    pub opportunity_id: String,
    /// Source currency.
    pub source: String,
    /// Target currency.
    pub target: String,
    /// Direct or inverse.
    pub kind: EdgeKind,
    /// Price in the edge's own orientation.
    pub price: Decimal,
    /// Fee fraction.
    pub fee: Decimal,
    /// Top-of-book volume in source units, if observed.
    pub volume: Option<Decimal>,
    /// Milliseconds since the edge was last refreshed.
    pub last_update_age_ms: Option<u64>,
    /// Order placed on this edge, if any.
    pub order_id: Option<String>,
    /// Final status of that order.
    pub order_status: Option<OrderStatus>,
}

/// A closed opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    /// Opportunity id.
    pub id: String,
    /// Exchange name.
    pub exchange: String,
    /// Arbitrage ratio when last seen.
    pub arbitrage: Decimal,
    /// The three currencies in cycle order.
    pub cycle: Vec<String>,
    /// Minimum trade volume in the reference currency.
    pub min_volume: Decimal,
    /// Maximum trade volume in the reference currency, `None` when undefined.
    pub max_volume: Option<Decimal>,
    /// RFC 3339 time of first detection.
    pub created_at: String,
    /// RFC 3339 time the opportunity closed.
    pub closed_at: Option<String>,
    /// Open duration in milliseconds.
    pub duration_ms: u64,
    /// Per-edge details.
    pub edges: Vec<EdgeRecord>,
}

/// Format a timestamp as RFC 3339, falling back to the unix timestamp.
pub fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Sink for closed opportunities.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Persist one record.
    async fn save(&self, record: &OpportunityRecord) -> Result<(), StoreError>;
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesStore {
    /// Create a store writing to `path`. The file is created on first save.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Target file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OpportunityStore for JsonLinesStore {
    async fn save(&self, record: &OpportunityRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(opportunity = %record.id, path = %self.path.display(), "Opportunity saved");
        Ok(())
    }
}

/// Logs and discards records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl OpportunityStore for NullStore {
    async fn save(&self, record: &OpportunityRecord) -> Result<(), StoreError> {
        info!(
            opportunity = %record.id,
            arbitrage = %record.arbitrage,
            duration_ms = record.duration_ms,
            "Opportunity closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn record(id: &str) -> OpportunityRecord {
        OpportunityRecord {
            id: id.to_string(),
            exchange: "mock".to_string(),
            arbitrage: dec!(1.002),
            cycle: vec!["BTC".into(), "USD".into(), "ETH".into()],
            min_volume: dec!(0.001),
            max_volume: None,
            created_at: rfc3339(OffsetDateTime::UNIX_EPOCH),
            closed_at: None,
            duration_ms: 1500,
            edges: Vec::new(),
        }
    }

    #[tokio::test]
    async fn json_lines_store_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::new(dir.path().join("closed.jsonl"));

        store.save(&record("BTCETHUSD")).await.unwrap();
        store.save(&record("BTCETHEUR")).await.unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: OpportunityRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, record("BTCETHUSD"));
    }

    #[test]
    fn rfc3339_formats_epoch() {
        assert_eq!(rfc3339(OffsetDateTime::UNIX_EPOCH), "1970-01-01T00:00:00Z");
    }
}
