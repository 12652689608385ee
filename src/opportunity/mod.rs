//! Opportunities and their persistence records.

#[allow(clippy::module_inception)]
pub mod opportunity;
pub mod record;

pub use opportunity::{ExecutionSettings, ExploitOutcome, Opportunity, DEFAULT_NEUTRAL_CURRENCIES};
pub use record::{EdgeRecord, JsonLinesStore, NullStore, OpportunityRecord, OpportunityStore};
