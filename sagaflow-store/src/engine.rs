use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;

use crate::{
    accident::{AccidentRecord, AccidentStatus},
    config::{ConfigKind, RuntimeConfigEntry},
    error::Result,
    event::TxEvent,
};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

/// Narrow repository surface over the three coordinator-owned tables:
/// lifecycle events, accidents and runtime config.
///
/// Cross-replica coordination relies on two conditional writes only:
/// `append` (unique on the event dedup key) and `claim_accident`
/// (status compare-and-set). Neither takes a distributed lock; at most one
/// replica's write wins per record.
#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    /// Appends one lifecycle event. A duplicate
    /// `(global_tx_id, local_tx_id, event_type)` is dropped idempotently:
    /// `Ok(false)`, no error, no row.
    async fn append(&self, event: TxEvent) -> Result<bool>;

    /// Every `TxStarted` older than `older_than` with no terminal event for
    /// the same `(global_tx_id, local_tx_id)`, oldest first.
    async fn query_incomplete(&self, older_than: DateTime<Utc>) -> Result<Vec<TxEvent>>;

    /// All events belonging to one saga, in append order.
    async fn query_global(&self, global_tx_id: &str) -> Result<Vec<TxEvent>>;

    /// Distinct global transaction ids with participant events but no
    /// `SagaEnded` marker yet.
    async fn query_unconfirmed_globals(&self) -> Result<Vec<String>>;

    /// Persists a new accident and returns it with its assigned id.
    async fn create_accident(&self, record: AccidentRecord) -> Result<AccidentRecord>;

    /// Conditional `Init → Sending` transition. `Ok(false)` when another
    /// replica already claimed the record.
    async fn claim_accident(&self, id: i64) -> Result<bool>;

    /// Terminal transition out of `Sending`; sets `completed_at`.
    async fn complete_accident(&self, id: i64, status: AccidentStatus) -> Result<()>;

    async fn list_accidents(&self, status: Option<AccidentStatus>) -> Result<Vec<AccidentRecord>>;

    async fn get_config(&self, kind: ConfigKind) -> Result<Option<RuntimeConfigEntry>>;

    async fn set_config(&self, entry: RuntimeConfigEntry) -> Result<()>;
}

dyn_clone::clone_trait_object!(Engine);
