use async_trait::async_trait;
use dyn_clone::DynClone;
use serde_json::Value;

use sagaflow_store::Row;

use crate::error::Result;

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

/// Capability over the participant's own data store. The interceptor routes
/// every statement of the guarded transaction through one executor so that
/// before-image reads are transactionally consistent with the mutation they
/// compensate. The same capability later executes compensating statements on
/// demand for the coordinator.
///
/// Statements use `?` placeholders; `params` binds them in order.
#[async_trait]
pub trait SqlExecutor: DynClone + Send + Sync {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Generated key produced by the most recent insert into `table` within
    /// this executor's transaction, when the dialect can report one.
    async fn last_insert_id(&self, table: &str) -> Result<Option<Value>>;

    /// Primary key column of `table`, when known.
    async fn primary_key(&self, table: &str) -> Result<Option<String>>;
}

dyn_clone::clone_trait_object!(SqlExecutor);
