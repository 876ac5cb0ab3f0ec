use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Column name to value snapshot of one row. Ordered so that rendered
/// statements and bound parameters are deterministic.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
}

/// Everything needed to undo one forward statement, synthesized by the
/// participant before (update/delete) or right after (insert) the forward
/// statement ran. Owned by the `TxStarted` event that carries it and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationDescriptor {
    /// Kind of the *forward* statement this descriptor reverses.
    pub kind: StatementKind,
    pub table: String,
    /// Column to value pairs identifying the affected row(s).
    pub key_predicate: Row,
    /// Snapshot required to reverse an update or delete; empty for inserts.
    pub before_image: Vec<Row>,
    /// Compensating statement with `?` placeholders.
    pub template: String,
    /// Bound parameters for `template`, in placeholder order.
    pub params: Vec<Value>,
}

/// Payload carried by a `TxStarted` event: the full compensation buffer in
/// forward execution order. The dispatcher applies it in reverse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartedPayload {
    pub descriptors: Vec<CompensationDescriptor>,
    /// True when at least one statement of the local transaction could not be
    /// analyzed and therefore runs without compensation coverage.
    #[serde(default)]
    pub uncovered: bool,
}
