use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Lifecycle transitions of a local transaction within a saga.
///
/// `TxStarted`, `TxEnded` and `TxAborted` are emitted by participants.
/// The remaining types are coordinator-side markers: they live in the same
/// append-only log so that every state decision is derivable from events
/// alone, with no separately mutated status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TxStarted,
    TxEnded,
    TxAborted,
    /// Scanner decided to compensate this local transaction. Appending this
    /// marker is the cross-replica race decider: only one append wins.
    CompensationTriggered,
    /// Dispatcher finished applying every compensating statement.
    TxCompensated,
    /// Every local transaction of the saga settled; keyed by
    /// `local_tx_id == global_tx_id`.
    SagaEnded,
}

impl EventType {
    /// Terminal for a `(global_tx_id, local_tx_id)` pair: once present, the
    /// local transaction is no longer a timeout candidate.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::TxEnded
                | EventType::TxAborted
                | EventType::CompensationTriggered
                | EventType::TxCompensated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TxStarted => "tx_started",
            EventType::TxEnded => "tx_ended",
            EventType::TxAborted => "tx_aborted",
            EventType::CompensationTriggered => "compensation_triggered",
            EventType::TxCompensated => "tx_compensated",
            EventType::SagaEnded => "saga_ended",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tx_started" => Ok(EventType::TxStarted),
            "tx_ended" => Ok(EventType::TxEnded),
            "tx_aborted" => Ok(EventType::TxAborted),
            "compensation_triggered" => Ok(EventType::CompensationTriggered),
            "tx_compensated" => Ok(EventType::TxCompensated),
            "saga_ended" => Ok(EventType::SagaEnded),
            _ => Err(StoreError::UnknownEventType(s.to_owned())),
        }
    }
}

/// One record per lifecycle transition, immutable once written.
///
/// The log deduplicates on `(global_tx_id, local_tx_id, event_type)` so
/// at-least-once delivery from participants is safe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxEvent {
    pub id: Uuid,
    pub global_tx_id: String,
    pub local_tx_id: String,
    pub service_name: String,
    pub instance_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl TxEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            ..Self::default()
        }
    }

    pub fn global_tx_id(mut self, value: impl Into<String>) -> Self {
        self.global_tx_id = value.into();

        self
    }

    pub fn local_tx_id(mut self, value: impl Into<String>) -> Self {
        self.local_tx_id = value.into();

        self
    }

    pub fn service_name(mut self, value: impl Into<String>) -> Self {
        self.service_name = value.into();

        self
    }

    pub fn instance_id(mut self, value: impl Into<String>) -> Self {
        self.instance_id = value.into();

        self
    }

    pub fn created_at(mut self, value: DateTime<Utc>) -> Self {
        self.created_at = value;

        self
    }

    pub fn payload<D: Serialize>(mut self, value: D) -> Result<Self> {
        self.payload = serde_json::to_value(&value)?;

        Ok(self)
    }

    pub fn to_payload<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn dedup_key(&self) -> (&str, &str, EventType) {
        (&self.global_tx_id, &self.local_tx_id, self.event_type)
    }
}

impl Default for TxEvent {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            global_tx_id: String::default(),
            local_tx_id: String::default(),
            service_name: String::default(),
            instance_id: String::default(),
            event_type: EventType::TxStarted,
            payload: Value::Null,
            created_at: Utc::now(),
        }
    }
}
