use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccidentKind {
    /// A compensation exhausted its retry budget.
    RollbackError,
    /// An outbound notification exhausted its retry budget.
    SendMessageError,
}

impl AccidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccidentKind::RollbackError => "rollback_error",
            AccidentKind::SendMessageError => "send_message_error",
        }
    }
}

impl fmt::Display for AccidentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccidentKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rollback_error" => Ok(AccidentKind::RollbackError),
            "send_message_error" => Ok(AccidentKind::SendMessageError),
            _ => Err(StoreError::UnknownAccidentKind(s.to_owned())),
        }
    }
}

/// Notification lifecycle of an accident. Strictly monotonic:
/// `Init → Sending → {Success, Fail}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccidentStatus {
    Init,
    Sending,
    Success,
    Fail,
}

impl AccidentStatus {
    fn rank(&self) -> u8 {
        match self {
            AccidentStatus::Init => 0,
            AccidentStatus::Sending => 1,
            AccidentStatus::Success => 2,
            AccidentStatus::Fail => 2,
        }
    }

    pub fn can_advance_to(&self, next: AccidentStatus) -> bool {
        next.rank() == self.rank() + 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccidentStatus::Init => "init",
            AccidentStatus::Sending => "sending",
            AccidentStatus::Success => "success",
            AccidentStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for AccidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccidentStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(AccidentStatus::Init),
            "sending" => Ok(AccidentStatus::Sending),
            "success" => Ok(AccidentStatus::Success),
            "fail" => Ok(AccidentStatus::Fail),
            _ => Err(StoreError::UnknownAccidentStatus(s.to_owned())),
        }
    }
}

/// Durable record of an action that exhausted its retry budget, surfaced to
/// operators through the accident platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccidentRecord {
    /// Assigned by the store on creation.
    pub id: i64,
    pub service_name: String,
    pub instance_id: String,
    pub global_tx_id: String,
    pub local_tx_id: String,
    pub kind: AccidentKind,
    pub status: AccidentStatus,
    pub biz_info: Value,
    pub remark: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AccidentRecord {
    pub fn new(kind: AccidentKind) -> Self {
        Self {
            id: 0,
            service_name: String::default(),
            instance_id: String::default(),
            global_tx_id: String::default(),
            local_tx_id: String::default(),
            kind,
            status: AccidentStatus::Init,
            biz_info: Value::Null,
            remark: String::default(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn service_name(mut self, value: impl Into<String>) -> Self {
        self.service_name = value.into();

        self
    }

    pub fn instance_id(mut self, value: impl Into<String>) -> Self {
        self.instance_id = value.into();

        self
    }

    pub fn global_tx_id(mut self, value: impl Into<String>) -> Self {
        self.global_tx_id = value.into();

        self
    }

    pub fn local_tx_id(mut self, value: impl Into<String>) -> Self {
        self.local_tx_id = value.into();

        self
    }

    pub fn remark(mut self, value: impl Into<String>) -> Self {
        self.remark = value.into();

        self
    }

    pub fn biz_info<D: Serialize>(mut self, value: D) -> Result<Self> {
        self.biz_info = serde_json::to_value(&value)?;

        Ok(self)
    }

    /// Payload published to the accident platform.
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
