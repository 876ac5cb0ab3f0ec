use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr, time::Duration};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    /// Seconds a local transaction may stay incomplete before it is treated
    /// as failed.
    SlaWindow,
    /// Recent seconds excluded from the sweep to absorb event delivery lag.
    ExclusionWindow,
    /// Feature toggle for timeout-driven compensation.
    CompensationEnabled,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::SlaWindow => "sla_window",
            ConfigKind::ExclusionWindow => "exclusion_window",
            ConfigKind::CompensationEnabled => "compensation_enabled",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sla_window" => Ok(ConfigKind::SlaWindow),
            "exclusion_window" => Ok(ConfigKind::ExclusionWindow),
            "compensation_enabled" => Ok(ConfigKind::CompensationEnabled),
            _ => Err(StoreError::UnknownConfigKind(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStatus {
    Normal,
    Disabled,
}

/// Process-wide tunable, polled fresh on each use. A disabled or malformed
/// entry falls back to the caller's default; nothing is cached between polls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfigEntry {
    pub kind: ConfigKind,
    pub status: ConfigStatus,
    pub value: Value,
}

impl RuntimeConfigEntry {
    pub fn new<D: Serialize>(kind: ConfigKind, value: D) -> Result<Self> {
        Ok(Self {
            kind,
            status: ConfigStatus::Normal,
            value: serde_json::to_value(&value)?,
        })
    }

    pub fn disabled(mut self) -> Self {
        self.status = ConfigStatus::Disabled;

        self
    }

    /// Entry interpreted as a duration in seconds; `None` when disabled or
    /// not a positive integer.
    pub fn as_duration(&self) -> Option<Duration> {
        if self.status == ConfigStatus::Disabled {
            return None;
        }

        self.value.as_u64().map(Duration::from_secs)
    }

    /// Entry interpreted as a boolean toggle; `None` when disabled or not a
    /// boolean.
    pub fn as_flag(&self) -> Option<bool> {
        if self.status == ConfigStatus::Disabled {
            return None;
        }

        self.value.as_bool()
    }
}
