use std::time::Duration;

use sagaflow_store::{ConfigKind, Store};

pub const DEFAULT_SLA_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_EXCLUSION_WINDOW: Duration = Duration::from_secs(10);

/// Runtime knobs of one sweep, re-polled at the top of every sweep so an
/// operator change takes effect without a restart.
///
/// A missing, disabled or malformed entry falls back to its default; a store
/// read failure does too, after a warning. Polling must never stop a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// How long a local transaction may stay open before it counts as timed
    /// out.
    pub sla_window: Duration,
    /// Grace slack on top of the SLA, covering clock skew and in-flight
    /// `TxEnded` deliveries.
    pub exclusion_window: Duration,
    /// Kill switch: when off, the scanner observes but never triggers.
    pub compensation_enabled: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sla_window: DEFAULT_SLA_WINDOW,
            exclusion_window: DEFAULT_EXCLUSION_WINDOW,
            compensation_enabled: true,
        }
    }
}

impl SweepConfig {
    pub async fn poll(store: &Store) -> Self {
        let defaults = Self::default();

        Self {
            sla_window: fetch_duration(store, ConfigKind::SlaWindow)
                .await
                .unwrap_or(defaults.sla_window),
            exclusion_window: fetch_duration(store, ConfigKind::ExclusionWindow)
                .await
                .unwrap_or(defaults.exclusion_window),
            compensation_enabled: fetch_flag(store, ConfigKind::CompensationEnabled)
                .await
                .unwrap_or(defaults.compensation_enabled),
        }
    }

    /// Age beyond which an open local transaction becomes a compensation
    /// candidate.
    pub fn cutoff_age(&self) -> Duration {
        self.sla_window + self.exclusion_window
    }
}

async fn fetch_duration(store: &Store, kind: ConfigKind) -> Option<Duration> {
    match store.config(kind).await {
        Ok(entry) => entry.and_then(|e| e.as_duration()),
        Err(e) => {
            tracing::warn!("config read for {kind} failed, using default: {e}");

            None
        }
    }
}

async fn fetch_flag(store: &Store, kind: ConfigKind) -> Option<bool> {
    match store.config(kind).await {
        Ok(entry) => entry.and_then(|e| e.as_flag()),
        Err(e) => {
            tracing::warn!("config read for {kind} failed, using default: {e}");

            None
        }
    }
}
