use std::sync::Arc;

use serde_json::json;
use tokio::sync::Semaphore;

use sagaflow_store::{
    AccidentKind, AccidentRecord, CompensationDescriptor, RetryPolicy, StartedPayload, Store,
    TxEvent,
};

use crate::{
    channel::CompensationChannel,
    error::{CoordinatorError, Result},
};

const DEFAULT_CONCURRENCY: usize = 4;

/// Applies the compensating statements of one local transaction, in strict
/// reverse order of how they were executed forward.
///
/// Concurrency is bounded across sagas; within one local transaction the
/// descriptors run strictly one after another, each with bounded retry. A
/// descriptor that keeps failing becomes a `RollbackError` accident and stops
/// that local transaction's rollback without blocking any other.
#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    channel: Box<dyn CompensationChannel>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new<C: CompensationChannel + 'static>(store: Store, channel: C) -> Self {
        Self {
            store,
            channel: Box::new(channel),
            retry: RetryPolicy::default(),
            permits: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
        }
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;

        self
    }

    pub fn concurrency(mut self, permits: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(permits));

        self
    }

    /// Compensates the local transaction whose `TxStarted` event this is.
    /// `TxCompensated` is appended only after every descriptor succeeded.
    pub async fn dispatch(&self, started: &TxEvent) -> Result<()> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CoordinatorError::DispatcherClosed)?;

        let payload: StartedPayload = started.to_payload()?;

        if payload.uncovered {
            tracing::warn!(
                global_tx_id = %started.global_tx_id,
                local_tx_id = %started.local_tx_id,
                "transaction ran uncovered statements, rollback will be partial"
            );
        }

        for descriptor in payload.descriptors.iter().rev() {
            if !self.apply(started, descriptor).await? {
                return Ok(());
            }
        }

        self.store.mark_compensated(started).await?;

        tracing::info!(
            global_tx_id = %started.global_tx_id,
            local_tx_id = %started.local_tx_id,
            descriptors = payload.descriptors.len(),
            "local transaction compensated"
        );

        Ok(())
    }

    /// Returns `Ok(false)` once the retry budget is spent and the accident is
    /// on record, so the caller stops walking the descriptor list.
    async fn apply(&self, started: &TxEvent, descriptor: &CompensationDescriptor) -> Result<bool> {
        let mut attempt = 0;

        loop {
            match self
                .channel
                .compensate(&started.service_name, &started.instance_id, descriptor)
                .await
            {
                Ok(()) => return Ok(true),
                Err(e) => {
                    attempt += 1;

                    if attempt >= self.retry.max_attempts {
                        self.record_accident(started, descriptor, attempt, &e.to_string())
                            .await;

                        return Ok(false);
                    }

                    tracing::warn!(
                        global_tx_id = %started.global_tx_id,
                        local_tx_id = %started.local_tx_id,
                        table = %descriptor.table,
                        attempt,
                        error = %e,
                        "compensation failed, backing off"
                    );
                    self.retry.backoff(attempt - 1).await;
                }
            }
        }
    }

    async fn record_accident(
        &self,
        started: &TxEvent,
        descriptor: &CompensationDescriptor,
        attempts: u32,
        reason: &str,
    ) {
        tracing::error!(
            global_tx_id = %started.global_tx_id,
            local_tx_id = %started.local_tx_id,
            table = %descriptor.table,
            attempts,
            "compensation exhausted retries, recording accident"
        );

        let record = AccidentRecord::new(AccidentKind::RollbackError)
            .global_tx_id(&started.global_tx_id)
            .local_tx_id(&started.local_tx_id)
            .service_name(&started.service_name)
            .instance_id(&started.instance_id)
            .remark(reason)
            .biz_info(json!({
                "table": descriptor.table,
                "kind": descriptor.kind,
                "attempts": attempts,
            }));

        let record = match record {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("accident payload unserializable: {e}");
                return;
            }
        };

        // Losing the accident record must not fail the sweep; the
        // compensation gap is still visible in the event log (no
        // TxCompensated marker).
        if let Err(e) = self.store.create_accident(record).await {
            tracing::error!("accident write failed: {e}");
        }
    }
}
