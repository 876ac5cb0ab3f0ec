use async_trait::async_trait;
use dyn_clone::DynClone;

use sagaflow_store::{Store, TxEvent};

/// Delivery channel from a participant to the coordinator's event log.
///
/// Delivery is at-least-once; the log deduplicates, so senders may retry
/// freely.
#[async_trait]
pub trait EventSender: DynClone + Send + Sync {
    async fn send(&self, event: TxEvent) -> anyhow::Result<()>;
}

dyn_clone::clone_trait_object!(EventSender);

/// In-process sender appending straight into a coordinator store. Used when
/// participant and coordinator share a process, and by tests.
#[derive(Clone)]
pub struct DirectSender {
    store: Store,
}

impl DirectSender {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSender for DirectSender {
    async fn send(&self, event: TxEvent) -> anyhow::Result<()> {
        self.store.append(event).await?;

        Ok(())
    }
}
