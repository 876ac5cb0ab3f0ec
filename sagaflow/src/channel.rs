use async_trait::async_trait;
use dyn_clone::DynClone;
use serde_json::Value;

use sagaflow_store::CompensationDescriptor;

/// Outbound path from the coordinator back to a participant instance:
/// "run this compensating statement against your data store".
///
/// Errors are treated as transient and retried by the dispatcher; an
/// implementation signalling a permanently lost participant should keep
/// failing until the retry budget turns it into an accident.
#[async_trait]
pub trait CompensationChannel: DynClone + Send + Sync {
    async fn compensate(
        &self,
        service_name: &str,
        instance_id: &str,
        descriptor: &CompensationDescriptor,
    ) -> anyhow::Result<()>;
}

dyn_clone::clone_trait_object!(CompensationChannel);

pub const TOPIC_SAGA_ENDED: &str = "saga_ended";
pub const TOPIC_ACCIDENT: &str = "accident";

/// One-way publish towards downstream consumers (archival, alerting, the
/// accident platform). Delivery order matters per topic.
#[async_trait]
pub trait NotificationChannel: DynClone + Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()>;
}

dyn_clone::clone_trait_object!(NotificationChannel);
