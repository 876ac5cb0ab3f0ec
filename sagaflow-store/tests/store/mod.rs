use chrono::{Duration, Utc};
use sagaflow_store::{
    AccidentKind, AccidentRecord, AccidentStatus, ConfigKind, EventType, RuntimeConfigEntry, Store,
    StoreError, TxEvent, TxStatus,
};
use serde_json::json;
use uuid::Uuid;

pub fn started(global_tx_id: &str, local_tx_id: &str) -> TxEvent {
    TxEvent::new(EventType::TxStarted)
        .global_tx_id(global_tx_id)
        .local_tx_id(local_tx_id)
        .service_name("payments")
        .instance_id("payments-1")
}

pub fn ended(global_tx_id: &str, local_tx_id: &str) -> TxEvent {
    TxEvent::new(EventType::TxEnded)
        .global_tx_id(global_tx_id)
        .local_tx_id(local_tx_id)
        .service_name("payments")
        .instance_id("payments-1")
}

fn aborted(global_tx_id: &str, local_tx_id: &str) -> TxEvent {
    TxEvent::new(EventType::TxAborted)
        .global_tx_id(global_tx_id)
        .local_tx_id(local_tx_id)
        .service_name("payments")
        .instance_id("payments-1")
}

pub async fn test_append_idempotent(store: &Store) -> anyhow::Result<()> {
    let global = Uuid::new_v4().to_string();

    assert!(store.append(started(&global, "l1")).await?);

    // Redelivery carries a fresh event id but the same dedup key.
    assert!(!store.append(started(&global, "l1")).await?);
    assert!(store.append(ended(&global, "l1")).await?);

    let status = store.global_status(&global).await?;
    assert_eq!(status.locals.len(), 1);
    assert_eq!(status.locals[0].status, TxStatus::Ended);

    Ok(())
}

pub async fn test_query_incomplete(store: &Store) -> anyhow::Result<()> {
    let global = Uuid::new_v4().to_string();
    let stale = Utc::now() - Duration::seconds(120);

    // Timed out and still open.
    store
        .append(started(&global, "open").created_at(stale))
        .await?;

    // Timed out but finished.
    store
        .append(started(&global, "done").created_at(stale))
        .await?;
    store.append(ended(&global, "done")).await?;

    // Timed out but already picked up by a previous sweep.
    let picked = started(&global, "picked").created_at(stale);
    store.append(picked.clone()).await?;
    store.trigger_compensation(&picked).await?;

    // Still inside the window.
    store.append(started(&global, "fresh")).await?;

    let cutoff = Utc::now() - Duration::seconds(70);
    let incomplete = store.query_incomplete(cutoff).await?;

    let candidates = incomplete
        .iter()
        .filter(|e| e.global_tx_id == global)
        .collect::<Vec<_>>();

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].local_tx_id, "open");

    Ok(())
}

pub async fn test_trigger_decides_race(store: &Store) -> anyhow::Result<()> {
    let global = Uuid::new_v4().to_string();
    let event = started(&global, "l1").created_at(Utc::now() - Duration::seconds(120));

    store.append(event.clone()).await?;

    // Two replicas sweep the same candidate; the conditional append lets
    // exactly one of them dispatch.
    let (a, b) = tokio::join!(
        store.trigger_compensation(&event),
        store.trigger_compensation(&event)
    );

    assert!(a? ^ b?);

    let status = store.global_status(&global).await?;
    assert_eq!(status.locals[0].status, TxStatus::CompensationTriggered);

    Ok(())
}

pub async fn test_global_status_fold(store: &Store) -> anyhow::Result<()> {
    let global = Uuid::new_v4().to_string();

    store.append(started(&global, "l1")).await?;
    store.append(ended(&global, "l1")).await?;
    store.append(started(&global, "l2")).await?;
    store.append(aborted(&global, "l2")).await?;

    let status = store.global_status(&global).await?;
    assert!(status.any_aborted());
    assert!(status.all_settled());
    assert!(!status.confirmed);

    // Roll the ended sibling back.
    let l1 = status
        .locals
        .iter()
        .find(|l| l.local_tx_id == "l1")
        .and_then(|l| l.started.clone())
        .expect("l1 kept its started event");

    assert!(store.trigger_compensation(&l1).await?);
    assert!(!store.global_status(&global).await?.all_settled());

    // A late TxEnded never demotes a triggered transaction.
    store.append(ended(&global, "l1")).await?;
    let status = store.global_status(&global).await?;
    assert_eq!(
        status.locals.iter().find(|l| l.local_tx_id == "l1").unwrap().status,
        TxStatus::CompensationTriggered
    );

    store.mark_compensated(&l1).await?;
    let status = store.global_status(&global).await?;
    assert!(status.all_settled());

    assert!(store.unconfirmed_globals().await?.contains(&global));
    assert!(store.confirm_saga(&global).await?);
    assert!(!store.confirm_saga(&global).await?);
    assert!(store.global_status(&global).await?.confirmed);
    assert!(!store.unconfirmed_globals().await?.contains(&global));

    Ok(())
}

pub async fn test_accident_lifecycle(store: &Store) -> anyhow::Result<()> {
    let global = Uuid::new_v4().to_string();

    let record = AccidentRecord::new(AccidentKind::RollbackError)
        .global_tx_id(&global)
        .local_tx_id("l1")
        .service_name("payments")
        .instance_id("payments-1")
        .remark("participant unreachable")
        .biz_info(json!({ "table": "accounts" }))?;

    let record = store.create_accident(record).await?;
    assert!(record.id > 0);
    assert_eq!(record.status, AccidentStatus::Init);

    // Completion without a claim first is a status regression.
    let err = store
        .complete_accident(record.id, AccidentStatus::Success)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AccidentStatusRegression { .. }));

    assert!(store.claim_accident(record.id).await?);
    assert!(!store.claim_accident(record.id).await?);

    store
        .complete_accident(record.id, AccidentStatus::Success)
        .await?;

    let done = store.accidents(Some(AccidentStatus::Success)).await?;
    let record = done.iter().find(|r| r.id == record.id).unwrap();
    assert!(record.completed_at.is_some());

    // Terminal is terminal.
    assert!(store
        .complete_accident(record.id, AccidentStatus::Fail)
        .await
        .is_err());

    Ok(())
}

pub async fn test_config_roundtrip(store: &Store) -> anyhow::Result<()> {
    store
        .set_config(RuntimeConfigEntry::new(ConfigKind::SlaWindow, 5u64)?)
        .await?;

    let entry = store.config(ConfigKind::SlaWindow).await?.unwrap();
    assert_eq!(entry.as_duration(), Some(std::time::Duration::from_secs(5)));

    // A disabled entry reads as absent.
    store
        .set_config(RuntimeConfigEntry::new(ConfigKind::ExclusionWindow, 3u64)?.disabled())
        .await?;
    let entry = store.config(ConfigKind::ExclusionWindow).await?.unwrap();
    assert_eq!(entry.as_duration(), None);

    // So does one holding the wrong shape.
    store
        .set_config(RuntimeConfigEntry::new(ConfigKind::CompensationEnabled, "yes")?)
        .await?;
    let entry = store.config(ConfigKind::CompensationEnabled).await?.unwrap();
    assert_eq!(entry.as_flag(), None);

    store
        .set_config(RuntimeConfigEntry::new(ConfigKind::CompensationEnabled, false)?)
        .await?;
    let entry = store.config(ConfigKind::CompensationEnabled).await?.unwrap();
    assert_eq!(entry.as_flag(), Some(false));

    Ok(())
}
