#![cfg(feature = "memory")]

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use serde_json::{json, Value};

use sagaflow_agent::{
    apply_compensation, AgentConfig, AgentError, DirectSender, EventSender, LocalTransaction,
    MemoryExecutor, SqlDialect,
};
use sagaflow_store::{
    EventType, RetryPolicy, Row, StartedPayload, StatementKind, Store, TxEvent, TxStatus,
};

fn config(dialect: SqlDialect) -> AgentConfig {
    AgentConfig::new("payments", "payments-1", dialect)
        .delivery(RetryPolicy::new(3, Duration::from_millis(1)))
}

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn accounts_executor() -> MemoryExecutor {
    let executor = MemoryExecutor::new(SqlDialect::MySql);
    executor.create_table("accounts", Some("id"));

    executor
}

#[tokio::test]
async fn insert_compensates_with_keyed_delete() -> anyhow::Result<()> {
    let executor = accounts_executor();
    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-insert",
    );

    tx.execute(
        "INSERT INTO accounts (id, owner) VALUES (?, ?)",
        &[json!(7), json!("ada")],
    )
    .await?;

    assert_eq!(executor.rows("accounts").len(), 1);
    assert!(!tx.uncovered());

    let descriptors = tx.descriptors().to_vec();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].kind, StatementKind::Insert);
    assert_eq!(
        descriptors[0].template,
        "DELETE FROM `accounts` WHERE `id` = ?"
    );
    assert_eq!(descriptors[0].params, vec![json!(7)]);

    apply_compensation(&executor, &descriptors[0]).await?;
    assert!(executor.rows("accounts").is_empty());

    Ok(())
}

#[tokio::test]
async fn insert_resolves_generated_key() -> anyhow::Result<()> {
    let executor = accounts_executor();
    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-genkey",
    );

    tx.execute("INSERT INTO accounts (owner) VALUES (?)", &[json!("ada")])
        .await?;

    let descriptors = tx.descriptors();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].params, vec![json!(1)]);

    apply_compensation(&executor, &descriptors[0]).await?;
    assert!(executor.rows("accounts").is_empty());

    Ok(())
}

#[tokio::test]
async fn update_restores_before_image_per_row() -> anyhow::Result<()> {
    let executor = accounts_executor();
    executor.seed(
        "accounts",
        row(&[("id", json!(1)), ("balance", json!(100)), ("status", json!("open"))]),
    );
    executor.seed(
        "accounts",
        row(&[("id", json!(2)), ("balance", json!(200)), ("status", json!("open"))]),
    );

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-update",
    );

    let updated = tx
        .execute(
            "UPDATE accounts SET balance = ? WHERE status = ?",
            &[json!(0), json!("open")],
        )
        .await?;
    assert_eq!(updated, 2);

    let descriptors = tx.descriptors().to_vec();
    assert_eq!(descriptors.len(), 2);

    for descriptor in &descriptors {
        assert_eq!(descriptor.kind, StatementKind::Update);
        assert_eq!(
            descriptor.template,
            "UPDATE `accounts` SET `balance` = ? WHERE `id` = ?"
        );
        assert_eq!(descriptor.before_image.len(), 1);
    }

    // Strict reverse order, the way the dispatcher applies them.
    for descriptor in descriptors.iter().rev() {
        apply_compensation(&executor, descriptor).await?;
    }

    let mut balances = executor
        .rows("accounts")
        .iter()
        .filter_map(|r| r.get("balance").and_then(Value::as_i64))
        .collect::<Vec<_>>();
    balances.sort_unstable();
    assert_eq!(balances, vec![100, 200]);

    Ok(())
}

#[tokio::test]
async fn keyless_single_row_update_reuses_forward_predicate() -> anyhow::Result<()> {
    let executor = MemoryExecutor::new(SqlDialect::MySql);
    executor.create_table("ledger", None);
    executor.seed("ledger", row(&[("entry", json!("a")), ("amount", json!(10))]));

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-keyless",
    );

    tx.execute(
        "UPDATE ledger SET amount = ? WHERE entry = ?",
        &[json!(5), json!("a")],
    )
    .await?;

    assert!(!tx.uncovered());

    let descriptors = tx.descriptors().to_vec();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].params, vec![json!(10), json!("a")]);

    apply_compensation(&executor, &descriptors[0]).await?;
    assert_eq!(
        executor.rows("ledger")[0].get("amount"),
        Some(&json!(10))
    );

    Ok(())
}

#[tokio::test]
async fn keyless_multi_row_update_runs_uncovered() -> anyhow::Result<()> {
    let executor = MemoryExecutor::new(SqlDialect::MySql);
    executor.create_table("ledger", None);
    executor.seed("ledger", row(&[("entry", json!("a")), ("amount", json!(10))]));
    executor.seed("ledger", row(&[("entry", json!("a")), ("amount", json!(20))]));

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-ambiguous",
    );

    let updated = tx
        .execute(
            "UPDATE ledger SET amount = ? WHERE entry = ?",
            &[json!(0), json!("a")],
        )
        .await?;

    // The forward statement still ran; the branch just lost coverage.
    assert_eq!(updated, 2);
    assert!(tx.uncovered());
    assert!(tx.descriptors().is_empty());

    Ok(())
}

#[tokio::test]
async fn delete_compensates_with_bulk_reinsert() -> anyhow::Result<()> {
    let executor = accounts_executor();
    executor.seed(
        "accounts",
        row(&[("id", json!(1)), ("owner", json!("ada")), ("status", json!("stale"))]),
    );
    executor.seed(
        "accounts",
        row(&[("id", json!(2)), ("owner", json!("bob")), ("status", json!("stale"))]),
    );

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-delete",
    );

    let deleted = tx
        .execute("DELETE FROM accounts WHERE status = ?", &[json!("stale")])
        .await?;
    assert_eq!(deleted, 2);
    assert!(executor.rows("accounts").is_empty());

    let descriptors = tx.descriptors().to_vec();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].kind, StatementKind::Delete);
    assert_eq!(descriptors[0].before_image.len(), 2);

    apply_compensation(&executor, &descriptors[0]).await?;

    let restored = executor.rows("accounts");
    assert_eq!(restored.len(), 2);
    assert!(restored.iter().any(|r| r.get("owner") == Some(&json!("ada"))));
    assert!(restored.iter().any(|r| r.get("owner") == Some(&json!("bob"))));

    Ok(())
}

#[tokio::test]
async fn unclassifiable_statement_runs_uncovered() -> anyhow::Result<()> {
    let executor = MemoryExecutor::new(SqlDialect::Postgres);
    executor.create_table("accounts", Some("id"));

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::Postgres),
        Box::new(executor.clone()),
        "g-upsert",
    );

    tx.execute(
        "INSERT INTO accounts (id, owner) VALUES (?, ?) ON CONFLICT DO NOTHING",
        &[json!(1), json!("ada")],
    )
    .await?;

    assert!(tx.uncovered());
    assert!(tx.descriptors().is_empty());
    assert_eq!(executor.rows("accounts").len(), 1);

    Ok(())
}

#[tokio::test]
async fn commit_reports_started_then_ended() -> anyhow::Result<()> {
    let store = Store::memory();
    let sender = DirectSender::new(store.clone());
    let executor = accounts_executor();

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-commit",
    );

    tx.execute(
        "INSERT INTO accounts (id, owner) VALUES (?, ?)",
        &[json!(7), json!("ada")],
    )
    .await?;
    tx.commit(&sender).await?;

    let status = store.global_status("g-commit").await?;
    assert_eq!(status.locals.len(), 1);
    assert_eq!(status.locals[0].status, TxStatus::Ended);

    let started = status.locals[0].started.as_ref().unwrap();
    let payload: StartedPayload = started.to_payload()?;
    assert_eq!(payload.descriptors.len(), 1);
    assert!(!payload.uncovered);

    // The transaction is closed now.
    let err = tx
        .execute("DELETE FROM accounts WHERE id = ?", &[json!(7)])
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::TxClosed(_)));

    Ok(())
}

#[tokio::test]
async fn rollback_reports_nothing() -> anyhow::Result<()> {
    let store = Store::memory();
    let executor = accounts_executor();

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-rollback",
    );

    tx.execute(
        "INSERT INTO accounts (id, owner) VALUES (?, ?)",
        &[json!(7), json!("ada")],
    )
    .await?;
    tx.rollback()?;

    assert!(tx.descriptors().is_empty());
    assert!(store.global_status("g-rollback").await?.locals.is_empty());

    Ok(())
}

#[tokio::test]
async fn abort_reports_aborted() -> anyhow::Result<()> {
    let store = Store::memory();
    let sender = DirectSender::new(store.clone());
    let executor = accounts_executor();

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-abort",
    );

    tx.abort(&sender, "credit check failed").await?;

    let status = store.global_status("g-abort").await?;
    assert_eq!(status.locals.len(), 1);
    assert_eq!(status.locals[0].status, TxStatus::Aborted);
    assert!(status.any_aborted());

    Ok(())
}

/// Fails the first `failures` sends, then behaves like [`DirectSender`].
#[derive(Clone)]
struct FlakySender {
    store: Store,
    failures: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl EventSender for FlakySender {
    async fn send(&self, event: TxEvent) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("broker unavailable");
        }

        self.store.append(event).await?;

        Ok(())
    }
}

#[tokio::test]
async fn delivery_retries_transient_failures() -> anyhow::Result<()> {
    let store = Store::memory();
    let sender = FlakySender {
        store: store.clone(),
        failures: Arc::new(AtomicU32::new(2)),
        attempts: Arc::new(AtomicU32::new(0)),
    };
    let executor = accounts_executor();

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-flaky",
    );

    tx.commit(&sender).await?;

    // 2 failed + 1 ok for TxStarted, 1 ok for TxEnded.
    assert_eq!(sender.attempts.load(Ordering::SeqCst), 4);

    let status = store.global_status("g-flaky").await?;
    assert_eq!(status.locals[0].status, TxStatus::Ended);

    Ok(())
}

#[tokio::test]
async fn delivery_gives_up_after_retry_budget() -> anyhow::Result<()> {
    let store = Store::memory();
    let sender = FlakySender {
        store: store.clone(),
        failures: Arc::new(AtomicU32::new(u32::MAX)),
        attempts: Arc::new(AtomicU32::new(0)),
    };
    let executor = accounts_executor();

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-dead",
    );

    let err = tx.commit(&sender).await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::PermanentDelivery { attempts: 3, .. }
    ));
    assert_eq!(sender.attempts.load(Ordering::SeqCst), 3);

    // Nothing reached the log.
    assert!(store.global_status("g-dead").await?.locals.is_empty());

    Ok(())
}

#[tokio::test]
async fn lifecycle_events_share_local_tx_id() -> anyhow::Result<()> {
    let store = Store::memory();
    let sender = DirectSender::new(store.clone());
    let executor = accounts_executor();

    let mut tx = LocalTransaction::begin(
        config(SqlDialect::MySql),
        Box::new(executor.clone()),
        "g-ids",
    );
    let local_tx_id = tx.local_tx_id().to_owned();

    tx.commit(&sender).await?;

    let status = store.global_status("g-ids").await?;
    assert_eq!(status.locals[0].local_tx_id, local_tx_id);
    assert_eq!(
        status.locals[0].started.as_ref().map(|e| e.event_type),
        Some(EventType::TxStarted)
    );

    Ok(())
}
