use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row as _};

use crate::{
    accident::{AccidentRecord, AccidentStatus},
    config::{ConfigKind, RuntimeConfigEntry},
    engine::Engine,
    error::{Result, StoreError},
    event::TxEvent,
    store::Store,
};

/// Postgres engine. The unique index on the event dedup key and the
/// compare-and-set accident update are what make multi-replica coordinators
/// safe without a distributed lock.
#[derive(Debug, Clone)]
pub struct Pg(PgPool);

impl Pg {
    pub fn new(pool: PgPool) -> Self {
        Self(pool)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sagaflow_events (
                id UUID PRIMARY KEY,
                global_tx_id TEXT NOT NULL,
                local_tx_id TEXT NOT NULL,
                service_name TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (global_tx_id, local_tx_id, event_type)
            )
            "#,
        )
        .execute(&self.0)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS sagaflow_events_created_at_idx
             ON sagaflow_events (event_type, created_at)",
        )
        .execute(&self.0)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sagaflow_accidents (
                id BIGSERIAL PRIMARY KEY,
                service_name TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                global_tx_id TEXT NOT NULL,
                local_tx_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                biz_info JSONB,
                remark TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.0)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sagaflow_config (
                kind TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                value JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.0)
        .await?;

        Ok(())
    }
}

impl Store {
    pub fn pg(pool: PgPool) -> Self {
        Store::new(Pg::new(pool))
    }
}

fn event_from_row(row: &PgRow) -> Result<TxEvent> {
    let event_type: String = row.try_get("event_type")?;

    Ok(TxEvent {
        id: row.try_get("id")?,
        global_tx_id: row.try_get("global_tx_id")?,
        local_tx_id: row.try_get("local_tx_id")?,
        service_name: row.try_get("service_name")?,
        instance_id: row.try_get("instance_id")?,
        event_type: event_type.parse()?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
    })
}

fn accident_from_row(row: &PgRow) -> Result<AccidentRecord> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;

    Ok(AccidentRecord {
        id: row.try_get("id")?,
        service_name: row.try_get("service_name")?,
        instance_id: row.try_get("instance_id")?,
        global_tx_id: row.try_get("global_tx_id")?,
        local_tx_id: row.try_get("local_tx_id")?,
        kind: kind.parse()?,
        status: status.parse()?,
        biz_info: row.try_get("biz_info")?,
        remark: row.try_get("remark")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl Engine for Pg {
    async fn append(&self, event: TxEvent) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO sagaflow_events
                (id, global_tx_id, local_tx_id, service_name, instance_id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (global_tx_id, local_tx_id, event_type) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.global_tx_id)
        .bind(&event.local_tx_id)
        .bind(&event.service_name)
        .bind(&event.instance_id)
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.0)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn query_incomplete(&self, older_than: DateTime<Utc>) -> Result<Vec<TxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sagaflow_events s
            WHERE s.event_type = 'tx_started'
              AND s.created_at < $1
              AND NOT EXISTS (
                SELECT 1 FROM sagaflow_events t
                WHERE t.global_tx_id = s.global_tx_id
                  AND t.local_tx_id = s.local_tx_id
                  AND t.event_type IN
                    ('tx_ended', 'tx_aborted', 'compensation_triggered', 'tx_compensated')
              )
            ORDER BY s.created_at ASC
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.0)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn query_global(&self, global_tx_id: &str) -> Result<Vec<TxEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM sagaflow_events WHERE global_tx_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(global_tx_id)
        .fetch_all(&self.0)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn query_unconfirmed_globals(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT s.global_tx_id FROM sagaflow_events s
            WHERE s.event_type <> 'saga_ended'
              AND NOT EXISTS (
                SELECT 1 FROM sagaflow_events t
                WHERE t.global_tx_id = s.global_tx_id AND t.event_type = 'saga_ended'
              )
            "#,
        )
        .fetch_all(&self.0)
        .await?;

        rows.iter()
            .map(|row| Ok(row.try_get("global_tx_id")?))
            .collect()
    }

    async fn create_accident(&self, record: AccidentRecord) -> Result<AccidentRecord> {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO sagaflow_accidents
                (service_name, instance_id, global_tx_id, local_tx_id, kind, status, biz_info, remark, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&record.service_name)
        .bind(&record.instance_id)
        .bind(&record.global_tx_id)
        .bind(&record.local_tx_id)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(&record.biz_info)
        .bind(&record.remark)
        .bind(record.created_at)
        .bind(record.completed_at)
        .fetch_one(&self.0)
        .await?
        .try_get("id")?;

        Ok(AccidentRecord { id, ..record })
    }

    async fn claim_accident(&self, id: i64) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE sagaflow_accidents SET status = 'sending' WHERE id = $1 AND status = 'init'",
        )
        .bind(id)
        .execute(&self.0)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn complete_accident(&self, id: i64, status: AccidentStatus) -> Result<()> {
        let row = sqlx::query("SELECT status FROM sagaflow_accidents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.0)
            .await?;

        let Some(row) = row else {
            return Err(StoreError::AccidentNotFound(id));
        };

        let current: AccidentStatus = row.try_get::<String, _>("status")?.parse()?;

        if !current.can_advance_to(status) {
            return Err(StoreError::AccidentStatusRegression {
                id,
                from: current,
                to: status,
            });
        }

        let updated = sqlx::query(
            "UPDATE sagaflow_accidents SET status = $2, completed_at = $3
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(current.as_str())
        .execute(&self.0)
        .await?
        .rows_affected();

        if updated != 1 {
            return Err(StoreError::AccidentStatusRegression {
                id,
                from: current,
                to: status,
            });
        }

        Ok(())
    }

    async fn list_accidents(&self, status: Option<AccidentStatus>) -> Result<Vec<AccidentRecord>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM sagaflow_accidents WHERE status = $1 ORDER BY id ASC")
                    .bind(status.as_str())
                    .fetch_all(&self.0)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM sagaflow_accidents ORDER BY id ASC")
                    .fetch_all(&self.0)
                    .await?
            }
        };

        rows.iter().map(accident_from_row).collect()
    }

    async fn get_config(&self, kind: ConfigKind) -> Result<Option<RuntimeConfigEntry>> {
        let row = sqlx::query("SELECT * FROM sagaflow_config WHERE kind = $1")
            .bind(kind.as_str())
            .fetch_optional(&self.0)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;

        Ok(Some(RuntimeConfigEntry {
            kind,
            status: serde_json::from_value(serde_json::Value::String(status))?,
            value: row.try_get("value")?,
        }))
    }

    async fn set_config(&self, entry: RuntimeConfigEntry) -> Result<()> {
        let status = match entry.status {
            crate::config::ConfigStatus::Normal => "normal",
            crate::config::ConfigStatus::Disabled => "disabled",
        };

        sqlx::query(
            r#"
            INSERT INTO sagaflow_config (kind, status, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind) DO UPDATE SET status = EXCLUDED.status, value = EXCLUDED.value
            "#,
        )
        .bind(entry.kind.as_str())
        .bind(status)
        .bind(&entry.value)
        .execute(&self.0)
        .await?;

        Ok(())
    }
}
