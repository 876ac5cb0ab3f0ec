use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    postgres::{PgArguments, PgRow},
    query::Query,
    Column as _, PgPool, Postgres, Row as _, TypeInfo as _,
};
use std::sync::Arc;
use tokio::sync::Mutex;

use sagaflow_store::Row;

use crate::{
    error::{AgentError, Result},
    executor::SqlExecutor,
};

/// Executor bound to one Postgres transaction, so before-image reads and the
/// forward statements they cover commit or roll back together.
#[derive(Clone)]
pub struct PgExecutor {
    tx: Arc<Mutex<Option<sqlx::Transaction<'static, Postgres>>>>,
}

impl PgExecutor {
    pub async fn begin(pool: &PgPool) -> Result<Self> {
        let tx = pool.begin().await?;

        Ok(Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        })
    }

    pub async fn commit(&self) -> Result<()> {
        let Some(tx) = self.tx.lock().await.take() else {
            return Err(AgentError::Executor("transaction already closed".to_owned()));
        };

        tx.commit().await?;

        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        let Some(tx) = self.tx.lock().await.take() else {
            return Err(AgentError::Executor("transaction already closed".to_owned()));
        };

        tx.rollback().await?;

        Ok(())
    }
}

/// Rewrites `?` placeholders (outside string literals) into `$1..$n`.
fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut in_string = false;

    for c in sql.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            '?' if !in_string => {
                n += 1;
                out.push_str(&format!("${n}"));
            }
            _ => out.push(c),
        }
    }

    out
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other),
        };
    }

    query
}

fn row_to_map(row: &PgRow) -> Row {
    let mut out = Row::new();

    for column in row.columns() {
        let name = column.name().to_owned();
        let value = match column.type_info().name() {
            "INT2" => row
                .try_get::<Option<i16>, _>(column.ordinal())
                .ok()
                .flatten()
                .map(Value::from),
            "INT4" => row
                .try_get::<Option<i32>, _>(column.ordinal())
                .ok()
                .flatten()
                .map(Value::from),
            "INT8" => row
                .try_get::<Option<i64>, _>(column.ordinal())
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT4" | "FLOAT8" | "NUMERIC" => row
                .try_get::<Option<f64>, _>(column.ordinal())
                .ok()
                .flatten()
                .map(Value::from),
            "BOOL" => row
                .try_get::<Option<bool>, _>(column.ordinal())
                .ok()
                .flatten()
                .map(Value::from),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(column.ordinal())
                .ok()
                .flatten(),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(column.ordinal())
                .ok()
                .flatten()
                .map(|u| Value::String(u.to_string())),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(column.ordinal())
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_rfc3339())),
            _ => row
                .try_get::<Option<String>, _>(column.ordinal())
                .ok()
                .flatten()
                .map(Value::String),
        };

        out.insert(name, value.unwrap_or(Value::Null));
    }

    out
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = numbered_placeholders(sql);
        let mut guard = self.tx.lock().await;

        let Some(tx) = guard.as_mut() else {
            return Err(AgentError::Executor("transaction already closed".to_owned()));
        };

        let rows = bind_params(sqlx::query(&sql), params)
            .fetch_all(&mut **tx)
            .await?;

        Ok(rows.iter().map(row_to_map).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = numbered_placeholders(sql);
        let mut guard = self.tx.lock().await;

        let Some(tx) = guard.as_mut() else {
            return Err(AgentError::Executor("transaction already closed".to_owned()));
        };

        let done = bind_params(sqlx::query(&sql), params)
            .execute(&mut **tx)
            .await?;

        Ok(done.rows_affected())
    }

    async fn last_insert_id(&self, table: &str) -> Result<Option<Value>> {
        let Some(pk) = self.primary_key(table).await? else {
            return Ok(None);
        };

        let mut guard = self.tx.lock().await;

        let Some(tx) = guard.as_mut() else {
            return Err(AgentError::Executor("transaction already closed".to_owned()));
        };

        let row = sqlx::query("SELECT currval(pg_get_serial_sequence($1, $2)) AS id")
            .bind(table)
            .bind(&pk)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row
            .and_then(|row| row.try_get::<Option<i64>, _>("id").ok().flatten())
            .map(Value::from))
    }

    async fn primary_key(&self, table: &str) -> Result<Option<String>> {
        let mut guard = self.tx.lock().await;

        let Some(tx) = guard.as_mut() else {
            return Err(AgentError::Executor("transaction already closed".to_owned()));
        };

        let row = sqlx::query(
            r#"
            SELECT a.attname AS pk
            FROM pg_index i
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            WHERE i.indrelid = $1::regclass AND i.indisprimary
            LIMIT 1
            "#,
        )
        .bind(table)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.and_then(|row| row.try_get::<Option<String>, _>("pk").ok().flatten()))
    }
}
