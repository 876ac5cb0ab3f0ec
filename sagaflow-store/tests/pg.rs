#![cfg(feature = "pg")]
mod store;

use sagaflow_store::{Pg, Store};
use sqlx::PgPool;
use tokio::sync::OnceCell;

static STORE: OnceCell<Option<Store>> = OnceCell::const_new();

/// Postgres tests need a live database; they are skipped unless
/// `SAGAFLOW_TEST_DSN` points at one.
async fn get_store() -> Option<Store> {
    STORE
        .get_or_init(|| async {
            let dsn = std::env::var("SAGAFLOW_TEST_DSN").ok()?;
            let pool = PgPool::connect(&dsn).await.expect("connect test database");

            Pg::new(pool.clone()).migrate().await.expect("migrate");

            Some(Store::pg(pool))
        })
        .await
        .clone()
}

#[tokio::test]
async fn append_idempotent() {
    let Some(store) = get_store().await else { return };
    store::test_append_idempotent(&store).await.unwrap();
}

#[tokio::test]
async fn query_incomplete() {
    let Some(store) = get_store().await else { return };
    store::test_query_incomplete(&store).await.unwrap();
}

#[tokio::test]
async fn trigger_decides_race() {
    let Some(store) = get_store().await else { return };
    store::test_trigger_decides_race(&store).await.unwrap();
}

#[tokio::test]
async fn global_status_fold() {
    let Some(store) = get_store().await else { return };
    store::test_global_status_fold(&store).await.unwrap();
}

#[tokio::test]
async fn accident_lifecycle() {
    let Some(store) = get_store().await else { return };
    store::test_accident_lifecycle(&store).await.unwrap();
}

#[tokio::test]
async fn config_roundtrip() {
    let Some(store) = get_store().await else { return };
    store::test_config_roundtrip(&store).await.unwrap();
}
