#![cfg(feature = "memory")]
mod store;

use sagaflow_store::Store;

#[tokio::test]
async fn append_idempotent() {
    store::test_append_idempotent(&Store::memory()).await.unwrap();
}

#[tokio::test]
async fn query_incomplete() {
    store::test_query_incomplete(&Store::memory()).await.unwrap();
}

#[tokio::test]
async fn trigger_decides_race() {
    store::test_trigger_decides_race(&Store::memory())
        .await
        .unwrap();
}

#[tokio::test]
async fn global_status_fold() {
    store::test_global_status_fold(&Store::memory())
        .await
        .unwrap();
}

#[tokio::test]
async fn accident_lifecycle() {
    store::test_accident_lifecycle(&Store::memory())
        .await
        .unwrap();
}

#[tokio::test]
async fn config_roundtrip() {
    store::test_config_roundtrip(&Store::memory())
        .await
        .unwrap();
}
