//! Runs against the server named by `SYNCSTORE_MONGODB_URL`, and is skipped otherwise.

use std::time::Duration;

use syncstore_core::{
    backend::{StorageBackend, StorageBackendBuilder},
    testing::ConformanceSuite,
    timestamp::ManualClock,
};
use syncstore_mongodb::{MongoDbStore, MongoDbStoreBuilder};

const DATABASE: &str = "syncstore_tests";

fn builder() -> Option<MongoDbStoreBuilder> {
    let url = std::env::var("SYNCSTORE_MONGODB_URL").ok()?;

    Some(
        MongoDbStore::builder(&url, DATABASE)
            .server_selection_timeout(Duration::from_secs(5)),
    )
}

#[tokio::test]
async fn mongodb_store_conforms() {
    let Some(builder) = builder() else {
        return;
    };
    let clock = ManualClock::new(0);
    let store = builder.with_clock(clock.clone()).build().await.unwrap();
    store.initialize_schema().await.unwrap();

    ConformanceSuite::new(&store, clock).run().await;
}

#[tokio::test]
async fn readonly_mongodb_store_rejects_writes() {
    let Some(builder) = builder() else {
        return;
    };
    let clock = ManualClock::new(0);
    let store = builder
        .with_clock(clock.clone())
        .readonly(true)
        .build()
        .await
        .unwrap();

    ConformanceSuite::new(&store, clock).run_readonly().await;
}

#[tokio::test]
async fn unreachable_server_is_a_backend_error() {
    if builder().is_none() {
        return;
    }
    let store = MongoDbStore::builder("mongodb://127.0.0.1:1", DATABASE)
        .server_selection_timeout(Duration::from_millis(200))
        .build()
        .await
        .unwrap();
    let scope = syncstore_core::record::Scope::new("articles", "alice");

    let err = store.collection_timestamp(&scope).await.unwrap_err();

    assert!(err.is_backend());
    assert!(!store.ping().await);
}
