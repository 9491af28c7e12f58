//! Runs against the database named by `SYNCSTORE_POSTGRES_URL`, and is skipped otherwise.

use std::time::Duration;

use syncstore_core::{
    backend::{StorageBackend, StorageBackendBuilder},
    testing::ConformanceSuite,
    timestamp::ManualClock,
};
use syncstore_postgres::{PostgresStore, PostgresStoreBuilder};

fn builder() -> Option<PostgresStoreBuilder> {
    let url = std::env::var("SYNCSTORE_POSTGRES_URL").ok()?;

    Some(
        PostgresStore::builder(&url)
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10)),
    )
}

#[tokio::test]
async fn postgres_store_conforms() {
    let Some(builder) = builder() else {
        return;
    };
    let clock = ManualClock::new(0);
    let store = builder.with_clock(clock.clone()).build().await.unwrap();
    store.initialize_schema().await.unwrap();
    // Idempotent.
    store.initialize_schema().await.unwrap();

    ConformanceSuite::new(&store, clock).run().await;
}

#[tokio::test]
async fn readonly_postgres_store_rejects_writes() {
    let Some(builder) = builder() else {
        return;
    };
    // Reads need the tables, which a read-only store cannot create.
    let writable = self::builder().unwrap().build().await.unwrap();
    writable.initialize_schema().await.unwrap();
    writable.shutdown().await.unwrap();

    let clock = ManualClock::new(0);
    let store = builder
        .with_clock(clock.clone())
        .readonly(true)
        .build()
        .await
        .unwrap();

    ConformanceSuite::new(&store, clock).run_readonly().await;
}
