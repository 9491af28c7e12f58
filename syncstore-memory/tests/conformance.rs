use syncstore_core::{
    backend::StorageBackendBuilder,
    testing::ConformanceSuite,
    timestamp::ManualClock,
};
use syncstore_memory::InMemoryStore;

#[tokio::test]
async fn in_memory_store_conforms() {
    let clock = ManualClock::new(0);
    let store = InMemoryStore::builder()
        .with_clock(clock.clone())
        .build()
        .await
        .unwrap();

    ConformanceSuite::new(&store, clock).run().await;
}

#[tokio::test]
async fn readonly_in_memory_store_rejects_writes() {
    let clock = ManualClock::new(0);
    let store = InMemoryStore::builder()
        .with_clock(clock.clone())
        .readonly(true)
        .build()
        .await
        .unwrap();

    ConformanceSuite::new(&store, clock).run_readonly().await;
}
