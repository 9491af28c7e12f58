use serde_json::{Value, json};
use syncstore_core::{
    query::{Filter, ListQuery, Sort, SortDirection},
    record::{Record, Scope},
    store::RecordStore,
};
use syncstore_memory::InMemoryStore;

fn numbers(records: &[Record]) -> Vec<Value> {
    records
        .iter()
        .map(|record| record.get("n").cloned().unwrap_or(Value::Null))
        .collect()
}

async fn seeded() -> RecordStore<InMemoryStore> {
    let store = RecordStore::new(InMemoryStore::new());
    let articles = store.collection(Scope::new("articles", "alice"));

    for n in 0..7 {
        let value = json!({"n": n, "status": n % 2});
        articles.create(Record::from_value(value).unwrap()).await.unwrap();
    }
    store
}

#[tokio::test]
async fn pages_are_collected_across_ties() {
    let store = seeded().await;
    let articles = store.collection(Scope::new("articles", "alice"));
    let sorting = vec![Sort::desc("status")];

    let everything = articles
        .get_all(&ListQuery::builder().sorting(sorting.clone()).build())
        .await
        .unwrap();
    let paged = articles
        .get_all_pages(&ListQuery::builder().sorting(sorting).limit(2).build())
        .await
        .unwrap();

    assert_eq!(paged.len(), 7);
    assert_eq!(paged, everything.records);
    assert!(paged[..3].iter().all(|record| record.get("status") == Some(&json!(1))));
}

#[tokio::test]
async fn pages_end_on_an_exact_multiple() {
    let store = seeded().await;
    let articles = store.collection(Scope::new("articles", "alice"));

    let paged = articles
        .get_all_pages(
            &ListQuery::builder()
                .filter(Filter::max("n", 5))
                .sort("n", SortDirection::Asc)
                .limit(3)
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(numbers(&paged), (0..6).map(|n| json!(n)).collect::<Vec<_>>());
}

#[tokio::test]
async fn unlimited_query_is_a_single_page() {
    let store = seeded().await;
    let articles = store.collection(Scope::new("articles", "alice"));

    let paged = articles
        .get_all_pages(&ListQuery::builder().sort("n", SortDirection::Desc).build())
        .await
        .unwrap();

    assert_eq!(numbers(&paged), (0..7).rev().map(|n| json!(n)).collect::<Vec<_>>());
}

#[tokio::test]
async fn zero_limit_collects_nothing() {
    let store = seeded().await;
    let articles = store.collection(Scope::new("articles", "alice"));

    let paged = articles
        .get_all_pages(&ListQuery::builder().limit(0).build())
        .await
        .unwrap();

    assert!(paged.is_empty());
}

#[tokio::test]
async fn initial_pagination_rules_are_honoured() {
    let store = seeded().await;
    let articles = store.collection(Scope::new("articles", "alice"));

    let paged = articles
        .get_all_pages(
            &ListQuery::builder()
                .sort("n", SortDirection::Asc)
                .pagination_rules(vec![vec![Filter::gt("n", 3)]])
                .limit(2)
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(numbers(&paged), vec![json!(4), json!(5), json!(6)]);
}
