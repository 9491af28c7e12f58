//! Backend-agnostic conformance checks.
//!
//! Adapter crates run [`ConformanceSuite::run`] from their integration tests, against a
//! backend built with the suite's [`ManualClock`] and the default UUID id generator.
//! Expected results are spelled out exactly, so every backend passing the suite returns
//! the same records, in the same order, with the same timestamps.
//!
//! Each check works in scopes of its own and never flushes, so a shared database can
//! host several runs at once.

use futures::future::join_all;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    backend::StorageBackend,
    error::StorageError,
    page::Page,
    query::{Filter, ListQuery, Sort, SortDirection},
    record::{Record, Scope},
    timestamp::ManualClock,
};

fn record(value: Value) -> Record {
    Record::from_value(value).expect("test records are objects")
}

fn ids(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(Record::id)
        .map(str::to_string)
        .collect()
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

fn sorted_numbers(values: Vec<Option<&Value>>) -> Vec<i64> {
    let mut numbers: Vec<i64> = values
        .into_iter()
        .filter_map(|value| value.and_then(Value::as_i64))
        .collect();
    numbers.sort();
    numbers
}

fn field<'r>(records: &'r [Record], name: &str) -> Vec<Option<&'r Value>> {
    records.iter().map(|record| record.get(name)).collect()
}

/// The checks every [`StorageBackend`] must pass.
pub struct ConformanceSuite<'a, B: StorageBackend> {
    backend: &'a B,
    clock: ManualClock,
    run_id: String,
}

impl<'a, B: StorageBackend> ConformanceSuite<'a, B> {
    /// `clock` must be the clock the backend was built with.
    pub fn new(backend: &'a B, clock: ManualClock) -> Self {
        let run_id = Uuid::new_v4().simple().to_string()[..12].to_string();
        Self { backend, clock, run_id }
    }

    fn scope(&self, name: &str) -> Scope {
        Scope::new(format!("{name}-{}", self.run_id), "alice")
    }

    async fn create(&self, scope: &Scope, value: Value) -> Record {
        self.backend
            .create(scope, record(value), &[])
            .await
            .expect("create succeeds")
    }

    async fn list(&self, scope: &Scope, query: ListQuery) -> Page {
        self.backend
            .get_all(scope, &query)
            .await
            .expect("get_all succeeds")
    }

    async fn timestamp(&self, scope: &Scope) -> i64 {
        self.backend
            .collection_timestamp(scope)
            .await
            .expect("collection_timestamp succeeds")
    }

    /// Runs every check of a writable backend.
    pub async fn run(&self) {
        self.empty_scope_timestamp().await;
        self.timestamps_survive_backward_clock().await;
        self.concurrent_writes_get_distinct_timestamps().await;
        self.missing_and_deleted_records_are_not_found().await;
        self.tombstones_only_keep_id_and_timestamp().await;
        self.unique_fields_are_enforced().await;
        self.client_ids_are_validated_and_unique().await;
        self.update_upserts_and_owns_storage_fields().await;
        self.status_scenario().await;
        self.pagination_is_complete().await;
        self.delete_all_follows_id_order().await;
        self.purge_removes_tombstones_only().await;
        self.dotted_paths_are_resolved().await;
        self.value_kinds_are_ordered().await;
        self.container_sort_keys_paginate().await;
        assert!(self.backend.ping().await, "ping on a healthy backend");
    }

    pub async fn empty_scope_timestamp(&self) {
        let scope = self.scope("empty");

        self.clock.set(1_000);
        assert_eq!(self.timestamp(&scope).await, 1_000);

        self.clock.set(500);
        assert_eq!(self.timestamp(&scope).await, 1_000);

        let created = self.create(&scope, json!({"title": "first"})).await;
        assert_eq!(created.last_modified(), Some(1_001));
        assert_eq!(self.timestamp(&scope).await, 1_001);
    }

    pub async fn timestamps_survive_backward_clock(&self) {
        let scope = self.scope("monotonic");

        self.clock.set(10_000);
        let a = self.create(&scope, json!({"title": "a"})).await;
        assert_eq!(a.last_modified(), Some(10_000));

        self.clock.set(5_000);
        let b = self.create(&scope, json!({"title": "b"})).await;
        assert_eq!(b.last_modified(), Some(10_001));

        let a_id = a.id().expect("created records have ids");
        let updated = self
            .backend
            .update(&scope, a_id, record(json!({"title": "a2"})), &[])
            .await
            .expect("update succeeds");
        assert_eq!(updated.last_modified(), Some(10_002));

        let b_id = b.id().expect("created records have ids");
        let tombstone = self
            .backend
            .delete(&scope, b_id)
            .await
            .expect("delete succeeds");
        assert_eq!(tombstone.last_modified(), Some(10_003));
        assert_eq!(self.timestamp(&scope).await, 10_003);

        self.clock.set(20_000);
        let c = self.create(&scope, json!({"title": "c"})).await;
        assert_eq!(c.last_modified(), Some(20_000));
    }

    pub async fn concurrent_writes_get_distinct_timestamps(&self) {
        let scope = self.scope("concurrent");
        self.clock.set(42);

        let writes = (0..16).map(|n| self.backend.create(&scope, record(json!({"n": n})), &[]));
        let mut timestamps: Vec<i64> = join_all(writes)
            .await
            .into_iter()
            .map(|created| {
                created
                    .expect("concurrent create succeeds")
                    .last_modified()
                    .expect("created records have a timestamp")
            })
            .collect();
        timestamps.sort_unstable();
        timestamps.dedup();

        assert_eq!(timestamps.len(), 16);
        assert_eq!(timestamps.first(), Some(&42));
        assert_eq!(timestamps.last(), Some(&57));
        assert_eq!(self.timestamp(&scope).await, 57);
    }

    pub async fn missing_and_deleted_records_are_not_found(&self) {
        let scope = self.scope("not-found");

        let missing = self.backend.get(&scope, "unknown").await.unwrap_err();
        assert!(missing.is_not_found());
        let missing = self.backend.delete(&scope, "unknown").await.unwrap_err();
        assert!(missing.is_not_found());

        let created = self.create(&scope, json!({"title": "gone"})).await;
        let id = created.id().expect("created records have ids");
        assert_eq!(
            self.backend.get(&scope, id).await.expect("get succeeds"),
            created
        );

        self.backend.delete(&scope, id).await.expect("delete succeeds");
        assert!(self.backend.get(&scope, id).await.unwrap_err().is_not_found());
        assert!(self.backend.delete(&scope, id).await.unwrap_err().is_not_found());

        let other = Scope::new(scope.collection_id.clone(), "bob");
        let created = self.create(&scope, json!({"title": "private"})).await;
        let id = created.id().expect("created records have ids");
        assert!(self.backend.get(&other, id).await.unwrap_err().is_not_found());
    }

    pub async fn tombstones_only_keep_id_and_timestamp(&self) {
        let scope = self.scope("tombstone");

        self.clock.set(100);
        let created = self
            .create(&scope, json!({"title": "secret", "tags": ["a"]}))
            .await;
        let id = created.id().expect("created records have ids").to_string();

        self.clock.set(200);
        let tombstone = self.backend.delete(&scope, &id).await.expect("delete succeeds");
        assert_eq!(
            tombstone.clone().into_value(),
            json!({"id": id, "last_modified": 200, "deleted": true})
        );

        let page = self.list(&scope, ListQuery::builder().include_deleted(true).build()).await;
        assert_eq!(page.records, vec![tombstone]);
        assert_eq!(page.total_count, 0);

        let page = self.list(&scope, ListQuery::new()).await;
        assert!(page.is_empty());
    }

    pub async fn unique_fields_are_enforced(&self) {
        let scope = self.scope("unicity");
        let unique = vec!["email".to_string()];

        let first = self
            .backend
            .create(&scope, record(json!({"email": "a@example.com"})), &unique)
            .await
            .expect("create succeeds");
        let before = self.timestamp(&scope).await;

        let err = self
            .backend
            .create(&scope, record(json!({"email": "a@example.com"})), &unique)
            .await
            .unwrap_err();
        match err {
            StorageError::Unicity { field, existing } => {
                assert_eq!(field, "email");
                assert_eq!(*existing, first);
            }
            other => panic!("expected a unicity error, got {other:?}"),
        }
        assert_eq!(self.timestamp(&scope).await, before);

        let second = self
            .backend
            .create(&scope, record(json!({"email": "b@example.com"})), &unique)
            .await
            .expect("create succeeds");
        let second_id = second.id().expect("created records have ids");
        let err = self
            .backend
            .update(&scope, second_id, record(json!({"email": "a@example.com"})), &unique)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unicity { .. }));

        let first_id = first.id().expect("created records have ids");
        self.backend
            .update(
                &scope,
                first_id,
                record(json!({"email": "a@example.com", "name": "Ada"})),
                &unique,
            )
            .await
            .expect("a record never collides with itself");

        for value in [json!({"email": null}), json!({"email": null}), json!({})] {
            self.backend
                .create(&scope, record(value), &unique)
                .await
                .expect("unset values never collide");
        }

        let other = Scope::new(scope.collection_id.clone(), "bob");
        self.backend
            .create(&other, record(json!({"email": "a@example.com"})), &unique)
            .await
            .expect("scopes are isolated");

        self.backend
            .delete(&scope, first_id)
            .await
            .expect("delete succeeds");
        self.backend
            .create(&scope, record(json!({"email": "a@example.com"})), &unique)
            .await
            .expect("tombstones never collide");
    }

    pub async fn client_ids_are_validated_and_unique(&self) {
        let scope = self.scope("client-id");
        let id = Uuid::new_v4().to_string();

        let created = self.create(&scope, json!({"id": id, "title": "mine"})).await;
        assert_eq!(created.id(), Some(id.as_str()));

        let err = self
            .backend
            .create(&scope, record(json!({"id": id})), &[])
            .await
            .unwrap_err();
        match err {
            StorageError::Unicity { field, existing } => {
                assert_eq!(field, "id");
                assert_eq!(*existing, created);
            }
            other => panic!("expected a unicity error, got {other:?}"),
        }

        let err = self
            .backend
            .create(&scope, record(json!({"id": "not-an-id"})), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));

        self.backend.delete(&scope, &id).await.expect("delete succeeds");
        let revived = self.create(&scope, json!({"id": id, "title": "again"})).await;
        assert_eq!(
            self.backend.get(&scope, &id).await.expect("get succeeds"),
            revived
        );
    }

    pub async fn update_upserts_and_owns_storage_fields(&self) {
        let scope = self.scope("upsert");
        let id = Uuid::new_v4().to_string();

        self.clock.set(50);
        let stored = self
            .backend
            .update(
                &scope,
                &id,
                record(json!({"id": "ignored", "title": "new", "last_modified": 1, "deleted": true})),
                &[],
            )
            .await
            .expect("update creates missing records");
        assert_eq!(
            stored.clone().into_value(),
            json!({"id": id, "title": "new", "last_modified": 50})
        );
        assert_eq!(self.backend.get(&scope, &id).await.expect("get succeeds"), stored);

        self.backend.delete(&scope, &id).await.expect("delete succeeds");
        let revived = self
            .backend
            .update(&scope, &id, record(json!({"title": "back"})), &[])
            .await
            .expect("update revives tombstones");
        assert_eq!(revived.last_modified(), Some(52));
        assert!(!revived.is_deleted());
    }

    /// Three status records going through listing, filtering, sorting and sync.
    pub async fn status_scenario(&self) {
        let scope = self.scope("status");

        self.clock.set(1_000);
        let a = self.create(&scope, json!({"code": "A", "status": 1})).await;
        let b = self.create(&scope, json!({"code": "B", "status": 2})).await;
        let c = self.create(&scope, json!({"code": "C", "status": 1})).await;

        let page = self
            .list(
                &scope,
                ListQuery::builder()
                    .filter(Filter::eq("status", 1))
                    .sort("code", SortDirection::Asc)
                    .build(),
            )
            .await;
        assert_eq!(field(&page.records, "code"), vec![Some(&json!("A")), Some(&json!("C"))]);
        assert_eq!(page.total_count, 2);

        let page = self
            .list(
                &scope,
                ListQuery::builder()
                    .sort("status", SortDirection::Desc)
                    .sort("code", SortDirection::Asc)
                    .build(),
            )
            .await;
        assert_eq!(ids(&page.records), ids(&[b.clone(), a.clone(), c.clone()]));

        let since = b.last_modified().expect("created records have a timestamp");
        let a_id = a.id().expect("created records have ids");
        let c_id = c.id().expect("created records have ids");
        self.backend.delete(&scope, c_id).await.expect("delete succeeds");
        self.backend
            .update(&scope, a_id, record(json!({"code": "A", "status": 3})), &[])
            .await
            .expect("update succeeds");

        let changes = self
            .list(
                &scope,
                ListQuery::builder()
                    .filter(Filter::gt("last_modified", since))
                    .sort("last_modified", SortDirection::Asc)
                    .include_deleted(true)
                    .build(),
            )
            .await;
        assert_eq!(ids(&changes.records), vec![c_id.to_string(), a_id.to_string()]);
        assert!(changes.records[0].is_deleted());
        assert_eq!(changes.records[1].get("status"), Some(&json!(3)));
        assert_eq!(changes.total_count, 1);

        let live = self.list(&scope, ListQuery::new()).await;
        assert_eq!(sorted(ids(&live.records)), sorted(ids(&[a, b])));
        assert_eq!(live.total_count, 2);
    }

    pub async fn pagination_is_complete(&self) {
        let scope = self.scope("pagination");

        for n in 0..12 {
            let value = if n % 4 == 0 {
                json!({"label": format!("r{n:02}")})
            } else {
                json!({"label": format!("r{n:02}"), "rank": n % 3})
            };
            self.create(&scope, value).await;
        }

        for (sorting, page_size) in [
            (vec![Sort::asc("rank")], 5),
            (vec![Sort::desc("rank"), Sort::desc("label")], 4),
            (vec![Sort::desc("last_modified")], 7),
        ] {
            let everything = self
                .list(&scope, ListQuery::builder().sorting(sorting.clone()).build())
                .await;
            assert_eq!(everything.len(), 12);

            let mut seen = Vec::new();
            let mut query = ListQuery::builder()
                .sorting(sorting.clone())
                .limit(page_size)
                .build();
            loop {
                let page = self.list(&scope, query.clone()).await;
                assert_eq!(page.total_count, 12);
                let Some(rules) = page.next_pagination_rules(&sorting) else {
                    break;
                };
                seen.extend(ids(&page.records));
                query.pagination_rules = rules;
            }

            assert_eq!(seen, ids(&everything.records));
        }
    }

    pub async fn delete_all_follows_id_order(&self) {
        let scope = self.scope("delete-all");

        self.clock.set(7_000);
        let mut expected = Vec::new();
        for group in ["x", "y", "x", "x"] {
            let created = self.create(&scope, json!({"group": group})).await;
            if group == "x" {
                expected.push(created.id().expect("created records have ids").to_string());
            }
        }
        expected.sort();

        let tombstones = self
            .backend
            .delete_all(&scope, &[Filter::eq("group", "x")])
            .await
            .expect("delete_all succeeds");
        assert_eq!(ids(&tombstones), expected);
        assert!(tombstones.iter().all(Record::is_deleted));
        let timestamps: Vec<Option<i64>> = tombstones.iter().map(Record::last_modified).collect();
        assert_eq!(timestamps, vec![Some(7_004), Some(7_005), Some(7_006)]);

        let remaining = self.list(&scope, ListQuery::new()).await;
        assert_eq!(remaining.total_count, 1);

        let rest = self
            .backend
            .delete_all(&scope, &[])
            .await
            .expect("delete_all succeeds");
        assert_eq!(rest.len(), 1);
        assert!(self.list(&scope, ListQuery::new()).await.is_empty());
    }

    pub async fn purge_removes_tombstones_only(&self) {
        let scope = self.scope("purge");

        self.clock.set(100);
        let first = self.create(&scope, json!({"n": 1})).await;
        let second = self.create(&scope, json!({"n": 2})).await;
        self.create(&scope, json!({"n": 3})).await;

        self.clock.set(200);
        let first_id = first.id().expect("created records have ids");
        self.backend.delete(&scope, first_id).await.expect("delete succeeds");
        self.clock.set(300);
        let second_id = second.id().expect("created records have ids");
        self.backend.delete(&scope, second_id).await.expect("delete succeeds");

        let purged = self
            .backend
            .purge_deleted(&scope, Some(250))
            .await
            .expect("purge succeeds");
        assert_eq!(purged, 1);

        let all = self.list(&scope, ListQuery::builder().include_deleted(true).build()).await;
        assert_eq!(all.records.iter().filter(|r| r.is_deleted()).count(), 1);
        assert_eq!(all.total_count, 1);

        let purged = self
            .backend
            .purge_deleted(&scope, None)
            .await
            .expect("purge succeeds");
        assert_eq!(purged, 1);
        assert_eq!(self.timestamp(&scope).await, 300);
    }

    pub async fn dotted_paths_are_resolved(&self) {
        let scope = self.scope("dotted");

        let zoe = self.create(&scope, json!({"author": {"name": "Zoe"}})).await;
        let ada = self.create(&scope, json!({"author": {"name": "Ada"}})).await;
        let anon = self.create(&scope, json!({"author": "anonymous"})).await;

        let page = self
            .list(
                &scope,
                ListQuery::builder().filter(Filter::eq("author.name", "Ada")).build(),
            )
            .await;
        assert_eq!(page.records, vec![ada.clone()]);

        let page = self
            .list(
                &scope,
                ListQuery::builder().sort("author.name", SortDirection::Asc).build(),
            )
            .await;
        assert_eq!(ids(&page.records), ids(&[ada, zoe, anon]));
    }

    pub async fn value_kinds_are_ordered(&self) {
        let scope = self.scope("kinds");

        let values = [
            json!({"a": 1}),
            json!([1]),
            json!(true),
            json!("b"),
            json!(2),
            json!(1.5),
            Value::Null,
        ];
        for (n, value) in values.into_iter().enumerate() {
            self.create(&scope, json!({"v": value, "n": n})).await;
        }
        self.create(&scope, json!({"n": 7})).await;

        let page = self
            .list(&scope, ListQuery::builder().sort("v", SortDirection::Asc).build())
            .await;
        let order: Vec<Value> = page
            .records
            .iter()
            .map(|record| record.get("n").cloned().unwrap_or(Value::Null))
            .collect();
        assert_eq!(
            order[..6],
            [json!(5), json!(4), json!(3), json!(2), json!(1), json!(0)]
        );
        assert_eq!(order.len(), 8);

        let above = self
            .list(&scope, ListQuery::builder().filter(Filter::gt("v", "a")).build())
            .await;
        assert_eq!(above.total_count, 6);

        let below = self
            .list(&scope, ListQuery::builder().filter(Filter::lt("v", 2)).build())
            .await;
        assert_eq!(field(&below.records, "n"), vec![Some(&json!(5))]);

        let same = self
            .list(&scope, ListQuery::builder().filter(Filter::eq("v", json!([1]))).build())
            .await;
        assert_eq!(field(&same.records, "n"), vec![Some(&json!(1))]);
    }

    pub async fn container_sort_keys_paginate(&self) {
        let scope = self.scope("containers");

        let values = [
            json!([3]),
            json!([1]),
            json!([1, 2]),
            json!({"k": "v"}),
            json!([2]),
            json!([10]),
            json!("x"),
        ];
        for (n, value) in values.into_iter().enumerate() {
            self.create(&scope, json!({"tags": value, "n": n})).await;
        }
        self.create(&scope, json!({"n": 7})).await;
        self.create(&scope, json!({"tags": [2], "n": 8})).await;

        let sorting = vec![Sort::asc("tags"), Sort::desc("n")];
        let mut seen = Vec::new();
        let mut query = ListQuery::builder().sorting(sorting.clone()).limit(2).build();
        loop {
            let page = self.list(&scope, query.clone()).await;
            assert_eq!(page.total_count, 9);
            let Some(rules) = page.next_pagination_rules(&sorting) else {
                break;
            };
            seen.extend(page.records.iter().filter_map(|record| record.get("n").cloned()));
            query.pagination_rules = rules;
        }
        assert_eq!(
            seen,
            [6, 2, 5, 1, 8, 4, 0, 3, 7].map(|n| json!(n)).to_vec()
        );

        let sorting = vec![Sort::desc("tags")];
        let everything = self
            .list(&scope, ListQuery::builder().sorting(sorting.clone()).build())
            .await;
        let mut seen = Vec::new();
        let mut query = ListQuery::builder().sorting(sorting.clone()).limit(3).build();
        loop {
            let page = self.list(&scope, query.clone()).await;
            let Some(rules) = page.next_pagination_rules(&sorting) else {
                break;
            };
            seen.extend(ids(&page.records));
            query.pagination_rules = rules;
        }
        assert_eq!(seen, ids(&everything.records));

        let above = self
            .list(&scope, ListQuery::builder().filter(Filter::gt("tags", json!([2]))).build())
            .await;
        assert_eq!(sorted_numbers(field(&above.records, "n")), vec![0, 3, 7]);
    }

    /// Checks of a backend built read-only. Call instead of [`run`](Self::run).
    pub async fn run_readonly(&self) {
        let scope = self.scope("readonly");
        let id = Uuid::new_v4().to_string();

        let readonly = |result: Result<(), StorageError>| {
            assert!(
                matches!(result, Err(StorageError::Readonly(_))),
                "expected a read-only error, got {result:?}"
            );
        };

        readonly(self.backend.collection_timestamp(&scope).await.map(drop));
        readonly(self.backend.create(&scope, record(json!({})), &[]).await.map(drop));
        readonly(
            self.backend
                .update(&scope, &id, record(json!({})), &[])
                .await
                .map(drop),
        );
        readonly(self.backend.delete(&scope, &id).await.map(drop));
        readonly(self.backend.delete_all(&scope, &[]).await.map(drop));
        readonly(self.backend.purge_deleted(&scope, None).await.map(drop));

        assert!(self.list(&scope, ListQuery::new()).await.is_empty());
        assert!(self.backend.get(&scope, &id).await.unwrap_err().is_not_found());
        assert!(self.backend.ping().await, "read-only ping on a healthy backend");
    }
}
