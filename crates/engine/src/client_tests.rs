//! End-to-end tests for the query client.
//!
//! Operations run against `MemoryStore` over the platform schema; the store
//! records every batch and keeps side-effect counters. A `mockall` executor
//! covers the paths that must never reach storage.

use std::sync::Arc;

use async_trait::async_trait;
use mockall::mock;
use schema::platform::platform_registry;
use serde_json::{json, Value as Json};
use storage::{Batch, MemoryStore, Outcome, Statement, StorageError, StorageExecutor};

use crate::{Client, ClientConfig, Descriptor, Operation, QueryError};

mock! {
    pub Executor {}

    #[async_trait]
    impl StorageExecutor for Executor {
        async fn execute(&self, batch: Batch) -> Result<Vec<Outcome>, StorageError>;
    }
}

fn setup() -> (Client, Arc<MemoryStore>) {
    setup_with(ClientConfig::default())
}

fn setup_with(config: ClientConfig) -> (Client, Arc<MemoryStore>) {
    let registry = Arc::new(platform_registry().expect("platform schema"));
    let store = Arc::new(MemoryStore::new(registry.clone()));
    let client = Client::new(registry, store.clone(), config).expect("valid config");
    (client, store)
}

fn ids(rows: &[Json]) -> Vec<&str> {
    rows.iter().filter_map(|row| row["id"].as_str()).collect()
}

async fn seed_users(client: &Client, n: usize) {
    let data: Vec<Json> = (1..=n)
        .map(|i| json!({"id": format!("u{i}"), "clerkId": format!("c{i}"), "email": format!("u{i}@x.com")}))
        .collect();
    client
        .entity("User")
        .create_many(json!({ "data": data }))
        .await
        .expect("seed users");
}

async fn seed_workflows(client: &Client, names: &[&str]) {
    let data: Vec<Json> = names
        .iter()
        .enumerate()
        .map(|(i, name)| json!({"id": format!("w{}", i + 1), "userId": "u1", "name": name, "eventName": "run"}))
        .collect();
    client
        .entity("Workflow")
        .create_many(json!({ "data": data }))
        .await
        .expect("seed workflows");
}

// ============================================================
// Reads
// ============================================================

#[tokio::test]
async fn find_unique_sees_created_rows_until_deleted() {
    let (client, _) = setup();
    let users = client.entity("User");
    let created = users
        .create(json!({"data": {"clerkId": "c1", "email": "a@x.com"}}))
        .await
        .unwrap();

    for filter in [json!({"email": "a@x.com"}), json!({"clerkId": "c1"}), json!({"id": created["id"]})] {
        let found = users.find_unique(json!({ "where": filter })).await.unwrap();
        assert_eq!(found.as_ref(), Some(&created));
    }

    let deleted = users.delete(json!({"where": {"email": "a@x.com"}})).await.unwrap();
    assert_eq!(deleted, created);
    assert_eq!(users.find_unique(json!({"where": {"email": "a@x.com"}})).await.unwrap(), None);
    let err = users
        .find_unique_or_throw(json!({"where": {"email": "a@x.com"}}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        QueryError::NotFound {
            entity: "User".into(),
            operation: "findUniqueOrThrow".into()
        }
    );
}

#[tokio::test]
async fn and_is_the_intersection_of_its_parts() {
    let (client, _) = setup();
    seed_users(&client, 1).await;
    seed_workflows(&client, &["alpha", "beta", "apex", "gamma"]).await;
    let workflows = client.entity("Workflow");
    workflows
        .update_many(json!({"where": {"name": {"in": ["apex", "gamma"]}}, "data": {"status": "RUNNING"}}))
        .await
        .unwrap();

    let left = json!({"name": {"startsWith": "a"}});
    let right = json!({"status": "RUNNING"});
    let both = workflows
        .find_many(json!({"where": {"AND": [left.clone(), right.clone()]}}))
        .await
        .unwrap();
    let left = workflows.find_many(json!({ "where": left })).await.unwrap();
    let right = workflows.find_many(json!({ "where": right })).await.unwrap();

    let expected: Vec<&str> = ids(&left).into_iter().filter(|id| ids(&right).contains(id)).collect();
    assert_eq!(ids(&both), expected);
    assert_eq!(ids(&both), vec!["w3"]);
}

#[tokio::test]
async fn returned_timestamps_find_their_row() {
    let (client, _) = setup();
    let users = client.entity("User");
    let created = users
        .create(json!({"data": {"clerkId": "c1", "email": "a@x.com"}}))
        .await
        .unwrap();

    for filter in [created["createdAt"].clone(), json!({"lte": created["createdAt"]})] {
        let found = users.find_many(json!({"where": {"createdAt": filter}})).await.unwrap();
        assert_eq!(found, vec![created.clone()]);
    }
}

#[tokio::test]
async fn not_blocks_and_not_fields_both_skip_null() {
    let (client, _) = setup();
    seed_users(&client, 2).await;
    let users = client.entity("User");
    users
        .update(json!({"where": {"id": "u2"}, "data": {"name": "y"}}))
        .await
        .unwrap();

    let field = users.find_many(json!({"where": {"name": {"not": "x"}}})).await.unwrap();
    let block = users.find_many(json!({"where": {"NOT": {"name": "x"}}})).await.unwrap();
    assert_eq!(ids(&field), vec!["u2"]);
    assert_eq!(ids(&block), ids(&field));

    let nulls = users.count(json!({"where": {"NOT": {"name": {"not": null}}}})).await.unwrap();
    assert_eq!(nulls, 1);
}

#[tokio::test]
async fn select_returns_exactly_the_selected_keys() {
    let (client, _) = setup();
    seed_users(&client, 2).await;
    let rows = client
        .entity("User")
        .find_many(json!({"select": {"id": true}}))
        .await
        .unwrap();
    assert_eq!(rows, vec![json!({"id": "u1"}), json!({"id": "u2"})]);
}

#[tokio::test]
async fn include_leaves_scalars_untouched() {
    let (client, _) = setup();
    seed_users(&client, 2).await;
    seed_workflows(&client, &["a", "b"]).await;
    let users = client.entity("User");

    let plain = users.find_many(json!({})).await.unwrap();
    let mut included = users
        .find_many(json!({"include": {"workflows": {"select": {"name": true}}}}))
        .await
        .unwrap();
    assert_eq!(included[0]["workflows"], json!([{"name": "a"}, {"name": "b"}]));
    assert_eq!(included[1]["workflows"], json!([]));
    for row in &mut included {
        row.as_object_mut().unwrap().remove("workflows");
    }
    assert_eq!(included, plain);
}

#[tokio::test]
async fn global_omit_hides_fields_unless_selected() {
    let mut config = ClientConfig::default();
    config.omit.insert("User".into(), vec!["clerkId".into()]);
    let (client, _) = setup_with(config);
    seed_users(&client, 1).await;
    let users = client.entity("User");

    let row = users.find_first(json!({})).await.unwrap().unwrap();
    assert!(row.get("clerkId").is_none());
    let row = users
        .find_first(json!({"omit": {"clerkId": false}}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["clerkId"], "c1");
}

#[tokio::test]
async fn cursors_are_inclusive_and_take_sets_the_direction() {
    let (client, _) = setup();
    seed_users(&client, 5).await;
    let users = client.entity("User");

    let page = |args: Json| {
        let users = users.clone();
        async move { users.find_many(args).await.unwrap() }
    };
    let rows = page(json!({"cursor": {"id": "u3"}, "take": 2})).await;
    assert_eq!(ids(&rows), vec!["u3", "u4"]);
    let rows = page(json!({"cursor": {"id": "u3"}, "take": 2, "skip": 1})).await;
    assert_eq!(ids(&rows), vec!["u4", "u5"]);
    let rows = page(json!({"cursor": {"id": "u3"}, "take": -2})).await;
    assert_eq!(ids(&rows), vec!["u2", "u3"]);
    let rows = page(json!({"orderBy": {"email": "desc"}, "take": -2})).await;
    assert_eq!(ids(&rows), vec!["u2", "u1"]);
}

#[tokio::test]
async fn counts_and_relation_counts_agree() {
    let (client, _) = setup();
    seed_users(&client, 2).await;
    seed_workflows(&client, &["a", "b", "c"]).await;

    assert_eq!(client.entity("Workflow").count(json!({})).await.unwrap(), 3);
    let users = client
        .entity("User")
        .find_many(json!({
            "where": {"workflows": {"some": {"name": {"in": ["a", "c"]}}}},
            "select": {"id": true, "_count": {"select": {"workflows": true}}}
        }))
        .await
        .unwrap();
    assert_eq!(users, vec![json!({"id": "u1", "_count": {"workflows": 3}})]);
}

// ============================================================
// Writes
// ============================================================

#[tokio::test]
async fn create_many_rows_are_found_exactly_once() {
    let (client, _) = setup();
    let users = client.entity("User");
    let inserted = users
        .create_many(json!({"data": [
            {"clerkId": "c1", "email": "a@x.com"},
            {"clerkId": "c2", "email": "b@x.com"}
        ]}))
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let rows = users
        .find_many(json!({"where": {"OR": [{"email": "a@x.com"}, {"email": "b@x.com"}]}}))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_ne!(rows[0]["id"], rows[1]["id"]);
}

#[tokio::test]
async fn duplicate_unique_value_names_the_constraint() {
    let (client, _) = setup();
    let users = client.entity("User");
    users
        .create(json!({"data": {"clerkId": "c1", "email": "a@x.com"}}))
        .await
        .unwrap();
    let err = users
        .create(json!({"data": {"clerkId": "c2", "email": "a@x.com"}}))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, QueryError::UniqueConstraintViolation { constraint, fields, .. }
            if constraint == "email" && fields == &vec!["email".to_string()]),
        "{err:?}"
    );
}

#[tokio::test]
async fn update_many_limit_takes_the_lowest_identity() {
    let (client, store) = setup();
    seed_users(&client, 1).await;
    seed_workflows(&client, &["x", "x", "x"]).await;

    let updated = client
        .entity("Workflow")
        .update_many(json!({"where": {"name": "x"}, "data": {"name": "y"}, "limit": 1}))
        .await
        .unwrap();
    assert_eq!(updated, 1);
    let renamed: Vec<_> = store
        .rows("Workflow")
        .into_iter()
        .filter(|row| row["name"] == schema::Value::from("y"))
        .collect();
    assert_eq!(renamed.len(), 1);
    assert_eq!(renamed[0]["id"], schema::Value::from("w1"));
}

#[tokio::test]
async fn upsert_on_a_new_key_only_creates() {
    let (client, store) = setup();
    let row = client
        .entity("User")
        .upsert(json!({
            "where": {"email": "n@x.com"},
            "create": {"clerkId": "cn", "email": "n@x.com"},
            "update": {"name": "updated"}
        }))
        .await
        .unwrap();
    assert_eq!(row["email"], "n@x.com");
    assert_eq!(row["name"], Json::Null);
    let stats = store.stats();
    assert_eq!((stats.upsert_creates, stats.upsert_updates), (1, 0));
}

#[tokio::test]
async fn nested_create_runs_as_one_atomic_batch() {
    let (client, store) = setup();
    let user = client
        .entity("User")
        .create(json!({
            "data": {
                "clerkId": "c1",
                "email": "a@x.com",
                "workflows": {"create": [{"name": "a", "eventName": "e"}, {"name": "b", "eventName": "e"}]}
            },
            "include": {"workflows": true}
        }))
        .await
        .unwrap();
    assert_eq!(user["workflows"].as_array().map(Vec::len), Some(2));
    assert_eq!(user["workflows"][0]["userId"], user["id"]);
    assert_eq!(store.call_count(), 1);
    assert!(store.calls()[0].atomic);
}

#[tokio::test]
async fn failed_connect_rolls_back_the_whole_write() {
    let (client, store) = setup();
    seed_users(&client, 1).await;
    let err = client
        .entity("Workflow")
        .create(json!({"data": {"name": "w", "eventName": "e", "user": {"connect": {"email": "nobody@x.com"}}}}))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::NotFound { .. }), "{err:?}");
    assert!(store.rows("Workflow").is_empty());
}

#[tokio::test]
async fn referential_actions_restrict_and_cascade() {
    let (client, store) = setup();
    seed_users(&client, 1).await;
    seed_workflows(&client, &["a"]).await;
    client
        .entity("WorkflowRun")
        .create(json!({"data": {"workflowId": "w1", "userId": "u1", "inngestRunId": "i1"}}))
        .await
        .unwrap();
    let err = client
        .entity("Workflow")
        .delete(json!({"where": {"id": "w1"}}))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::ForeignKeyViolation { .. }), "{err:?}");

    client
        .entity("Credential")
        .create(json!({"data": {
            "id": "cr1", "userId": "u1", "name": "gmail", "type": "OAUTH", "provider": "GOOGLE",
            "workflows": {"create": {"workflowId": "w1"}}
        }}))
        .await
        .unwrap();
    assert_eq!(store.rows("WorkflowCredential").len(), 1);
    client
        .entity("Credential")
        .delete(json!({"where": {"userId_name": {"userId": "u1", "name": "gmail"}}}))
        .await
        .unwrap();
    assert!(store.rows("WorkflowCredential").is_empty());
}

#[tokio::test]
async fn nested_delete_many_replaces_a_workflows_credentials() {
    let (client, store) = setup();
    seed_users(&client, 1).await;
    seed_workflows(&client, &["a", "b"]).await;
    for (id, name) in [("cr1", "gmail"), ("cr2", "slack"), ("cr3", "notion")] {
        client
            .entity("Credential")
            .create(json!({"data": {"id": id, "userId": "u1", "name": name, "type": "OAUTH", "provider": "GOOGLE"}}))
            .await
            .unwrap();
    }
    client
        .entity("WorkflowCredential")
        .create_many(json!({"data": [
            {"workflowId": "w1", "credentialId": "cr1"},
            {"workflowId": "w1", "credentialId": "cr2"},
            {"workflowId": "w2", "credentialId": "cr1"}
        ]}))
        .await
        .unwrap();

    let updated = client
        .entity("Workflow")
        .update(json!({
            "where": {"id": "w1"},
            "data": {"credentials": {"create": [{"credentialId": "cr3"}], "deleteMany": {}}},
            "include": {"credentials": {"select": {"credentialId": true}}}
        }))
        .await
        .unwrap();
    assert_eq!(updated["credentials"], json!([{"credentialId": "cr3"}]));
    // Links of other workflows are untouched.
    assert_eq!(store.rows("WorkflowCredential").len(), 2);
    let batch = store.calls().pop().unwrap();
    assert!(batch.atomic);
    let position = |wanted: fn(&Statement) -> bool| batch.statements.iter().position(wanted).unwrap();
    assert!(position(|s| matches!(s, Statement::Delete { .. })) < position(|s| matches!(s, Statement::Insert { .. })));

    client
        .entity("Workflow")
        .update(json!({"where": {"id": "w2"}, "data": {"credentials": {"deleteMany": [{"credentialId": "cr2"}]}}}))
        .await
        .unwrap();
    assert_eq!(store.rows("WorkflowCredential").len(), 2);
}

#[tokio::test]
async fn missing_single_row_update_is_not_found() {
    let (client, _) = setup();
    let err = client
        .entity("User")
        .update(json!({"where": {"id": "ghost"}, "data": {"name": "x"}}))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::NotFound { ref entity, .. } if entity == "User"), "{err:?}");
}

// ============================================================
// Aggregation
// ============================================================

async fn seed_runs(client: &Client) {
    seed_users(client, 1).await;
    seed_workflows(client, &["a"]).await;
    let runs: Vec<Json> = [("COMPLETED", 10), ("COMPLETED", 30), ("FAILED", 5)]
        .iter()
        .enumerate()
        .map(|(i, (status, duration))| {
            json!({
                "workflowId": "w1", "userId": "u1", "inngestRunId": format!("i{i}"),
                "status": status, "duration": duration
            })
        })
        .collect();
    client
        .entity("WorkflowRun")
        .create_many(json!({ "data": runs }))
        .await
        .unwrap();
}

#[tokio::test]
async fn aggregate_summarises_the_filtered_rows() {
    let (client, _) = setup();
    seed_runs(&client).await;
    let runs = client.entity("WorkflowRun");

    let summary = runs
        .aggregate(json!({
            "where": {"status": "COMPLETED"},
            "_count": true, "_sum": {"duration": true}, "_avg": {"duration": true}, "_max": {"duration": true}
        }))
        .await
        .unwrap();
    assert_eq!(
        summary,
        json!({"_count": 2, "_sum": {"duration": 40}, "_avg": {"duration": 20.0}, "_max": {"duration": 30}})
    );

    let empty = runs
        .aggregate(json!({"where": {"status": "CANCELLED"}, "_count": true, "_min": {"duration": true}}))
        .await
        .unwrap();
    assert_eq!(empty, json!({"_count": 0, "_min": {"duration": null}}));
}

#[tokio::test]
async fn group_by_having_keeps_large_groups() {
    let (client, _) = setup();
    seed_runs(&client).await;
    let groups = client
        .entity("WorkflowRun")
        .group_by(json!({"by": ["status"], "_count": true, "having": {"_count": {"gt": 1}}}))
        .await
        .unwrap();
    assert_eq!(groups, vec![json!({"status": "COMPLETED", "_count": 2})]);

    let ordered = client
        .entity("WorkflowRun")
        .group_by(json!({
            "by": "status",
            "_sum": {"duration": true},
            "orderBy": {"_sum": {"duration": "asc"}},
            "take": 1
        }))
        .await
        .unwrap();
    assert_eq!(ordered, vec![json!({"status": "FAILED", "_sum": {"duration": 5}})]);
}

#[tokio::test]
async fn group_by_having_outside_by_is_rejected() {
    let (client, store) = setup();
    let err = client
        .entity("WorkflowRun")
        .group_by(json!({"by": ["status"], "having": {"userId": "u1"}}))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Validation { ref path, .. } if path == "having.userId"), "{err:?}");
    assert_eq!(store.call_count(), 0);
}

// ============================================================
// Executor boundary
// ============================================================

fn mocked(executor: MockExecutor) -> Client {
    let registry = Arc::new(platform_registry().unwrap());
    Client::new(registry, Arc::new(executor), ClientConfig::default()).unwrap()
}

#[tokio::test]
async fn validation_failures_never_reach_the_executor() {
    let mut executor = MockExecutor::new();
    executor.expect_execute().times(0);
    let client = mocked(executor);

    for (entity, operation, args) in [
        ("User", Operation::FindMany, json!({"where": {"emial": "a@x.com"}})),
        ("User", Operation::FindUnique, json!({"where": {"name": "a"}})),
        ("Nope", Operation::Count, json!({})),
        ("User", Operation::Create, json!({"data": {"email": "a@x.com"}})),
        ("Workflow", Operation::GroupBy, json!({"by": [], "_count": true})),
        ("Workflow", Operation::UpdateMany, json!({"data": {"name": "x"}, "limit": -1})),
    ] {
        let err = client.execute(entity, operation, &args).await.unwrap_err();
        assert!(matches!(err, QueryError::Validation { .. }), "{entity} {operation}: {err:?}");
    }
}

#[tokio::test]
async fn backend_failures_pass_through() {
    let mut executor = MockExecutor::new();
    executor
        .expect_execute()
        .times(1)
        .returning(|_| Err(StorageError::Backend("connection reset".into())));
    let client = mocked(executor);

    let err = client.entity("User").count(json!({})).await.unwrap_err();
    assert_eq!(err, QueryError::Storage(StorageError::Backend("connection reset".into())));
}

#[tokio::test]
async fn short_outcome_lists_are_reported() {
    let mut executor = MockExecutor::new();
    executor.expect_execute().returning(|_| Ok(Vec::new()));
    let client = mocked(executor);

    let err = client.entity("User").find_many(json!({})).await.unwrap_err();
    assert!(matches!(err, QueryError::Storage(StorageError::Backend(_))), "{err:?}");
}

#[tokio::test]
async fn descriptors_dispatch_like_direct_calls() {
    let (client, _) = setup();
    seed_users(&client, 2).await;
    let descriptor: Descriptor = serde_json::from_value(json!({
        "entity": "User",
        "operation": "count",
        "args": {"where": {"email": {"endsWith": "@x.com"}}}
    }))
    .unwrap();
    assert_eq!(client.dispatch(&descriptor).await.unwrap(), json!(2));
}
