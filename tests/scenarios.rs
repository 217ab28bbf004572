//! End-to-end replication scenarios: dump on a source warehouse, load into
//! one or more replicas, and compare what each side holds.

mod common;

use std::sync::Arc;

use common::{FlakyCatalog, Replica, SourceCluster, SOURCE_DB};
use wharf::catalog::{ObjectRef, PartitionSpec, CHECKPOINT_KEY, LAST_REPL_ID_KEY, SOURCE_OF_REPLICATION};
use wharf::dump::DumpRequest;
use wharf::event::EventId;
use wharf::load::{LoadOptions, LoadRequest};
use wharf::ErrorCode;

#[tokio::test]
async fn test_replaying_a_loaded_dump_changes_nothing() {
    let source = SourceCluster::new().await;
    source.wh.create_table(SOURCE_DB, "t1", &[("a", "string")], &[]).await.unwrap();
    let bootstrap = source.dump(None).await;

    source.wh.insert(SOURCE_DB, "t1", None, &["one"]).await.unwrap();
    source.wh.insert(SOURCE_DB, "t1", None, &["two"]).await.unwrap();
    let inc = source.dump(Some(bootstrap.last_event_id.clone())).await;

    let replica = Replica::new(&source);
    replica.load("r", &bootstrap.dump_root).await.unwrap();
    let first = replica.load("r", &inc.dump_root).await.unwrap();
    assert!(first.applied_ops > 0);
    let checkpoint = replica.property(&ObjectRef::database("r"), CHECKPOINT_KEY).await;

    let again = replica.load("r", &inc.dump_root).await.unwrap();
    assert_eq!(again.applied_ops, 0);
    assert_eq!(again.last_event_id, inc.last_event_id);
    assert_eq!(replica.rows("r", "t1").await, vec!["one", "two"]);
    assert_eq!(
        replica.property(&ObjectRef::database("r"), CHECKPOINT_KEY).await,
        checkpoint
    );
    assert_eq!(replica.status("r", None).await, Some(inc.last_event_id));
}

#[tokio::test]
async fn test_event_ids_order_numerically_across_digit_widths() {
    let source = SourceCluster::new().await;
    source.wh.create_table(SOURCE_DB, "t1", &[("a", "string")], &[]).await.unwrap();
    let bootstrap = source.dump(None).await;

    // Enough overwrites to cross from one-digit to two-digit ids
    for i in 0..12 {
        let row = format!("v{}", i);
        source
            .wh
            .insert_overwrite(SOURCE_DB, "t1", None, &[row.as_str()])
            .await
            .unwrap();
    }
    let head = source.head().await;
    assert!(head > EventId::from(10));
    assert!(EventId::from(9) < EventId::from(10));

    let inc = source.dump(Some(bootstrap.last_event_id.clone())).await;
    let replica = Replica::new(&source);
    replica.load("r", &bootstrap.dump_root).await.unwrap();
    replica.load("r", &inc.dump_root).await.unwrap();

    assert_eq!(replica.rows("r", "t1").await, vec!["v11"]);
    assert_eq!(replica.status("r", None).await, Some(head));
}

#[tokio::test]
async fn test_retired_events_force_a_new_bootstrap() {
    let source = SourceCluster::new().await;
    source.wh.create_table(SOURCE_DB, "t1", &[("a", "string")], &[]).await.unwrap();
    let bootstrap = source.dump(None).await;

    source.wh.insert(SOURCE_DB, "t1", None, &["a"]).await.unwrap();
    source.wh.insert(SOURCE_DB, "t1", None, &["b"]).await.unwrap();
    let head = source.head().await;
    source.wh.log().retire_before(&head).await.unwrap();

    let err = source
        .dump_with(DumpRequest {
            db_pattern: SOURCE_DB.to_string(),
            from: Some(bootstrap.last_event_id),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RetentionGap);
    assert!(err.requires_redump());
}

#[tokio::test]
async fn test_truncated_data_is_served_from_cm() {
    let source = SourceCluster::new().await;
    source.wh.create_table(SOURCE_DB, "t1", &[("a", "string")], &[]).await.unwrap();
    source.wh.insert(SOURCE_DB, "t1", None, &["ten"]).await.unwrap();
    let bootstrap = source.dump(None).await;

    source.wh.truncate_table(SOURCE_DB, "t1").await.unwrap();
    assert!(source.rows("t1").await.is_empty());

    let replica = Replica::new(&source);
    replica.load("r", &bootstrap.dump_root).await.unwrap();
    assert_eq!(replica.rows("r", "t1").await, vec!["ten"]);
}

#[tokio::test]
async fn test_identical_files_both_survive_recycling() {
    let source = SourceCluster::new().await;
    source.wh.create_table(SOURCE_DB, "t1", &[("a", "string")], &[]).await.unwrap();
    source.wh.insert(SOURCE_DB, "t1", None, &["same"]).await.unwrap();
    source.wh.insert(SOURCE_DB, "t1", None, &["same"]).await.unwrap();
    let bootstrap = source.dump(None).await;

    source.wh.truncate_table(SOURCE_DB, "t1").await.unwrap();

    let replica = Replica::new(&source);
    replica.load("r", &bootstrap.dump_root).await.unwrap();
    assert_eq!(replica.rows("r", "t1").await, vec!["same", "same"]);
}

#[tokio::test]
async fn test_failed_load_resumes_without_redoing_applied_objects() {
    let source = SourceCluster::new().await;
    for name in ["t1", "t2", "t3"] {
        source.wh.create_table(SOURCE_DB, name, &[("a", "string")], &[]).await.unwrap();
        source.wh.insert(SOURCE_DB, name, None, &[name]).await.unwrap();
    }
    let bootstrap = source.dump(None).await;

    let replica = Replica::new(&source);
    let flaky = Arc::new(FlakyCatalog::new(replica.catalog.clone()));
    flaky.fail_next_create("t2");
    let planner = replica.planner_with(flaky.clone());
    let request = LoadRequest {
        target_db: "r".into(),
        dump_root: bootstrap.dump_root.clone(),
        options: LoadOptions {
            parallel: false,
            ..Default::default()
        },
    };

    let err = planner.load(&request).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Catalog);
    assert!(replica.status("r", None).await.is_none());
    assert_eq!(replica.rows("r", "t1").await, vec!["t1"]);

    let result = planner.load(&request).await.unwrap();
    assert_eq!(flaky.create_calls("t1"), 1);
    assert_eq!(flaky.create_calls("t2"), 2);
    assert!(result.skipped_steps >= 2);
    for name in ["t1", "t2", "t3"] {
        assert_eq!(replica.rows("r", name).await, vec![name]);
    }
    assert_eq!(replica.status("r", None).await, Some(result.last_event_id));
}

#[tokio::test]
async fn test_limited_dumps_chain_to_the_unbounded_result() {
    let source = SourceCluster::new().await;
    source
        .wh
        .create_table(SOURCE_DB, "t1", &[("a", "string")], &[("p", "string")])
        .await
        .unwrap();
    let bootstrap = source.dump(None).await;

    let jan = PartitionSpec::new(&[("p", "jan")]);
    let feb = PartitionSpec::new(&[("p", "feb")]);
    source.wh.insert(SOURCE_DB, "t1", Some(&jan), &["1"]).await.unwrap();
    source.wh.insert(SOURCE_DB, "t1", Some(&feb), &["2"]).await.unwrap();
    source.wh.insert(SOURCE_DB, "t1", Some(&jan), &["3"]).await.unwrap();
    source.wh.create_table(SOURCE_DB, "t2", &[("a", "string")], &[]).await.unwrap();
    source.wh.insert(SOURCE_DB, "t2", None, &["4"]).await.unwrap();

    let first = source
        .dump_with(DumpRequest {
            db_pattern: SOURCE_DB.to_string(),
            from: Some(bootstrap.last_event_id.clone()),
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    let rest = source.dump(Some(first.last_event_id.clone())).await;
    let whole = source.dump(Some(bootstrap.last_event_id.clone())).await;
    assert_eq!(rest.last_event_id, whole.last_event_id);

    let chained = Replica::new(&source);
    chained.load("r", &bootstrap.dump_root).await.unwrap();
    chained.load("r", &first.dump_root).await.unwrap();
    assert_eq!(chained.status("r", None).await, Some(first.last_event_id));
    chained.load("r", &rest.dump_root).await.unwrap();

    let single = Replica::new(&source);
    single.load("r", &bootstrap.dump_root).await.unwrap();
    single.load("r", &whole.dump_root).await.unwrap();

    for table in ["t1", "t2"] {
        assert_eq!(chained.rows("r", table).await, single.rows("r", table).await);
    }
    assert_eq!(chained.rows("r", "t2").await, vec!["4"]);
    assert_eq!(
        chained.status("r", None).await,
        single.status("r", None).await
    );
}

#[tokio::test]
async fn test_table_load_status_is_independent_of_database() {
    let source = SourceCluster::new().await;
    source.wh.create_table(SOURCE_DB, "t1", &[("a", "string")], &[]).await.unwrap();
    source.wh.create_table(SOURCE_DB, "t2", &[("a", "string")], &[]).await.unwrap();
    let bootstrap = source.dump(None).await;

    source.wh.insert(SOURCE_DB, "t1", None, &["x"]).await.unwrap();
    source.wh.insert(SOURCE_DB, "t2", None, &["y"]).await.unwrap();
    let inc = source.dump(Some(bootstrap.last_event_id.clone())).await;

    let replica = Replica::new(&source);
    replica.load("r", &bootstrap.dump_root).await.unwrap();
    replica
        .load_with(
            "r",
            &inc.dump_root,
            LoadOptions {
                table: Some("t1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(replica.status("r", Some("t1")).await, Some(inc.last_event_id.clone()));
    assert_eq!(replica.status("r", None).await, Some(bootstrap.last_event_id.clone()));
    assert_eq!(replica.rows("r", "t1").await, vec!["x"]);
    assert!(replica.rows("r", "t2").await.is_empty());

    let db_load = replica.load("r", &inc.dump_root).await.unwrap();
    assert!(db_load.skipped_steps >= 1);
    assert_eq!(replica.rows("r", "t1").await, vec!["x"]);
    assert_eq!(replica.rows("r", "t2").await, vec!["y"]);
    assert_eq!(replica.status("r", None).await, Some(inc.last_event_id));
}

#[tokio::test]
async fn test_replica_is_not_a_replication_source() {
    let source = SourceCluster::new().await;
    source.wh.create_table(SOURCE_DB, "t1", &[("a", "string")], &[]).await.unwrap();
    let bootstrap = source.dump(None).await;

    let replica = Replica::new(&source);
    replica.load("r", &bootstrap.dump_root).await.unwrap();

    let db = ObjectRef::database("r");
    assert!(replica.property(&db, SOURCE_OF_REPLICATION).await.is_none());
    assert_eq!(
        replica.property(&db, LAST_REPL_ID_KEY).await,
        Some(bootstrap.last_event_id.to_string())
    );
    let t1 = replica.table("r", "t1").await.unwrap();
    assert!(!t1.properties.contains_key(SOURCE_OF_REPLICATION));
}

#[tokio::test]
async fn test_resume_does_not_replay_data_of_a_dropped_table() {
    let source = SourceCluster::new().await;
    let bootstrap = source.dump(None).await;

    let b1 = PartitionSpec::new(&[("b", "1")]);
    let keys = [("b", "string")];
    source.wh.create_table(SOURCE_DB, "ptned", &[("a", "string")], &keys).await.unwrap();
    source.wh.insert(SOURCE_DB, "ptned", Some(&b1), &["old"]).await.unwrap();
    source.wh.drop_table(SOURCE_DB, "ptned").await.unwrap();
    source.wh.create_table(SOURCE_DB, "ptned", &[("a", "string")], &keys).await.unwrap();
    source.wh.insert(SOURCE_DB, "ptned", Some(&b1), &["new"]).await.unwrap();
    let last_insert = source.head().await;
    let inc = source.dump(Some(bootstrap.last_event_id.clone())).await;

    let replica = Replica::new(&source);
    replica.load("r", &bootstrap.dump_root).await.unwrap();

    let flaky = Arc::new(FlakyCatalog::new(replica.catalog.clone()));
    flaky.fail_next_stamp(ObjectRef::partition("r", "ptned", b1.clone()), last_insert);
    let planner = replica.planner_with(flaky.clone());
    let request = LoadRequest {
        target_db: "r".into(),
        dump_root: inc.dump_root.clone(),
        options: LoadOptions {
            parallel: false,
            ..Default::default()
        },
    };

    let err = planner.load(&request).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::State);
    assert_eq!(replica.rows("r", "ptned").await, vec!["new"]);

    planner.load(&request).await.unwrap();
    assert_eq!(source.rows("ptned").await, vec!["new"]);
    assert_eq!(replica.rows("r", "ptned").await, vec!["new"]);
    assert_eq!(replica.status("r", None).await, Some(inc.last_event_id));
}

/// Source with partitioned and plain tables touched by several events
async fn busy_source() -> (SourceCluster, wharf::dump::DumpResult) {
    let source = SourceCluster::new().await;
    let jan = PartitionSpec::new(&[("p", "jan")]);
    let feb = PartitionSpec::new(&[("p", "feb")]);
    source
        .wh
        .create_table(SOURCE_DB, "ptned", &[("a", "string")], &[("p", "string")])
        .await
        .unwrap();
    source.wh.create_table(SOURCE_DB, "unptned", &[("a", "string")], &[]).await.unwrap();
    source.wh.insert(SOURCE_DB, "ptned", Some(&jan), &["1"]).await.unwrap();
    source.wh.insert(SOURCE_DB, "unptned", None, &["ten"]).await.unwrap();
    let bootstrap = source.dump(None).await;

    source.wh.insert(SOURCE_DB, "ptned", Some(&feb), &["2"]).await.unwrap();
    source.wh.insert_overwrite(SOURCE_DB, "ptned", Some(&jan), &["3"]).await.unwrap();
    source.wh.insert(SOURCE_DB, "unptned", None, &["eleven"]).await.unwrap();
    source.wh.truncate_partition(SOURCE_DB, "ptned", &feb).await.unwrap();
    source.wh.create_table(SOURCE_DB, "later", &[("a", "string")], &[]).await.unwrap();
    source.wh.insert(SOURCE_DB, "later", None, &["x"]).await.unwrap();
    (source, bootstrap)
}

fn one_op_per_iteration() -> LoadOptions {
    LoadOptions {
        max_ops_per_iteration: 1,
        move_optimization: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_bootstrap_load_across_many_iterations() {
    let (source, bootstrap) = busy_source().await;

    let replica = Replica::new(&source);
    let first = replica
        .load_with("r", &bootstrap.dump_root, one_op_per_iteration())
        .await
        .unwrap();
    assert!(first.iterations > 2);
    assert_eq!(replica.rows("r", "ptned").await, vec!["1"]);
    assert_eq!(replica.rows("r", "unptned").await, vec!["ten"]);

    let again = replica
        .load_with("r", &bootstrap.dump_root, one_op_per_iteration())
        .await
        .unwrap();
    assert_eq!(again.applied_ops, 0);
    assert_eq!(replica.status("r", None).await, Some(bootstrap.last_event_id));
}

#[tokio::test]
async fn test_incremental_load_with_move_optimization_across_iterations() {
    let (source, bootstrap) = busy_source().await;
    let inc = source.dump(Some(bootstrap.last_event_id.clone())).await;

    let optimized = Replica::new(&source);
    optimized
        .load_with("r", &bootstrap.dump_root, one_op_per_iteration())
        .await
        .unwrap();
    let result = optimized
        .load_with("r", &inc.dump_root, one_op_per_iteration())
        .await
        .unwrap();
    assert!(result.iterations >= 6);

    let plain = Replica::new(&source);
    plain.load("r", &bootstrap.dump_root).await.unwrap();
    plain.load("r", &inc.dump_root).await.unwrap();

    for table in ["ptned", "unptned", "later"] {
        assert_eq!(optimized.rows("r", table).await, source.rows(table).await);
        assert_eq!(optimized.rows("r", table).await, plain.rows("r", table).await);
    }
    assert_eq!(optimized.rows("r", "ptned").await, vec!["3"]);

    let again = optimized
        .load_with("r", &inc.dump_root, one_op_per_iteration())
        .await
        .unwrap();
    assert_eq!(again.applied_ops, 0);
    assert_eq!(optimized.status("r", None).await, Some(inc.last_event_id));

    // Staging is cleaned up after each load
    let staging = optimized.root().join(".staging");
    assert!(!staging.exists() || std::fs::read_dir(&staging).unwrap().next().is_none());
}
