use std::sync::Arc;
use std::time::Duration;

use catscan_core::clock::Clock;
use catscan_core::cursor::DependencySource;
use catscan_core::queue::WorkQueue;
use catscan_core::storage::{leaf_table, page_table};
use catscan_core::{DriverRegistry, PageScanResult, RegisteredDriver, StartOutcome};
use catscan_model::{DriverType, IndexScanState, ScanMessage, epoch};

mod support;

use support::{Harness, LeafStep, ScriptedDriver, at, leaf, publish, registry_with, test_config};

const DRIVER: &str = "package-assets";

fn two_pages() -> Vec<Vec<catscan_model::CatalogLeafItem>> {
    vec![
        vec![
            leaf("Alpha", "1.0.0", at(10)),
            leaf("Beta", "2.0.0", at(20)),
            leaf("Gamma", "3.0.0", at(30)),
        ],
        vec![leaf("Delta", "4.0.0", at(40))],
    ]
}

#[tokio::test]
async fn window_is_fully_processed_and_cursor_advances() {
    let driver = Arc::new(ScriptedDriver::expanding(PageScanResult::ExpandAllowDuplicates));
    let harness = Harness::new(registry_with(DRIVER, driver.clone()));
    publish(&harness.catalog, two_pages()).await;

    let scan = harness.start_new(DRIVER, Some(at(40))).await;
    assert_eq!(scan.min, Some(epoch()));
    assert_eq!(scan.max, Some(at(40)));

    harness.run_until_idle().await;

    let mut processed: Vec<String> = driver
        .processed()
        .iter()
        .map(|leaf| leaf.package_id.clone())
        .collect();
    processed.sort();
    assert_eq!(processed, vec!["Alpha", "Beta", "Delta", "Gamma"]);
    assert_eq!(harness.enqueued_pages().await, 2);
    assert_eq!(harness.enqueued_leaves().await, 4);
    assert_eq!(driver.finalized(), 1);

    let stored = harness.scan(&scan).await.expect("scan record");
    assert_eq!(stored.state, IndexScanState::Complete);
    assert!(stored.completed.is_some());
    assert_eq!(harness.cursor_value(DRIVER).await, at(40));

    let tables = harness.store.table_names().await;
    assert!(!tables.contains(&page_table(&scan.storage_suffix)));
    assert!(!tables.contains(&leaf_table(&scan.storage_suffix)));
}

#[tokio::test]
async fn next_start_resumes_from_cursor() {
    let driver = Arc::new(ScriptedDriver::expanding(PageScanResult::ExpandAllowDuplicates));
    let harness = Harness::new(registry_with(DRIVER, driver.clone()));
    publish(&harness.catalog, two_pages()).await;

    harness.start_new(DRIVER, Some(at(20))).await;
    harness.run_until_idle().await;
    assert_eq!(harness.cursor_value(DRIVER).await, at(20));
    assert_eq!(driver.processed().len(), 2);

    let second = harness.start_new(DRIVER, None).await;
    assert_eq!(second.min, Some(at(20)));
    assert_eq!(second.max, Some(at(40)));
    harness.run_until_idle().await;

    let mut processed: Vec<String> = driver
        .processed()
        .iter()
        .map(|leaf| leaf.package_id.clone())
        .collect();
    processed.sort();
    assert_eq!(processed, vec!["Alpha", "Beta", "Delta", "Gamma"]);
    assert_eq!(harness.cursor_value(DRIVER).await, at(40));

    assert!(matches!(
        harness.start(DRIVER, None).await,
        StartOutcome::FullyCaughtUpWithDependency { .. }
    ));
}

#[tokio::test]
async fn try_again_later_does_not_consume_attempts() {
    let driver = Arc::new(
        ScriptedDriver::expanding(PageScanResult::ExpandAllowDuplicates).script(
            "Delta",
            vec![
                LeafStep::TryAgainLater,
                LeafStep::TryAgainLater,
                LeafStep::TryAgainLater,
                LeafStep::Succeed,
            ],
        ),
    );
    let mut config = test_config();
    config.retry.max_attempts = 2;
    let harness = Harness::with_config(registry_with(DRIVER, driver.clone()), config);
    publish(&harness.catalog, two_pages()).await;

    let scan = harness.start_new(DRIVER, None).await;
    for _ in 0..1_000 {
        if driver.calls("Delta") == 3 {
            break;
        }
        if harness.round().await == 0
            && let Some(next) = harness.queue.next_visible_at().await
            && next > harness.clock.now()
        {
            harness.clock.set(next);
        }
    }
    assert_eq!(driver.calls("Delta"), 3);

    let delta = harness
        .engine
        .storage
        .list_leaf_scans(&scan.storage_suffix, &scan.scan_id)
        .await
        .expect("list leaves")
        .into_iter()
        .find(|leaf| leaf.package_id == "Delta")
        .expect("delta leaf record");
    assert_eq!(delta.attempt_count, 0);

    harness.run_until_idle().await;

    assert_eq!(driver.calls("Delta"), 4);
    assert_eq!(driver.processed().len(), 4);
    assert!(harness.queue.poison_messages().await.is_empty());
    assert_eq!(harness.cursor_value(DRIVER).await, at(40));

    let try_again_later = harness.engine.config.retry.try_again_later();
    let leaf_delays: Vec<Duration> = harness
        .queue
        .history()
        .await
        .into_iter()
        .filter(|record| matches!(record.message, ScanMessage::Leaf(_)))
        .map(|record| record.delay)
        .filter(|delay| !delay.is_zero())
        .collect();
    assert_eq!(leaf_delays, vec![try_again_later; 3]);
}

#[tokio::test]
async fn failed_leaf_is_retried_until_it_succeeds() {
    let driver = Arc::new(
        ScriptedDriver::expanding(PageScanResult::ExpandAllowDuplicates)
            .script("Beta", vec![LeafStep::Fail, LeafStep::Fail, LeafStep::Succeed]),
    );
    let harness = Harness::new(registry_with(DRIVER, driver.clone()));
    publish(&harness.catalog, two_pages()).await;

    let started = harness.clock.now();
    harness.start_new(DRIVER, None).await;
    harness.run_until_idle().await;

    assert_eq!(driver.calls("Beta"), 3);
    assert_eq!(driver.processed().len(), 4);
    assert!(harness.queue.poison_messages().await.is_empty());
    // Two failures wait out 1s and 2s of backoff.
    assert!(harness.clock.now() - started >= chrono::Duration::seconds(3));
}

#[tokio::test]
async fn exhausted_leaf_moves_to_poison_queue() {
    let driver = Arc::new(
        ScriptedDriver::expanding(PageScanResult::ExpandAllowDuplicates)
            .script("Gamma", vec![LeafStep::Fail; 10]),
    );
    let mut config = test_config();
    config.retry.max_attempts = 3;
    let harness = Harness::with_config(registry_with(DRIVER, driver.clone()), config);
    publish(&harness.catalog, two_pages()).await;

    let scan = harness.start_new(DRIVER, None).await;
    let deadline = harness.clock.now() + chrono::Duration::minutes(10);
    harness.run_until(deadline).await;

    assert_eq!(driver.calls("Gamma"), 3);
    let poison = harness.queue.poison_messages().await;
    assert_eq!(poison.len(), 1);
    let ScanMessage::Leaf(message) = &poison[0] else {
        panic!("expected a leaf message in the poison queue");
    };
    assert_eq!(message.scan_id, scan.scan_id);

    let stored = harness.scan(&scan).await.expect("scan record");
    assert_eq!(stored.state, IndexScanState::Waiting);
    assert_eq!(harness.cursor_value(DRIVER).await, epoch());
}

#[tokio::test]
async fn blocked_while_dependency_cursor_is_at_epoch() {
    let upstream = Arc::new(ScriptedDriver::expanding(PageScanResult::Processed));
    let downstream = Arc::new(ScriptedDriver::expanding(PageScanResult::Processed));
    let mut drivers = DriverRegistry::new();
    drivers.register("upstream", RegisteredDriver::with_leaf_driver(upstream));
    drivers.register(
        "downstream",
        RegisteredDriver::with_leaf_driver(downstream)
            .depends_on(vec![DependencySource::Driver(DriverType::from("upstream"))]),
    );
    let harness = Harness::new(drivers);
    publish(&harness.catalog, two_pages()).await;

    assert_eq!(
        harness.start("downstream", None).await,
        StartOutcome::Blocked {
            dependency: "CatalogScan-upstream".to_string()
        }
    );
    assert!(harness.queue.is_empty().await);

    harness.start_new("upstream", Some(at(30))).await;
    harness.run_until_idle().await;

    let scan = harness.start_new("downstream", None).await;
    assert_eq!(scan.max, Some(at(30)));
    assert!(matches!(
        harness.start("downstream", Some(at(40))).await,
        StartOutcome::AlreadyRunning { .. }
    ));
}

#[tokio::test]
async fn update_all_starts_dependents_once_upstream_completes() {
    let upstream = Arc::new(ScriptedDriver::expanding(PageScanResult::Processed));
    let downstream = Arc::new(ScriptedDriver::expanding(PageScanResult::Processed));
    let mut drivers = DriverRegistry::new();
    drivers.register("upstream", RegisteredDriver::with_leaf_driver(upstream.clone()));
    drivers.register(
        "downstream",
        RegisteredDriver::with_leaf_driver(downstream.clone())
            .depends_on(vec![DependencySource::Driver(DriverType::from("upstream"))]),
    );
    let harness = Harness::new(drivers);
    publish(&harness.catalog, two_pages()).await;

    let outcomes = harness.cursors.update_all(None).await.expect("update all");
    let outcome = |name: &str| {
        outcomes
            .iter()
            .find(|(driver_type, _)| *driver_type == DriverType::from(name))
            .map(|(_, outcome)| outcome.as_ref().expect("start outcome"))
            .expect("driver outcome")
    };
    assert!(matches!(outcome("upstream"), StartOutcome::NewStarted { .. }));
    assert!(matches!(outcome("downstream"), StartOutcome::Blocked { .. }));

    harness.run_until_idle().await;

    assert_eq!(upstream.finalized(), 1);
    assert_eq!(downstream.finalized(), 1);
    assert_eq!(harness.cursor_value("upstream").await, at(40));
    assert_eq!(harness.cursor_value("downstream").await, at(40));
}

#[tokio::test]
async fn plain_start_does_not_start_dependents() {
    let upstream = Arc::new(ScriptedDriver::expanding(PageScanResult::Processed));
    let downstream = Arc::new(ScriptedDriver::expanding(PageScanResult::Processed));
    let mut drivers = DriverRegistry::new();
    drivers.register("upstream", RegisteredDriver::with_leaf_driver(upstream));
    drivers.register(
        "downstream",
        RegisteredDriver::with_leaf_driver(downstream.clone())
            .depends_on(vec![DependencySource::Driver(DriverType::from("upstream"))]),
    );
    let harness = Harness::new(drivers);
    publish(&harness.catalog, two_pages()).await;

    let scan = harness.start_new("upstream", None).await;
    assert!(!scan.continue_update);
    harness.run_until_idle().await;

    assert_eq!(downstream.finalized(), 0);
    assert_eq!(harness.cursor_value("downstream").await, epoch());
}

#[tokio::test]
async fn finalizing_prunes_old_index_scans() {
    let driver = Arc::new(ScriptedDriver::expanding(PageScanResult::Processed));
    let mut config = test_config();
    config.old_index_scans_to_keep = 1;
    let harness = Harness::with_config(registry_with(DRIVER, driver.clone()), config);
    publish(&harness.catalog, two_pages()).await;

    let mut scans = Vec::new();
    for max in [at(10), at(20), at(30), at(40)] {
        harness.clock.advance(chrono::Duration::minutes(1));
        scans.push(harness.start_new(DRIVER, Some(max)).await);
        harness.run_until_idle().await;
    }
    assert_eq!(driver.finalized(), 4);

    let remaining: Vec<_> = harness
        .engine
        .storage
        .list_index_scans(&DriverType::from(DRIVER).cursor_name(), None)
        .await
        .expect("list scans")
        .into_iter()
        .map(|scan| scan.scan_id)
        .collect();
    assert_eq!(
        remaining,
        vec![scans[3].scan_id.clone(), scans[2].scan_id.clone()]
    );
}

#[tokio::test]
async fn remove_duplicates_keeps_latest_catalog_entry() {
    let driver = Arc::new(ScriptedDriver::expanding(PageScanResult::ExpandRemoveDuplicates));
    let harness = Harness::new(registry_with(DRIVER, driver.clone()));
    publish(
        &harness.catalog,
        vec![vec![
            leaf("Alpha", "1.0.0", at(10)),
            leaf("alpha", "1.0", at(20)),
        ]],
    )
    .await;

    harness.start_new(DRIVER, None).await;
    harness.run_until_idle().await;

    let processed = driver.processed();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].commit_timestamp, at(20));
    assert_eq!(harness.enqueued_leaves().await, 1);
}

#[tokio::test]
async fn processed_pages_create_no_leaves() {
    let driver = Arc::new(ScriptedDriver::expanding(PageScanResult::Processed));
    let harness = Harness::new(registry_with(DRIVER, driver.clone()));
    publish(&harness.catalog, two_pages()).await;

    let scan = harness.start_new(DRIVER, None).await;
    harness.run_until_idle().await;

    assert!(driver.processed().is_empty());
    assert_eq!(harness.enqueued_leaves().await, 0);
    assert_eq!(
        harness.scan(&scan).await.map(|s| s.state),
        Some(IndexScanState::Complete)
    );
    assert_eq!(harness.cursor_value(DRIVER).await, at(40));
}

#[tokio::test]
async fn duplicate_deliveries_do_not_duplicate_work() {
    let driver = Arc::new(ScriptedDriver::expanding(PageScanResult::ExpandAllowDuplicates));
    let harness = Harness::new(registry_with(DRIVER, driver.clone()));
    publish(&harness.catalog, two_pages()).await;

    let scan = harness.start_new(DRIVER, None).await;
    assert_eq!(harness.round().await, 1);

    let copies: Vec<ScanMessage> = harness
        .queue
        .history()
        .await
        .into_iter()
        .map(|record| record.message)
        .filter(|message| matches!(message, ScanMessage::Page(_)))
        .chain(std::iter::once(scan.message().into()))
        .collect();
    assert_eq!(copies.len(), 3);
    harness
        .queue
        .enqueue(copies, Duration::ZERO)
        .await
        .expect("enqueue copies");

    harness.run_until_idle().await;

    let mut processed: Vec<String> = driver
        .processed()
        .iter()
        .map(|leaf| leaf.package_id.clone())
        .collect();
    processed.sort();
    assert_eq!(processed, vec!["Alpha", "Beta", "Delta", "Gamma"]);
    assert_eq!(driver.finalized(), 1);
    assert_eq!(harness.cursor_value(DRIVER).await, at(40));
}

#[tokio::test]
async fn latest_leaves_mode_runs_find_latest_pre_pass() {
    let driver = Arc::new(ScriptedDriver::latest_leaves());
    let harness = Harness::new(registry_with(DRIVER, driver.clone()));
    publish(
        &harness.catalog,
        vec![
            vec![leaf("Alpha", "1.0.0", at(10)), leaf("Beta", "1.0", at(20))],
            vec![leaf("alpha", "1.0.0.0", at(30))],
        ],
    )
    .await;

    let scan = harness.start_new(DRIVER, None).await;
    harness.run_until_idle().await;

    let mut processed: Vec<(String, chrono::DateTime<chrono::Utc>)> = driver
        .processed()
        .iter()
        .map(|leaf| (leaf.package_id.to_lowercase(), leaf.commit_timestamp))
        .collect();
    processed.sort();
    assert_eq!(
        processed,
        vec![("alpha".to_string(), at(30)), ("beta".to_string(), at(20))]
    );

    let child = harness
        .engine
        .storage
        .get_index_scan("", &scan.scan_id.find_latest_child())
        .await
        .expect("read child");
    assert!(child.is_none());
    assert_eq!(
        harness.scan(&scan).await.map(|s| s.state),
        Some(IndexScanState::Complete)
    );
    assert_eq!(harness.cursor_value(DRIVER).await, at(30));
    assert_eq!(
        harness.cursor_value(DriverType::FIND_LATEST_LEAVES).await,
        epoch()
    );
}

#[tokio::test]
async fn abort_discards_scan_state_and_frees_the_cursor() {
    let driver = Arc::new(ScriptedDriver::expanding(PageScanResult::ExpandAllowDuplicates));
    let harness = Harness::new(registry_with(DRIVER, driver.clone()));
    publish(&harness.catalog, two_pages()).await;

    let scan = harness.start_new(DRIVER, None).await;
    harness.round().await;
    assert_eq!(
        harness.scan(&scan).await.map(|s| s.state),
        Some(IndexScanState::Waiting)
    );

    let aborted = harness
        .cursors
        .abort(&DriverType::from(DRIVER))
        .await
        .expect("abort")
        .expect("a running scan");
    assert_eq!(aborted.scan_id, scan.scan_id);
    assert_eq!(aborted.state, IndexScanState::Aborted);

    harness.run_until_idle().await;

    assert!(driver.processed().is_empty());
    assert_eq!(driver.finalized(), 1);
    assert_eq!(harness.cursor_value(DRIVER).await, epoch());
    assert_eq!(
        harness.scan(&scan).await.map(|s| s.state),
        Some(IndexScanState::Aborted)
    );
    assert!(
        !harness
            .store
            .table_names()
            .await
            .contains(&page_table(&scan.storage_suffix))
    );

    harness.start_new(DRIVER, None).await;
}

#[tokio::test]
async fn requeue_recovers_lost_messages() {
    let driver = Arc::new(ScriptedDriver::expanding(PageScanResult::ExpandAllowDuplicates));
    let harness = Harness::new(registry_with(DRIVER, driver.clone()));
    publish(&harness.catalog, two_pages()).await;

    let scan = harness.start_new(DRIVER, None).await;
    harness.round().await;

    // Drop everything in flight, the delayed index poll included.
    harness.clock.advance(chrono::Duration::minutes(5));
    let lost = harness
        .queue
        .receive(100, Duration::from_secs(60))
        .await
        .expect("receive");
    assert!(!lost.is_empty());
    for delivery in lost {
        harness.queue.complete(delivery.receipt).await.expect("complete");
    }
    assert!(harness.queue.is_empty().await);

    let counts = harness
        .cursors
        .requeue(&DriverType::from(DRIVER), &scan.scan_id)
        .await
        .expect("requeue")
        .expect("scan is waiting");
    assert_eq!(counts.pages, 2);
    assert_eq!(counts.leaves, 0);

    harness.run_until_idle().await;

    assert_eq!(driver.processed().len(), 4);
    assert_eq!(harness.cursor_value(DRIVER).await, at(40));
    assert!(
        harness
            .cursors
            .requeue(&DriverType::from(DRIVER), &scan.scan_id)
            .await
            .expect("requeue")
            .is_none()
    );
}
