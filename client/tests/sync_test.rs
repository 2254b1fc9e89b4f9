//! End-to-end tests of the sync orchestrator against the in-memory remote.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tillsync_client::{InMemoryRemote, SyncConfig, SyncError, SyncOrchestrator, SyncTrigger};
use tillsync_engine::{
    ChangeOp, ConflictPolicy, EntityType, LocalStore, LogStatus, Resolution, Schema, Side,
    SyncType,
};

fn config(device_id: &str) -> SyncConfig {
    SyncConfig {
        device_id: device_id.to_string(),
        state_path: None,
        sync_interval: None,
        sync_on_startup: false,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
        ..SyncConfig::default()
    }
}

fn device(device_id: &str, remote: &Arc<InMemoryRemote>) -> Arc<SyncOrchestrator> {
    device_with(config(device_id), remote)
}

fn device_with(config: SyncConfig, remote: &Arc<InMemoryRemote>) -> Arc<SyncOrchestrator> {
    let store = LocalStore::new(Schema::business_default(), config.device_id.clone());
    SyncOrchestrator::new(config, store, remote.clone())
}

fn booking() -> serde_json::Value {
    json!({"customer_id": "c-1", "service": "Haircut", "starts_at": 1706745600000u64})
}

/// Seed `C1` on the remote and pull it onto the device.
async fn synced_customer(sync: &SyncOrchestrator, remote: &InMemoryRemote) {
    remote.external_write(EntityType::Customer, "C1", json!({"name": "Ada"}));
    assert!(sync.manual_sync().await.success);
    assert!(sync.local().read(EntityType::Customer, "C1").unwrap().is_synced);
}

// ============================================================================
// Push
// ============================================================================

#[tokio::test]
async fn pushed_booking_becomes_synced() {
    let remote = Arc::new(InMemoryRemote::new());
    let sync = device("till-a", &remote);
    let local = sync.local();

    let id = local.create(EntityType::Booking, booking()).unwrap().entity_id;
    assert!(!local.read(EntityType::Booking, &id).unwrap().is_synced);
    assert_eq!(local.pending_count(), 1);

    let outcome = sync.manual_sync().await;
    assert!(outcome.success, "{outcome:?}");

    assert!(local.read(EntityType::Booking, &id).unwrap().is_synced);
    assert_eq!(local.pending_count(), 0);

    let successes = sync
        .sync_log()
        .into_iter()
        .filter(|e| e.entity_id.as_deref() == Some(id.as_str()) && e.status == LogStatus::Success)
        .count();
    assert_eq!(successes, 1);

    // Audit entries are shipped to the remote after the cycle
    assert!(remote
        .logs()
        .iter()
        .any(|e| e.entity_id.as_deref() == Some(id.as_str())));
}

#[tokio::test]
async fn offline_edits_collapse_into_one_push() {
    let remote = Arc::new(InMemoryRemote::new());
    let sync = device("till-a", &remote);
    let local = sync.local();

    let id = local
        .create(EntityType::Customer, json!({"name": "Ada"}))
        .unwrap()
        .entity_id;
    local.update(EntityType::Customer, &id, json!({"name": "Ada L."})).unwrap();
    local
        .update(EntityType::Customer, &id, json!({"name": "Ada Lovelace"}))
        .unwrap();
    assert_eq!(local.pending_count(), 1);

    assert!(sync.manual_sync().await.success);

    let stored = remote.get(EntityType::Customer, &id).unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.payload, json!({"name": "Ada Lovelace"}));
    assert_eq!(remote.push_calls(), 1);
}

#[tokio::test]
async fn lost_response_does_not_duplicate() {
    let remote = Arc::new(InMemoryRemote::new());
    let sync = device("till-a", &remote);
    let local = sync.local();

    let id = local.create(EntityType::Booking, booking()).unwrap().entity_id;

    remote.lose_next_responses(1);
    let first = sync.manual_sync().await;
    assert!(!first.success);
    assert_eq!(local.pending_count(), 1);
    assert_eq!(remote.active_count(), 1);

    let second = sync.manual_sync().await;
    assert!(second.success, "{second:?}");
    assert_eq!(local.pending_count(), 0);

    let stored = remote.get(EntityType::Booking, &id).unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(remote.server_clock(), 1);
    assert!(local.read(EntityType::Booking, &id).unwrap().is_synced);
}

#[tokio::test]
async fn edit_after_lost_response_supersedes_applied_revision() {
    let remote = Arc::new(InMemoryRemote::new());
    let sync = device("till-a", &remote);
    let local = sync.local();

    let id = local
        .create(EntityType::Customer, json!({"name": "Ada"}))
        .unwrap()
        .entity_id;
    remote.lose_next_responses(1);
    assert!(!sync.manual_sync().await.success);

    local.update(EntityType::Customer, &id, json!({"name": "Grace"})).unwrap();
    assert!(sync.manual_sync().await.success);

    let stored = remote.get(EntityType::Customer, &id).unwrap();
    assert_eq!(stored.payload, json!({"name": "Grace"}));
    assert_eq!(stored.version, 2);
    assert!(sync.conflicts().is_empty());
}

#[tokio::test]
async fn transient_failures_stop_after_max_attempts() {
    let remote = Arc::new(InMemoryRemote::new());
    let sync = device_with(
        SyncConfig {
            max_attempts: 3,
            ..config("till-a")
        },
        &remote,
    );
    let local = sync.local();

    local
        .write(EntityType::Customer, "c-flaky", Some(json!({"name": "Ada"})), ChangeOp::Create)
        .unwrap();
    remote.make_flaky("c-flaky");

    for _ in 0..5 {
        sync.manual_sync().await;
    }

    let failures = sync
        .sync_log()
        .into_iter()
        .filter(|e| e.entity_id.as_deref() == Some("c-flaky") && e.is_failure())
        .count();
    assert_eq!(failures, 3);
    assert_eq!(remote.push_calls(), 3);

    let pending = sync.pending_changes();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].failed);
    assert!(pending[0]
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("gave up after 3 attempts")));
    assert_eq!(sync.status().snapshot().failed_changes, 1);

    let retried = sync.retry_failed();
    assert_eq!(retried.count, Some(1));
    assert!(!sync.pending_changes()[0].failed);
}

#[tokio::test]
async fn validation_rejection_marks_change_failed() {
    // The remote requires a field the device schema leaves optional
    let strict = Schema::business_default().with_entity(tillsync_engine::EntitySchema::new(
        EntityType::Staff,
        vec![
            tillsync_engine::FieldDef::required("name", tillsync_engine::FieldType::String),
            tillsync_engine::FieldDef::required("role", tillsync_engine::FieldType::String),
        ],
    ));
    let remote = Arc::new(InMemoryRemote::with_schema(strict));
    let sync = device("till-a", &remote);

    sync.local()
        .create(EntityType::Staff, json!({"name": "Sam"}))
        .unwrap();
    let outcome = sync.manual_sync().await;
    assert!(outcome.success);

    let pending = sync.pending_changes();
    assert!(pending[0].failed);
    assert_eq!(remote.active_count(), 0);
    assert_eq!(sync.sync_log().iter().filter(|e| e.is_failure()).count(), 1);
}

// ============================================================================
// Pull
// ============================================================================

#[tokio::test]
async fn devices_converge_through_the_remote() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    let b = device("till-b", &remote);

    let id = a
        .local()
        .create(EntityType::InventoryItem, json!({"name": "Beans", "quantity": 12}))
        .unwrap()
        .entity_id;
    assert!(a.manual_sync().await.success);
    assert!(b.manual_sync().await.success);

    let on_b = b.local().read(EntityType::InventoryItem, &id).unwrap();
    assert_eq!(on_b.payload, json!({"name": "Beans", "quantity": 12}));
    assert!(on_b.is_synced);

    b.local().delete(EntityType::InventoryItem, &id).unwrap();
    assert!(b.manual_sync().await.success);
    assert!(a.manual_sync().await.success);

    assert!(a.local().read(EntityType::InventoryItem, &id).is_none());
    assert!(remote.get(EntityType::InventoryItem, &id).unwrap().deleted);
}

#[tokio::test]
async fn pull_pages_through_remote_changes() {
    let remote = Arc::new(InMemoryRemote::new());
    let sync = device_with(
        SyncConfig {
            pull_page_size: 2,
            ..config("till-a")
        },
        &remote,
    );

    for i in 0..5 {
        remote.external_write(EntityType::Customer, &format!("c-{i}"), json!({"name": "Ada"}));
    }

    let outcome = sync.pull_changes().await;
    assert_eq!(outcome.count, Some(5));
    assert_eq!(sync.local().list(EntityType::Customer).len(), 5);
    assert_eq!(remote.pull_calls(), 3);

    // Watermark advanced; nothing new to apply
    assert_eq!(sync.pull_changes().await.count, Some(0));
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn concurrent_edit_raises_conflict_and_server_wins() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    synced_customer(&a, &remote).await;

    // Device A edits offline while device B edits on the remote
    a.set_online(false);
    a.local()
        .update(EntityType::Customer, "C1", json!({"name": "Ada (A)"}))
        .unwrap();
    remote.external_write(EntityType::Customer, "C1", json!({"name": "Ada (B)"}));

    a.set_online(true);
    let report = a.run_cycle(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.conflicts, 1);
    assert!(!report.watermark_committed);

    let conflicts = a.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].entity_id, "C1");
    assert_eq!(conflicts[0].local_payload, Some(json!({"name": "Ada (A)"})));
    assert_eq!(conflicts[0].server_payload(), Some(&json!({"name": "Ada (B)"})));
    assert_eq!(a.status().snapshot().conflicts, 1);

    let outcome = a.resolve_all(Side::Server);
    assert_eq!(outcome.count, Some(1));

    let c1 = a.local().read(EntityType::Customer, "C1").unwrap();
    assert_eq!(c1.payload, json!({"name": "Ada (B)"}));
    assert!(c1.is_synced);
    assert!(a.conflicts().is_empty());
    assert_eq!(a.local().pending_count(), 0);
    assert_eq!(a.status().snapshot().conflicts, 0);
}

#[tokio::test]
async fn keep_local_overwrites_remote_on_next_push() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    synced_customer(&a, &remote).await;

    a.local()
        .update(EntityType::Customer, "C1", json!({"name": "Mine"}))
        .unwrap();
    remote.external_write(EntityType::Customer, "C1", json!({"name": "Theirs"}));
    a.manual_sync().await;
    assert_eq!(a.conflicts().len(), 1);

    assert_eq!(a.resolve_all(Side::Local).count, Some(1));
    assert!(a.manual_sync().await.success);

    let stored = remote.get(EntityType::Customer, "C1").unwrap();
    assert_eq!(stored.payload, json!({"name": "Mine"}));
    assert_eq!(stored.version, 3);
    assert!(a.conflicts().is_empty());
    assert!(a.local().read(EntityType::Customer, "C1").unwrap().is_synced);
}

#[tokio::test]
async fn merge_resolution_is_pushed() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    synced_customer(&a, &remote).await;

    a.local()
        .update(EntityType::Customer, "C1", json!({"name": "Ada", "phone": "555"}))
        .unwrap();
    remote.external_write(
        EntityType::Customer,
        "C1",
        json!({"name": "Ada", "email": "ada@example.com"}),
    );
    a.pull_changes().await;

    let conflict = a.conflicts().pop().unwrap();
    let merged = json!({"name": "Ada", "phone": "555", "email": "ada@example.com"});
    assert!(a.resolve(&conflict.id, Resolution::Merge(merged.clone())).success);
    assert!(a.manual_sync().await.success);

    assert_eq!(remote.get(EntityType::Customer, "C1").unwrap().payload, merged);
}

#[tokio::test]
async fn resolving_unknown_conflict_fails() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    let outcome = a.resolve("nope", Resolution::KeepServer);
    assert!(!outcome.success);
    assert!(outcome.error.is_some());
}

#[tokio::test]
async fn watermark_held_until_conflicts_resolved() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    synced_customer(&a, &remote).await;
    let synced_at = a.status().snapshot().last_sync_time;

    a.local()
        .update(EntityType::Customer, "C1", json!({"name": "Mine"}))
        .unwrap();
    remote.external_write(EntityType::Customer, "C1", json!({"name": "Theirs"}));
    remote.external_write(EntityType::Customer, "C2", json!({"name": "Bob"}));

    let report = a.run_cycle(SyncTrigger::Manual).await.unwrap();
    assert!(!report.watermark_committed);
    assert_eq!(a.status().snapshot().last_sync_time, synced_at);
    // Non-conflicting records still land
    assert!(a.local().read(EntityType::Customer, "C2").is_some());

    a.resolve_all(Side::Server);
    let report = a.run_cycle(SyncTrigger::Manual).await.unwrap();
    assert!(report.watermark_committed);
    assert_eq!(report.watermark, Some(remote.server_clock()));
}

#[tokio::test]
async fn prefer_server_policy_resolves_automatically() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device_with(
        SyncConfig {
            conflict_policy: ConflictPolicy::PreferServer,
            ..config("till-a")
        },
        &remote,
    );
    synced_customer(&a, &remote).await;

    a.local()
        .update(EntityType::Customer, "C1", json!({"name": "Mine"}))
        .unwrap();
    remote.external_write(EntityType::Customer, "C1", json!({"name": "Theirs"}));

    let report = a.run_cycle(SyncTrigger::Manual).await.unwrap();
    assert_eq!(report.auto_resolved, 1);
    assert_eq!(report.conflicts, 0);
    assert!(report.watermark_committed);
    assert_eq!(
        a.local().read(EntityType::Customer, "C1").unwrap().payload,
        json!({"name": "Theirs"})
    );
    assert!(a.sync_log().iter().any(|e| e.sync_type == SyncType::Resolve));
}

// ============================================================================
// Error Handling
// ============================================================================

#[tokio::test]
async fn auth_failure_pauses_sync() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    a.local().create(EntityType::Booking, booking()).unwrap();

    remote.set_auth_required(true);
    assert!(!a.manual_sync().await.success);
    assert!(a.status().snapshot().auth_paused);
    let calls = remote.push_calls();

    remote.set_auth_required(false);
    let err = a.run_cycle(SyncTrigger::Manual).await.unwrap_err();
    assert!(matches!(err, SyncError::Paused(_)));
    assert_eq!(remote.push_calls(), calls);

    a.resume_after_auth();
    assert!(a.manual_sync().await.success);
    assert_eq!(a.local().pending_count(), 0);
}

#[tokio::test]
async fn schema_mismatch_flags_status() {
    let remote = Arc::new(InMemoryRemote::with_schema(Schema::new(2)));
    let a = device("till-a", &remote);
    a.local().create(EntityType::Booking, booking()).unwrap();

    let outcome = a.manual_sync().await;
    assert!(!outcome.success);

    let status = a.status().snapshot();
    assert!(status.schema_error);
    assert!(status.last_error.is_some());
    assert_eq!(a.local().pending_count(), 1);
    assert!(a
        .sync_log()
        .iter()
        .any(|e| e.entity_id.is_none() && e.is_failure()));
}

#[tokio::test]
async fn offline_device_does_not_call_remote() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    a.local().create(EntityType::Booking, booking()).unwrap();

    a.set_online(false);
    for _ in 0..3 {
        assert!(!a.manual_sync().await.success);
    }
    assert_eq!(remote.push_calls(), 0);
    assert_eq!(remote.pull_calls(), 0);
    assert!(a.sync_log().is_empty());
}

#[tokio::test]
async fn unreachable_remote_logs_one_failure_per_outage() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);

    remote.set_offline(true);
    for _ in 0..5 {
        assert!(!a.manual_sync().await.success);
    }
    let cycle_failures = |log: &[tillsync_engine::SyncLogEntry]| {
        log.iter()
            .filter(|e| e.entity_id.is_none() && e.is_failure())
            .count()
    };
    assert_eq!(cycle_failures(&a.sync_log()), 1);

    remote.set_offline(false);
    assert!(a.manual_sync().await.success);
    assert_eq!(cycle_failures(&remote.logs()), 1);
}

#[tokio::test]
async fn transient_batch_failure_is_retried_next_cycle() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    a.local().create(EntityType::Booking, booking()).unwrap();

    remote.fail_next_pushes(1);
    assert!(!a.manual_sync().await.success);
    assert_eq!(a.pending_changes()[0].retry_count, 1);
    assert!(a.status().snapshot().last_error.is_some());

    assert!(a.manual_sync().await.success);
    assert_eq!(a.local().pending_count(), 0);
    assert_eq!(a.status().snapshot().last_error, None);
}

// ============================================================================
// Cycle Control
// ============================================================================

#[tokio::test]
async fn overlapping_triggers_coalesce() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_delay(Some(Duration::from_millis(50)));
    let a = device("till-a", &remote);

    let (first, second) = tokio::join!(
        a.run_cycle(SyncTrigger::Manual),
        a.run_cycle(SyncTrigger::Interval)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(!first.coalesced);
    assert!(second.coalesced);
    // The caller gets its own cycle; one follow-up runs for the coalesced trigger
    assert_eq!(first.trigger, Some(SyncTrigger::Manual));
    assert_eq!(remote.pull_calls(), 2);
}

#[tokio::test]
async fn reset_waits_for_running_cycle() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.external_write(EntityType::Customer, "c-remote", json!({"name": "Ada"}));
    let a = device("till-a", &remote);
    remote.set_delay(Some(Duration::from_millis(100)));

    let running = tokio::spawn({
        let a = Arc::clone(&a);
        async move { a.manual_sync().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.local()
        .create(EntityType::Customer, json!({"name": "Unpushed"}))
        .unwrap();

    let outcome = a.reset_and_resync().await;
    assert!(running.await.unwrap().success);
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.count, Some(1));

    let customers = a.local().list(EntityType::Customer);
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].id, "c-remote");
    assert_eq!(a.local().pending_count(), 0);
}

#[tokio::test]
async fn manual_calls_run_back_to_back() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_delay(Some(Duration::from_millis(20)));
    let a = device("till-a", &remote);
    a.local().create(EntityType::Booking, booking()).unwrap();

    let (synced, pushed) = tokio::join!(a.manual_sync(), a.push_changes());
    assert!(synced.success && pushed.success);
    // push_changes waited and ran its own cycle against an empty queue
    assert_eq!(pushed.count, Some(0));
    assert_eq!(remote.push_calls(), 1);
    assert_eq!(remote.pull_calls(), 1);
}

#[tokio::test]
async fn reset_discards_local_changes() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    remote.external_write(EntityType::Customer, "c-remote", json!({"name": "Ada"}));
    a.local()
        .create(EntityType::Customer, json!({"name": "Unpushed"}))
        .unwrap();

    let outcome = a.reset_and_resync().await;
    assert_eq!(outcome.count, Some(1));

    let customers = a.local().list(EntityType::Customer);
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].id, "c-remote");
    assert_eq!(a.local().pending_count(), 0);
    assert!(a.sync_log().iter().any(|e| e.sync_type == SyncType::Reset));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let cfg = SyncConfig {
        state_path: Some(dir.path().join("till-a.json")),
        ..config("till-a")
    };

    let first = SyncOrchestrator::open(cfg.clone(), Schema::business_default(), remote.clone())
        .unwrap();
    first.local().create(EntityType::Booking, booking()).unwrap();
    drop(first);

    let second =
        SyncOrchestrator::open(cfg, Schema::business_default(), remote.clone()).unwrap();
    assert_eq!(second.local().pending_count(), 1);
    assert_eq!(second.status().snapshot().pending_changes, 1);

    assert!(second.manual_sync().await.success);
    assert_eq!(remote.active_count(), 1);
}

#[tokio::test]
async fn background_task_syncs_on_startup_and_reconnect() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device_with(
        SyncConfig {
            sync_on_startup: true,
            ..config("till-a")
        },
        &remote,
    );
    a.local().create(EntityType::Booking, booking()).unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = a.spawn(shutdown_rx);

    let mut status = a.status().watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        while status.borrow_and_update().last_sync_time.is_none() {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert_eq!(remote.active_count(), 1);

    a.set_online(false);
    a.local().create(EntityType::Booking, booking()).unwrap();
    a.set_online(true);

    tokio::time::timeout(Duration::from_secs(5), async {
        while remote.active_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn status_subscribers_see_cycle_phases() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    a.status().subscribe(move |status| {
        sink.lock().unwrap().push(status.phase);
    });

    a.local().create(EntityType::Booking, booking()).unwrap();
    assert!(a.manual_sync().await.success);

    use tillsync_client::SyncPhase::*;
    let phases = seen.lock().unwrap().clone();
    assert!(phases.contains(&Pushing));
    assert!(phases.contains(&Reconciling));
    assert_eq!(phases.last(), Some(&Idle));
}

#[tokio::test]
async fn status_subscribers_may_read_the_store() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device("till-a", &remote);
    remote.external_write(EntityType::Customer, "C1", json!({"name": "Ada"}));

    let reader = a.local();
    let seen = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&seen);
    a.status().subscribe(move |_| {
        sink.fetch_max(reader.list(EntityType::Customer).len(), Ordering::SeqCst);
    });

    a.local().create(EntityType::Booking, booking()).unwrap();
    assert!(a.manual_sync().await.success);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
