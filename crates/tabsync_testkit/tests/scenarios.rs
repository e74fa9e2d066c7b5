//! End-to-end replication scenarios across several replicas.

use std::time::Duration;
use tabsync_engine::{now_ms, SyncEngine, TransportMode};
use tabsync_protocol::{ChangeMessage, ClaimStatus, IdStrategy, RecordId, SyncStatus};
use tabsync_testkit::prelude::*;

const SETTLE: Duration = Duration::from_secs(2);

fn draft(title: &str) -> RecordDraft {
    RecordDraft::new().with_field("title", title)
}

fn titles(engine: &SyncEngine) -> Vec<String> {
    let mut titles: Vec<String> = engine
        .records()
        .iter()
        .filter_map(|r| r.field("title").map(str::to_string))
        .collect();
    titles.sort();
    titles
}

/// Hands `from`'s full state to every replica listening on `device`'s bus,
/// as a reconnecting peer would.
fn deliver(from: &SyncEngine, device: &TestDevice) {
    let message = ChangeMessage::data_update(&from.state(), now_ms())
        .from_role(from.role())
        .from_replica(from.replica_id());
    device
        .bus
        .publish_raw(&message.to_json().expect("encode message"));
}

#[tokio::test]
async fn offline_mutations_survive_reload() {
    init_tracing();
    let disk = TestDisk::new();
    let config = || fast_config(WriterRole::Secondary, "tab");

    let tab = disk.replica(config(), false).await;
    assert_eq!(tab.status(), SyncStatus::Offline);
    assert!(tab.add(draft("Blue Backpack")).await.unwrap().is_queued());
    assert!(tab.add(draft("Umbrella")).await.unwrap().is_queued());
    assert!(tab.records().is_empty());
    tab.shutdown();

    let reopened = disk.replica(config(), false).await;
    assert_eq!(reopened.pending().len(), 2);

    // A new offline add must not reuse a pending identifier.
    let outcome = reopened.add(draft("Gloves")).await.unwrap();
    assert!(outcome.is_queued());
    let ids: Vec<RecordId> = reopened
        .pending()
        .iter()
        .map(|e| e.record_id().clone())
        .collect();
    assert_eq!(ids.len(), 3);
    assert_ne!(ids[2], ids[0]);
    assert_ne!(ids[2], ids[1]);

    let report = reopened.set_online(true).await.unwrap().unwrap();
    assert!(report.is_complete());
    assert_eq!(titles(&reopened), vec!["Blue Backpack", "Gloves", "Umbrella"]);
    assert_ne!(reopened.status(), SyncStatus::Offline);
    reopened.shutdown();

    let third = disk.replica(config(), true).await;
    assert!(third.pending().is_empty());
    assert_eq!(third.records().len(), 3);
    third.shutdown();
}

#[tokio::test]
async fn colliding_ids_from_disconnected_replicas_keep_both_records() {
    init_tracing();
    let left = TestDevice::new();
    let right = TestDevice::new();
    let a = left
        .replica_with(fast_config(WriterRole::Secondary, "a").with_id_strategy(IdStrategy::Sequential))
        .await;
    let b = right
        .replica_with(fast_config(WriterRole::Secondary, "b").with_id_strategy(IdStrategy::Sequential))
        .await;

    a.add(draft("Blue Backpack")).await.unwrap();
    b.add(draft("Red Scarf")).await.unwrap();
    assert_eq!(a.records()[0].id, b.records()[0].id);

    deliver(&a, &right);
    deliver(&b, &left);

    let converged = wait_until(SETTLE, || {
        a.records().len() == 2 && a.records() == b.records()
    })
    .await;
    assert!(converged, "replicas did not converge");
    assert_eq!(titles(&a), vec!["Blue Backpack", "Red Scarf"]);

    let moved = RecordId::new("1~b");
    assert_eq!(a.get(&moved).unwrap().field("title"), Some("Red Scarf"));
    assert!(!a.conflicts().is_empty());
    assert!(!b.conflicts().is_empty());

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn claim_survives_a_later_unclaimed_edit() {
    init_tracing();
    let left = TestDevice::new();
    let right = TestDevice::new();
    let a = left.replica(WriterRole::Secondary, "a").await;
    let b = right.replica(WriterRole::Secondary, "b").await;

    a.add(draft("Wallet")).await.unwrap();
    deliver(&a, &right);
    assert!(wait_until(SETTLE, || b.records().len() == 1).await);
    let id = a.records()[0].id.clone();

    a.claim(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut edited = b.get(&id).unwrap();
    edited.fields.insert("location".into(), "Front desk".into());
    b.update(edited).await.unwrap();
    assert_eq!(b.get(&id).unwrap().status, ClaimStatus::Unclaimed);

    deliver(&a, &right);
    deliver(&b, &left);

    let settled = wait_until(SETTLE, || {
        [&a, &b].iter().all(|r| {
            r.get(&id).is_some_and(|record| {
                record.status == ClaimStatus::Claimed
                    && record.field("location") == Some("Front desk")
            })
        })
    })
    .await;
    assert!(settled, "claim or edit was lost");

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn failing_primary_still_delivers_within_a_poll_interval() {
    init_tracing();
    let device = TestDevice::new();
    let (a, channel) = device
        .replica_with_failing_primary(WriterRole::Secondary, "a")
        .await;
    let b = device.replica(WriterRole::Secondary, "b").await;

    assert!(channel.attempts() > 0);
    assert_ne!(a.transport_mode(), TransportMode::Broadcast);
    assert_eq!(a.status(), SyncStatus::Degraded);

    a.add(draft("Keys")).await.unwrap();
    let delivered = wait_until(FAST_POLL_MAX + Duration::from_millis(100), || {
        titles(&b) == vec!["Keys"]
    })
    .await;
    assert!(delivered, "change did not reach the other replica");

    // The healthy replica is unaffected.
    assert_eq!(b.transport_mode(), TransportMode::Broadcast);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn secondary_waits_for_expected_primary() {
    init_tracing();
    let device = TestDevice::new();
    let tab = device
        .replica_with(fast_config(WriterRole::Secondary, "tab").expecting_primary())
        .await;
    assert_eq!(tab.status(), SyncStatus::PeerUnreachable);

    let admin = device.replica(WriterRole::Primary, "admin").await;
    assert!(wait_until(SETTLE, || tab.status() == SyncStatus::Optimal).await);

    admin.add(draft("Laptop")).await.unwrap();
    assert!(wait_until(SETTLE, || tab.records().len() == 1).await);
    assert_eq!(
        tab.records()[0].updated_by,
        tabsync_protocol::UpdatedBy::PrimaryWriter
    );

    admin.shutdown();
    tab.shutdown();
}

#[tokio::test]
async fn colliding_offline_adds_keep_both_records_after_draining() {
    init_tracing();
    let device = TestDevice::new();
    let sequential =
        |id: &str| fast_config(WriterRole::Secondary, id).with_id_strategy(IdStrategy::Sequential);
    let a = device.replica_with(sequential("a")).await;
    let b = device.replica_with(sequential("b")).await;
    a.set_online(false).await.unwrap();
    b.set_online(false).await.unwrap();

    assert!(b.add(draft("Red Scarf")).await.unwrap().is_queued());
    assert!(a.add(draft("Blue Backpack")).await.unwrap().is_queued());
    assert_eq!(a.pending()[0].record_id(), b.pending()[0].record_id());

    a.set_online(true).await.unwrap();
    assert!(wait_until(SETTLE, || b.records().len() == 1).await);

    // b's queued add now targets an identifier a already used.
    let report = b.set_online(true).await.unwrap().unwrap();
    assert!(report.is_complete());
    assert!(b.pending().is_empty());

    let both = vec!["Blue Backpack".to_string(), "Red Scarf".to_string()];
    let converged = wait_until(SETTLE, || titles(&a) == both && titles(&b) == both).await;
    assert!(converged, "a queued record was lost");

    let moved = RecordId::new("1~b");
    assert_eq!(b.get(&moved).unwrap().field("title"), Some("Red Scarf"));
    assert_eq!(
        a.get(&RecordId::from(1u64)).unwrap().field("title"),
        Some("Blue Backpack")
    );
    assert!(!b.conflicts().is_empty());

    a.shutdown();
    b.shutdown();
}
