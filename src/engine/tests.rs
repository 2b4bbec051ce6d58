use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use ulid::Ulid;

use super::*;
use crate::notify::NotifyHub;
use crate::store::with_deadline;

const EQ: ResourceId = ResourceId(1);

/// 2026-03-02 00:00 UTC plus `h` hours.
fn t(h: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap() + chrono::Duration::hours(h)
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("labbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

async fn durable(name: &str) -> (Engine, PathBuf) {
    let path = test_wal_path(name);
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    engine.register_equipment(EQ, Some("Confocal microscope".into())).await.unwrap();
    (engine, path)
}

fn reopen(path: &PathBuf) -> Engine {
    Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap()
}

/// Engine whose WAL writer acknowledges the first `ok` appends and fails the rest.
fn engine_with_failing_wal(ok: usize) -> Engine {
    let (tx, mut rx) = mpsc::channel::<WalCommand>(16);
    tokio::spawn(async move {
        let mut seen = 0;
        while let Some(cmd) = rx.recv().await {
            if let WalCommand::Append { response, .. } = cmd {
                seen += 1;
                let r = if seen <= ok {
                    Ok(())
                } else {
                    Err(io::Error::other("disk full"))
                };
                let _ = response.send(r);
            }
        }
    });
    Engine::build(Some(tx), Arc::new(NotifyHub::new()))
}

/// Engine whose WAL writer acks everything at once, except events matching
/// `stalls`: those are held for `delay` and then acked with `outcome`.
fn engine_with_stalling_wal(stalls: fn(&Event) -> bool, delay: Duration, fail: bool) -> Engine {
    let (tx, mut rx) = mpsc::channel::<WalCommand>(16);
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if let WalCommand::Append { event, response } = cmd {
                let r = if stalls(&event) {
                    tokio::time::sleep(delay).await;
                    if fail { Err(io::Error::other("disk full")) } else { Ok(()) }
                } else {
                    Ok(())
                };
                let _ = response.send(r);
            }
        }
    });
    Engine::build(Some(tx), Arc::new(NotifyHub::new()))
}

fn is_create(event: &Event) -> bool {
    matches!(event, Event::ReservationCreated { .. })
}

fn is_cancel(event: &Event) -> bool {
    matches!(event, Event::ReservationCancelled { .. })
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn create_then_get_and_list() {
    let (engine, _) = durable("create_get.wal").await;
    let id = engine
        .create_reservation(EQ, "alice".into(), t(10), t(11))
        .await
        .unwrap();

    let r = engine.get_reservation(id).await.unwrap();
    assert_eq!(r.resource_id, EQ);
    assert_eq!(r.requester_id, RequesterId::from("alice"));
    assert_eq!(r.start(), t(10));
    assert_eq!(r.end(), t(11));

    assert_eq!(engine.reservations_for_equipment(EQ).await, vec![r.clone()]);
    assert_eq!(engine.reservations_for_requester(&"alice".into()).await, vec![r]);
}

#[tokio::test]
async fn conflict_names_existing_reservation() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(EQ, None).await.unwrap();
    let first = engine.create_reservation(EQ, "alice".into(), t(9), t(12)).await.unwrap();

    let err = engine
        .create_reservation(EQ, "bob".into(), t(11), t(13))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { existing } if existing == first));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn unknown_equipment_is_permanent() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    let err = engine
        .create_reservation(ResourceId(42), "alice".into(), t(1), t(2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Permanent(PermanentError::UnknownEquipment(ResourceId(42)))
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn inverted_and_empty_intervals_rejected() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(EQ, None).await.unwrap();

    for (start, end) in [(t(11), t(10)), (t(10), t(10))] {
        let err = engine
            .create_reservation(EQ, "alice".into(), start, end)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }
    assert!(engine.reservations_for_equipment(EQ).await.is_empty());
}

#[tokio::test]
async fn invalid_interval_checked_before_equipment() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    let err = engine
        .create_reservation(ResourceId(99), "alice".into(), t(2), t(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[tokio::test]
async fn empty_requester_rejected() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(EQ, None).await.unwrap();
    let err = engine
        .create_reservation(EQ, "".into(), t(1), t(2))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Permanent(PermanentError::InvalidRequester)));
}

#[tokio::test]
async fn requester_listing_spans_equipment_in_start_order() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(ResourceId(1), None).await.unwrap();
    engine.register_equipment(ResourceId(2), None).await.unwrap();

    let late = engine.create_reservation(ResourceId(1), "alice".into(), t(15), t(16)).await.unwrap();
    let early = engine.create_reservation(ResourceId(2), "alice".into(), t(8), t(9)).await.unwrap();
    engine.create_reservation(ResourceId(1), "bob".into(), t(9), t(10)).await.unwrap();

    let mine: Vec<Ulid> = engine
        .reservations_for_requester(&"alice".into())
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(mine, vec![early, late]);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_removes_from_every_index() {
    let (engine, _) = durable("cancel_indexes.wal").await;
    let id = engine.create_reservation(EQ, "alice".into(), t(1), t(2)).await.unwrap();
    engine.cancel_reservation(id).await.unwrap();

    assert!(matches!(engine.get_reservation(id).await, Err(StoreError::NotFound(_))));
    assert!(engine.reservations_for_equipment(EQ).await.is_empty());
    assert!(engine.reservations_for_requester(&"alice".into()).await.is_empty());
    assert!(!engine.ledger.requester_index.contains_key(&RequesterId::from("alice")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_exactly_one_succeeds() {
    let engine = Arc::new(Engine::ephemeral(Arc::new(NotifyHub::new())));
    engine.register_equipment(EQ, None).await.unwrap();
    let id = engine.create_reservation(EQ, "alice".into(), t(1), t(2)).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let eng = engine.clone();
            tokio::spawn(async move { eng.cancel_reservation(id).await })
        })
        .collect();
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => ok += 1,
            Err(e) => assert!(matches!(e, StoreError::NotFound(x) if x == id)),
        }
    }
    assert_eq!(ok, 1);
}

// ── Equipment registry ───────────────────────────────────

#[tokio::test]
async fn duplicate_registration_rejected() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(EQ, None).await.unwrap();
    let err = engine.register_equipment(EQ, Some("again".into())).await.unwrap_err();
    assert!(matches!(err, StoreError::Permanent(PermanentError::EquipmentExists(EQ))));
}

#[tokio::test]
async fn retire_refused_while_reserved() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(EQ, None).await.unwrap();
    let id = engine.create_reservation(EQ, "alice".into(), t(1), t(2)).await.unwrap();

    let err = engine.retire_equipment(EQ).await.unwrap_err();
    assert!(matches!(err, StoreError::Permanent(PermanentError::EquipmentInUse(EQ))));

    engine.cancel_reservation(id).await.unwrap();
    engine.retire_equipment(EQ).await.unwrap();
    assert!(engine.list_equipment().await.is_empty());

    let err = engine
        .create_reservation(EQ, "alice".into(), t(1), t(2))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Permanent(PermanentError::UnknownEquipment(EQ))));
}

#[tokio::test]
async fn list_equipment_reports_counts() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(ResourceId(2), Some("Centrifuge".into())).await.unwrap();
    engine.register_equipment(ResourceId(1), Some("Spectrometer".into())).await.unwrap();
    engine.create_reservation(ResourceId(2), "alice".into(), t(1), t(2)).await.unwrap();

    let all = engine.list_equipment().await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, ResourceId(1));
    assert_eq!(all[0].reservation_count, 0);
    assert_eq!(all[1].name.as_deref(), Some("Centrifuge"));
    assert_eq!(all[1].reservation_count, 1);
}

#[tokio::test]
async fn name_too_long_rejected() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    let name = "x".repeat(crate::limits::MAX_NAME_LEN + 1);
    let err = engine.register_equipment(EQ, Some(name)).await.unwrap_err();
    assert!(matches!(err, StoreError::Permanent(PermanentError::LimitExceeded(_))));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state_and_indexes() {
    let (engine, path) = durable("replay_state.wal").await;
    let kept = engine.create_reservation(EQ, "alice".into(), t(1), t(2)).await.unwrap();
    let gone = engine.create_reservation(EQ, "bob".into(), t(2), t(3)).await.unwrap();
    engine.cancel_reservation(gone).await.unwrap();
    drop(engine);

    let engine = reopen(&path);
    let all = engine.reservations_for_equipment(EQ).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, kept);
    assert_eq!(engine.get_reservation(kept).await.unwrap().requester_id, RequesterId::from("alice"));
    assert!(engine.reservations_for_requester(&"bob".into()).await.is_empty());
    assert_eq!(engine.list_equipment().await[0].name.as_deref(), Some("Confocal microscope"));

    // The slot freed by the cancellation stays free after replay.
    engine.create_reservation(EQ, "carol".into(), t(2), t(3)).await.unwrap();
}

#[tokio::test]
async fn replay_skips_conflicting_and_orphaned_events() {
    let path = test_wal_path("replay_skip.wal");
    let first = Ulid::new();
    {
        let mut wal = crate::wal::Wal::open(&path).unwrap();
        let span = Span::new(t(1).timestamp_millis(), t(3).timestamp_millis());
        wal.append(&Event::EquipmentRegistered { id: EQ, name: None }).unwrap();
        for id in [first, Ulid::new()] {
            wal.append(&Event::ReservationCreated {
                id,
                resource_id: EQ,
                requester_id: "alice".into(),
                span,
            })
            .unwrap();
        }
        wal.append(&Event::ReservationCreated {
            id: Ulid::new(),
            resource_id: ResourceId(77),
            requester_id: "alice".into(),
            span,
        })
        .unwrap();
    }

    let engine = reopen(&path);
    let all = engine.reservations_for_equipment(EQ).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, first);
    assert_eq!(engine.ledger.reservation_index.len(), 1);
}

#[tokio::test]
async fn retired_equipment_stays_retired_after_replay() {
    let (engine, path) = durable("replay_retired.wal").await;
    engine.retire_equipment(EQ).await.unwrap();
    drop(engine);

    let engine = reopen(&path);
    assert!(engine.list_equipment().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_commit_under_concurrency() {
    let (engine, path) = durable("group_commit.wal").await;
    let engine = Arc::new(engine);

    let n = 48;
    let handles: Vec<_> = (0..n)
        .map(|h| {
            let eng = engine.clone();
            tokio::spawn(async move {
                eng.create_reservation(EQ, format!("user{h}").into(), t(h), t(h + 1))
                    .await
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.reservations_for_equipment(EQ).await.len(), n as usize);
    assert_eq!(engine.wal_appends_since_compact().await, n as u64 + 1);

    let engine2 = reopen(&path);
    let replayed = engine2.reservations_for_equipment(EQ).await;
    assert_eq!(replayed.len(), n as usize);
    assert!(replayed.windows(2).all(|w| w[0].span.end <= w[1].span.start));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (engine, path) = durable("compaction.wal").await;
    for h in 0..20 {
        let id = engine.create_reservation(EQ, "alice".into(), t(h), t(h + 1)).await.unwrap();
        engine.cancel_reservation(id).await.unwrap();
    }
    let kept = engine.create_reservation(EQ, "bob".into(), t(5), t(7)).await.unwrap();
    let before = std::fs::metadata(&path).unwrap().len();

    assert!(engine.compact_if_needed(10).await.unwrap());
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    assert!(!engine.compact_if_needed(10).await.unwrap());
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

    // Appends after compaction land in the new log.
    let later = engine.create_reservation(EQ, "carol".into(), t(8), t(9)).await.unwrap();
    drop(engine);

    let engine = reopen(&path);
    let ids: Vec<Ulid> = engine.reservations_for_equipment(EQ).await.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![kept, later]);
}

#[tokio::test]
async fn ephemeral_engine_never_compacts() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    assert!(!engine.compact_if_needed(0).await.unwrap());
    engine.compact_wal().await.unwrap();
}

// ── WAL failure ──────────────────────────────────────────

#[tokio::test]
async fn failed_append_reverts_create() {
    // Registration is acknowledged, the reservation append fails.
    let engine = engine_with_failing_wal(1);
    engine.register_equipment(EQ, None).await.unwrap();

    let err = engine
        .create_reservation(EQ, "alice".into(), t(1), t(2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(engine.reservations_for_equipment(EQ).await.is_empty());
    assert!(engine.ledger.reservation_index.is_empty());
    assert!(engine.ledger.requester_index.is_empty());
}

#[tokio::test]
async fn failed_append_reverts_cancel() {
    let engine = engine_with_failing_wal(2);
    engine.register_equipment(EQ, None).await.unwrap();
    let id = engine.create_reservation(EQ, "alice".into(), t(1), t(2)).await.unwrap();

    let err = engine.cancel_reservation(id).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(engine.get_reservation(id).await.unwrap().id, id);
    assert_eq!(engine.reservations_for_requester(&"alice".into()).await.len(), 1);
}

#[tokio::test]
async fn failed_append_reverts_registration() {
    let engine = engine_with_failing_wal(0);
    let err = engine.register_equipment(EQ, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(engine.list_equipment().await.is_empty());
}

#[tokio::test]
async fn writer_gone_is_transient() {
    let (tx, rx) = mpsc::channel::<WalCommand>(1);
    drop(rx);
    let engine = Engine::build(Some(tx), Arc::new(NotifyHub::new()));
    let err = engine.register_equipment(EQ, None).await.unwrap_err();
    assert!(matches!(err, StoreError::Transient(ref m) if m.contains("shut down")));
}

// ── Callers dropped mid-commit ───────────────────────────

#[tokio::test]
async fn abandoned_create_rolled_back_when_append_fails() {
    let engine = engine_with_stalling_wal(is_create, Duration::from_millis(50), true);
    engine.register_equipment(EQ, None).await.unwrap();

    let err = with_deadline(
        Duration::from_millis(5),
        engine.create_reservation(EQ, "alice".into(), t(1), t(2)),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    // The read waits for the settling commit to release the equipment lock.
    assert!(engine.reservations_for_equipment(EQ).await.is_empty());
    assert!(engine.ledger.reservation_index.is_empty());
    assert!(engine.ledger.requester_index.is_empty());
}

#[tokio::test]
async fn abandoned_create_kept_when_append_lands() {
    let engine = engine_with_stalling_wal(is_create, Duration::from_millis(50), false);
    engine.register_equipment(EQ, None).await.unwrap();
    let mut rx = engine.subscribe(EQ);

    let err = with_deadline(
        Duration::from_millis(5),
        engine.create_reservation(EQ, "alice".into(), t(1), t(2)),
    )
    .await
    .unwrap_err();
    assert!(err.is_retryable());

    let all = engine.reservations_for_equipment(EQ).await;
    assert_eq!(all.len(), 1);
    assert!(matches!(rx.recv().await.unwrap(), Event::ReservationCreated { id, .. } if id == all[0].id));
}

#[tokio::test]
async fn abandoned_cancel_restored_when_append_fails() {
    let engine = engine_with_stalling_wal(is_cancel, Duration::from_millis(50), true);
    engine.register_equipment(EQ, None).await.unwrap();
    let id = engine.create_reservation(EQ, "alice".into(), t(1), t(2)).await.unwrap();

    let err = with_deadline(Duration::from_millis(5), engine.cancel_reservation(id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    // Waits on the equipment lock, which the settling cancel holds until restored.
    let all = engine.reservations_for_equipment(EQ).await;
    assert_eq!(all.len(), 1);
    assert_eq!(engine.get_reservation(id).await.unwrap().id, id);
    let blocked = engine
        .create_reservation(EQ, "bob".into(), t(1), t(2))
        .await
        .unwrap_err();
    assert!(matches!(blocked, StoreError::Conflict { existing } if existing == id));
}

// ── Equipment lookup and rename ──────────────────────────

#[tokio::test]
async fn equipment_lookup_by_id() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(EQ, Some("Cryostat".into())).await.unwrap();
    engine.create_reservation(EQ, "alice".into(), t(1), t(2)).await.unwrap();

    let info = engine.equipment(EQ).await.unwrap();
    assert_eq!(info.name.as_deref(), Some("Cryostat"));
    assert_eq!(info.reservation_count, 1);

    let err = engine.equipment(ResourceId(5)).await.unwrap_err();
    assert!(matches!(err, StoreError::Permanent(PermanentError::UnknownEquipment(ResourceId(5)))));
}

#[tokio::test]
async fn equipment_search_is_case_insensitive_substring() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(ResourceId(3), Some("Confocal Microscope".into())).await.unwrap();
    engine.register_equipment(ResourceId(1), Some("Electron microscope".into())).await.unwrap();
    engine.register_equipment(ResourceId(2), Some("Centrifuge".into())).await.unwrap();
    engine.register_equipment(ResourceId(4), None).await.unwrap();

    let ids: Vec<ResourceId> = engine
        .equipment_by_name("MICRO")
        .await
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec![ResourceId(1), ResourceId(3)]);
    assert!(engine.equipment_by_name("laser").await.is_empty());
}

#[tokio::test]
async fn rename_survives_replay_and_compaction() {
    let (engine, path) = durable("rename.wal").await;
    engine.rename_equipment(EQ, Some("Spinning disk".into())).await.unwrap();
    drop(engine);

    let engine = reopen(&path);
    assert_eq!(engine.equipment(EQ).await.unwrap().name.as_deref(), Some("Spinning disk"));
    engine.rename_equipment(EQ, None).await.unwrap();
    engine.compact_wal().await.unwrap();
    drop(engine);

    assert_eq!(reopen(&path).equipment(EQ).await.unwrap().name, None);
}

#[tokio::test]
async fn rename_of_retired_equipment_is_unknown() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(EQ, None).await.unwrap();
    engine.retire_equipment(EQ).await.unwrap();
    let err = engine.rename_equipment(EQ, Some("x".into())).await.unwrap_err();
    assert!(matches!(err, StoreError::Permanent(PermanentError::UnknownEquipment(EQ))));
}

#[tokio::test]
async fn failed_rename_keeps_old_name() {
    let engine = engine_with_failing_wal(1);
    engine.register_equipment(EQ, Some("Old".into())).await.unwrap();
    let err = engine.rename_equipment(EQ, Some("New".into())).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(engine.equipment(EQ).await.unwrap().name.as_deref(), Some("Old"));
}

// ── Change feed ──────────────────────────────────────────

#[tokio::test]
async fn subscribers_see_commits_only() {
    let engine = Engine::ephemeral(Arc::new(NotifyHub::new()));
    engine.register_equipment(EQ, None).await.unwrap();
    let mut rx = engine.subscribe(EQ);

    let id = engine.create_reservation(EQ, "alice".into(), t(1), t(2)).await.unwrap();
    let _ = engine.create_reservation(EQ, "bob".into(), t(1), t(2)).await.unwrap_err();
    engine.cancel_reservation(id).await.unwrap();

    assert!(matches!(rx.recv().await.unwrap(), Event::ReservationCreated { id: got, .. } if got == id));
    assert!(matches!(rx.recv().await.unwrap(), Event::ReservationCancelled { id: got, .. } if got == id));
    assert!(rx.try_recv().is_err());
}
