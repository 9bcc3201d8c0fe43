use std::sync::Mutex as StdMutex;

use tokio::sync::Barrier;

use super::*;
use crate::catalog::StaticCatalog;
use crate::limits::*;
use crate::model::fixtures::requester;

const H: Ms = 3_600_000; // 1 hour in ms
const DAY: Ms = 24 * H;
const T0: Ms = 1_767_254_400_000; // 2026-01-01T08:00:00Z

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("interlock_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn test_catalog() -> Arc<dyn Catalog> {
    let resource = |id: &str| Resource {
        id: ResourceId::new(id),
        name: id.to_uppercase(),
        category: Category::Room,
        capacity: Some(40),
        requirements: vec![],
    };
    Arc::new(StaticCatalog::new(["hall", "lab", "annex"].map(resource)).unwrap())
}

fn open_store(name: &str) -> BookingStore {
    BookingStore::open(StoreConfig::new(test_wal_path(name)), test_catalog()).unwrap()
}

fn payload(name: &str) -> BookingPayload {
    BookingPayload {
        requester: requester(name),
        reason: Some("lecture".into()),
    }
}

fn hall() -> ResourceId {
    ResourceId::new("hall")
}

#[tokio::test]
async fn commit_then_list() {
    let store = open_store("commit_then_list.wal");
    let booking = store
        .try_commit(&hall(), Span::new(T0, T0 + H), payload("Asha"))
        .await
        .unwrap();

    assert_eq!(booking.resource_id, hall());
    assert_eq!(booking.span, Span::new(T0, T0 + H));
    assert_eq!(booking.requester.name, "Asha");
    assert_eq!(booking.reason.as_deref(), Some("lecture"));

    let listed = store.list_for_resource(&hall()).await.unwrap();
    assert_eq!(listed, vec![booking.clone()]);
    assert_eq!(store.get_booking(booking.id).await, Some(booking));
    assert_eq!(store.booking_count(), 1);
}

#[tokio::test]
async fn overlap_rejected_with_conflicting_id() {
    let store = open_store("overlap_rejected.wal");
    let first = store
        .try_commit(&hall(), Span::new(T0, T0 + 2 * H), payload("Asha"))
        .await
        .unwrap();

    for span in [
        Span::new(T0 + H, T0 + 3 * H),     // tail overlap
        Span::new(T0 - H, T0 + 1),         // head overlap
        Span::new(T0 + 10, T0 + 20),       // contained
        Span::new(T0 - H, T0 + 3 * H),     // containing
        Span::new(T0, T0 + 2 * H),         // identical
    ] {
        let err = store
            .try_commit(&hall(), span, payload("Ravi"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::Conflict(id) if id == first.id),
            "{span:?}: {err}"
        );
    }
    assert_eq!(store.list_for_resource(&hall()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn adjacent_intervals_both_commit() {
    let store = open_store("adjacent.wal");
    store
        .try_commit(&hall(), Span::new(T0, T0 + H), payload("Asha"))
        .await
        .unwrap();
    store
        .try_commit(&hall(), Span::new(T0 + H, T0 + 2 * H), payload("Ravi"))
        .await
        .unwrap();
    store
        .try_commit(&hall(), Span::new(T0 - H, T0), payload("Meera"))
        .await
        .unwrap();

    let starts: Vec<Ms> = store
        .list_for_resource(&hall())
        .await
        .unwrap()
        .iter()
        .map(|b| b.span.start)
        .collect();
    assert_eq!(starts, vec![T0 - H, T0, T0 + H]);
}

#[tokio::test]
async fn repeated_request_is_rejected_not_duplicated() {
    let store = open_store("repeat.wal");
    let span = Span::new(T0, T0 + H);
    let first = store.try_commit(&hall(), span, payload("Asha")).await.unwrap();
    let again = store.try_commit(&hall(), span, payload("Asha")).await;
    assert!(matches!(again, Err(StoreError::Conflict(id)) if id == first.id));
    assert_eq!(store.booking_count(), 1);
}

#[tokio::test]
async fn invalid_intervals_rejected() {
    let store = open_store("invalid.wal");
    for span in [Span { start: T0, end: T0 }, Span { start: T0 + H, end: T0 }] {
        let err = store.try_commit(&hall(), span, payload("Asha")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInterval { .. }), "{span:?}: {err}");
    }

    // Well ordered but past a cap.
    let capped = [
        Span { start: -5, end: 10 },
        Span { start: T0, end: MAX_VALID_TIMESTAMP_MS + 1 },
        Span { start: T0, end: T0 + MAX_SPAN_DURATION_MS + 1 },
    ];
    for span in capped {
        let err = store.try_commit(&hall(), span, payload("Asha")).await.unwrap_err();
        assert!(matches!(err, StoreError::LimitExceeded(_)), "{span:?}: {err}");
    }
    assert_eq!(store.booking_count(), 0);
}

#[tokio::test]
async fn invalid_interval_checked_before_resource() {
    let store = open_store("invalid_before_resource.wal");
    let err = store
        .try_commit(&"gym".into(), Span { start: T0, end: T0 }, payload("Asha"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidInterval { .. }));
}

#[tokio::test]
async fn unknown_resource_rejected() {
    let store = open_store("unknown_resource.wal");
    let err = store
        .try_commit(&"gym".into(), Span::new(T0, T0 + H), payload("Asha"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(ref id) if id.as_str() == "gym"));

    let err = store.list_for_resource(&"gym".into()).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    // Catalog resources with no bookings list as empty.
    assert!(store.list_for_resource(&"annex".into()).await.unwrap().is_empty());
}

#[tokio::test]
async fn resources_are_independent() {
    let store = open_store("independent.wal");
    let span = Span::new(T0, T0 + H);
    store.try_commit(&hall(), span, payload("Asha")).await.unwrap();
    store.try_commit(&"lab".into(), span, payload("Ravi")).await.unwrap();

    assert_eq!(store.list_for_resource(&hall()).await.unwrap().len(), 1);
    assert_eq!(store.list_for_resource(&"lab".into()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rejection_leaves_no_trace() {
    let path = test_wal_path("no_trace.wal");
    let store = BookingStore::open(StoreConfig::new(path.clone()), test_catalog()).unwrap();
    store
        .try_commit(&hall(), Span::new(T0, T0 + H), payload("Asha"))
        .await
        .unwrap();
    let before = std::fs::metadata(&path).unwrap().len();

    assert!(
        store
            .try_commit(&hall(), Span::new(T0, T0 + H), payload("Ravi"))
            .await
            .is_err()
    );
    assert!(
        store
            .try_commit(&"gym".into(), Span::new(T0, T0 + H), payload("Ravi"))
            .await
            .is_err()
    );
    assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
    assert_eq!(store.wal_appends_since_compact().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_commit_once() {
    let store = Arc::new(open_store("concurrent_identical.wal"));
    let span = Span::new(T0, T0 + H);

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .try_commit(&hall(), span, payload(&format!("user{i}")))
                    .await
            })
        })
        .collect();

    let mut committed = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => committed += 1,
            Err(StoreError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(conflicts, 31);
    assert_eq!(store.list_for_resource(&hall()).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_requests_all_commit() {
    let store = Arc::new(open_store("concurrent_disjoint.wal"));

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let store = store.clone();
            let resource = if i % 2 == 0 { hall() } else { ResourceId::new("lab") };
            let span = Span::new(T0 + i * H, T0 + i * H + H);
            tokio::spawn(async move { store.try_commit(&resource, span, payload("Asha")).await })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(store.booking_count(), 50);
    let hall_bookings = store.list_for_resource(&hall()).await.unwrap();
    assert_eq!(hall_bookings.len(), 25);
    assert!(
        hall_bookings
            .windows(2)
            .all(|w| w[0].span.end <= w[1].span.start)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_staggered_requests_never_overlap() {
    use crate::service::{BookingError, BookingRequest, BookingService};

    let service = Arc::new(BookingService::new(open_store("concurrent_staggered.wal")));
    let half_hour = H / 2;
    let handles: Vec<_> = (0..64)
        .map(|i| {
            let service = service.clone();
            let start = T0 + i * half_hour;
            tokio::spawn(async move {
                let request = BookingRequest {
                    resource_id: Some("hall".into()),
                    start: Some(start.to_string()),
                    end: Some((start + H).to_string()),
                    requester_name: Some(format!("user{i}")),
                    requester_contact: Some(format!("user{i}@campus.example")),
                    requester_role: Some("Student".into()),
                    reason: None,
                };
                (Span::new(start, start + H), service.request_booking(request).await)
            })
        })
        .collect();

    let mut rejected = Vec::new();
    let mut committed = 0;
    for h in handles {
        match h.await.unwrap() {
            (_, Ok(_)) => committed += 1,
            (span, Err(BookingError::SlotOccupied { conflicting })) => {
                rejected.push((span, conflicting))
            }
            (_, Err(e)) => panic!("unexpected error: {e}"),
        }
    }

    let booked = service.store().list_for_resource(&hall()).await.unwrap();
    assert_eq!(booked.len(), committed);
    assert_eq!(service.store().booking_count(), committed);
    for (i, a) in booked.iter().enumerate() {
        for b in &booked[i + 1..] {
            assert!(!a.span.overlaps(&b.span), "{:?} overlaps {:?}", a.span, b.span);
        }
    }
    // Every rejection names a committed booking that really overlaps it.
    for (span, conflicting) in rejected {
        let holder = booked.iter().find(|b| b.id == conflicting).unwrap();
        assert!(holder.span.overlaps(&span));
    }
}

#[tokio::test]
async fn failed_wal_flush_leaves_no_trace_after_restart() {
    let path = test_wal_path("failed_flush.wal");
    {
        let store = BookingStore::open(StoreConfig::new(path.clone()), test_catalog()).unwrap();
        store
            .wal_fault
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = store
            .try_commit(&hall(), Span::new(T0, T0 + 2 * H), payload("Ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WalError(_)));
        assert!(store.list_for_resource(&hall()).await.unwrap().is_empty());

        store
            .try_commit(&hall(), Span::new(T0 + H, T0 + 3 * H), payload("Real"))
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let replay = crate::wal::Wal::replay(&path).unwrap();
    assert!(!replay.discarded_tail);
    assert_eq!(replay.events.len(), 1);

    let store = BookingStore::open(StoreConfig::new(path), test_catalog()).unwrap();
    let names: Vec<_> = store
        .list_for_resource(&hall())
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.requester.name)
        .collect();
    assert_eq!(names, vec!["Real"]);
}

/// Check and insert as two separate steps, the way a store without an
/// exclusion scope would do it.
struct NaiveStore {
    spans: StdMutex<Vec<Span>>,
}

impl NaiveStore {
    fn is_free(&self, span: &Span) -> bool {
        !self.spans.lock().unwrap().iter().any(|s| s.overlaps(span))
    }

    fn insert(&self, span: Span) {
        self.spans.lock().unwrap().push(span);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn check_then_insert_double_books_but_try_commit_does_not() {
    let span = Span::new(T0, T0 + H);

    // Both callers pass the check before either inserts.
    let naive = Arc::new(NaiveStore {
        spans: StdMutex::new(Vec::new()),
    });
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let naive = naive.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let free = naive.is_free(&span);
                barrier.wait().await;
                if free {
                    naive.insert(span);
                }
                free
            })
        })
        .collect();
    for h in handles {
        assert!(h.await.unwrap());
    }
    assert_eq!(naive.spans.lock().unwrap().len(), 2);

    // Same interleaving against the store: exactly one wins.
    let store = Arc::new(open_store("naive_vs_atomic.wal"));
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["Asha", "Ravi"]
        .into_iter()
        .map(|name| {
            let store = store.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                store.try_commit(&hall(), span, payload(name)).await
            })
        })
        .collect();
    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(store.booking_count(), 1);
}

#[tokio::test]
async fn busy_when_lock_not_acquired_in_time() {
    let config = StoreConfig::new(test_wal_path("busy.wal"))
        .with_lock_timeout(Duration::from_millis(50));
    let store = BookingStore::open(config, test_catalog()).unwrap();

    let held = store.lock_for_commit(&hall()).await.unwrap();
    let err = store
        .try_commit(&hall(), Span::new(T0, T0 + H), payload("Asha"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Busy { ref resource_id, .. } if *resource_id == hall()));
    assert!(err.is_transient());

    // Other resources are not blocked by the held lock.
    store
        .try_commit(&"lab".into(), Span::new(T0, T0 + H), payload("Asha"))
        .await
        .unwrap();

    drop(held);
    store
        .try_commit(&hall(), Span::new(T0, T0 + H), payload("Asha"))
        .await
        .unwrap();
}

#[tokio::test]
async fn dropped_caller_leaves_no_partial_commit() {
    let store = Arc::new(open_store("dropped_caller.wal"));
    let span = Span::new(T0, T0 + H);

    let held = store.lock_for_commit(&hall()).await.unwrap();
    let pending = {
        let store = store.clone();
        tokio::spawn(async move { store.try_commit(&hall(), span, payload("Asha")).await })
    };
    tokio::task::yield_now().await;
    pending.abort();
    let _ = pending.await;
    drop(held);

    assert!(store.list_for_resource(&hall()).await.unwrap().is_empty());
    store.try_commit(&hall(), span, payload("Ravi")).await.unwrap();
}

#[tokio::test]
async fn limit_on_bookings_per_resource() {
    let store = open_store("limit.wal");
    {
        let guard = store.lock_for_commit(&hall()).await.unwrap();
        let mut state = guard.state;
        for i in 0..MAX_BOOKINGS_PER_RESOURCE as Ms {
            let mut b = crate::model::fixtures::booking("hall", i * 10, i * 10 + 5);
            b.requester = requester("Bulk");
            state.insert_booking(b);
        }
    }
    let err = store
        .try_commit(&hall(), Span::new(T0, T0 + H), payload("Asha"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LimitExceeded(_)));
}

#[tokio::test]
async fn wal_replay_restores_bookings() {
    let path = test_wal_path("replay.wal");
    let (kept, cancelled) = {
        let store = BookingStore::open(StoreConfig::new(path.clone()), test_catalog()).unwrap();
        let kept = store
            .try_commit(&hall(), Span::new(T0, T0 + H), payload("Asha"))
            .await
            .unwrap();
        let cancelled = store
            .try_commit(&"lab".into(), Span::new(T0, T0 + H), payload("Ravi"))
            .await
            .unwrap();
        store.cancel_booking(cancelled.id).await.unwrap();
        store.close().await.unwrap();
        (kept, cancelled)
    };

    let store = BookingStore::open(StoreConfig::new(path), test_catalog()).unwrap();
    assert_eq!(store.list_for_resource(&hall()).await.unwrap(), vec![kept.clone()]);
    assert!(store.list_for_resource(&"lab".into()).await.unwrap().is_empty());
    assert_eq!(store.get_booking(cancelled.id).await, None);

    // Replayed bookings still block.
    let err = store
        .try_commit(&hall(), Span::new(T0 + 1, T0 + 2), payload("Meera"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(id) if id == kept.id));
}

#[tokio::test]
async fn replay_skips_overlapping_events() {
    let path = test_wal_path("replay_overlap.wal");
    let first = crate::model::fixtures::booking("hall", T0, T0 + H);
    let overlapping = crate::model::fixtures::booking("hall", T0 + 1, T0 + 2);
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::BookingCommitted { booking: first.clone() }).unwrap();
        wal.append(&Event::BookingCommitted { booking: overlapping }).unwrap();
    }

    let store = BookingStore::open(StoreConfig::new(path), test_catalog()).unwrap();
    assert_eq!(store.list_for_resource(&hall()).await.unwrap(), vec![first]);
}

#[tokio::test]
async fn cancel_frees_interval() {
    let store = open_store("cancel.wal");
    let span = Span::new(T0, T0 + H);
    let booking = store.try_commit(&hall(), span, payload("Asha")).await.unwrap();

    let cancelled = store.cancel_booking(booking.id).await.unwrap();
    assert_eq!(cancelled, booking);
    assert_eq!(store.booking_count(), 0);

    let err = store.cancel_booking(booking.id).await.unwrap_err();
    assert!(matches!(err, StoreError::BookingNotFound(id) if id == booking.id));

    store.try_commit(&hall(), span, payload("Ravi")).await.unwrap();
}

#[tokio::test]
async fn compaction_keeps_live_bookings_only() {
    let path = test_wal_path("compaction.wal");
    let store = BookingStore::open(StoreConfig::new(path.clone()), test_catalog()).unwrap();

    for day in 0..10 {
        let b = store
            .try_commit(&hall(), Span::new(T0 + day * DAY, T0 + day * DAY + H), payload("Asha"))
            .await
            .unwrap();
        store.cancel_booking(b.id).await.unwrap();
    }
    let live = store
        .try_commit(&"lab".into(), Span::new(T0, T0 + H), payload("Ravi"))
        .await
        .unwrap();
    assert_eq!(store.wal_appends_since_compact().await, 21);
    let before = std::fs::metadata(&path).unwrap().len();

    assert_eq!(store.compact_wal().await.unwrap(), 1);
    assert_eq!(store.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&path).unwrap().len() < before);

    let later = store
        .try_commit(&hall(), Span::new(T0, T0 + H), payload("Meera"))
        .await
        .unwrap();
    store.close().await.unwrap();

    let events = Wal::replay(&path).unwrap().events;
    assert_eq!(
        events,
        vec![
            Event::BookingCommitted { booking: live },
            Event::BookingCommitted { booking: later },
        ]
    );
}

#[tokio::test]
async fn closed_store_rejects_mutations() {
    let store = open_store("closed.wal");
    let booking = store
        .try_commit(&hall(), Span::new(T0, T0 + H), payload("Asha"))
        .await
        .unwrap();
    store.close().await.unwrap();

    let err = store
        .try_commit(&hall(), Span::new(T0 + H, T0 + 2 * H), payload("Ravi"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Closed));
    assert!(matches!(
        store.cancel_booking(booking.id).await,
        Err(StoreError::Closed)
    ));
    // Reads still work and show nothing half-applied.
    assert_eq!(store.list_for_resource(&hall()).await.unwrap(), vec![booking]);
    // Closing twice is harmless.
    store.close().await.unwrap();
}
