//! End-to-end store behavior over memory and SQLite backends.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::Duration;
use parking_lot::Mutex;
use shardlock_store::{
    ActionFlags, Clock, ExpirableStore, ExpirationSweeper, ItemState, LockCookie, LockStatus,
    ReadOutcome, SessionItem, SessionKey, SessionStateStore, SinkError, StoreConfig, route,
};
use tokio_util::sync::CancellationToken;

use common::{ALL_KINDS, APP, backends, manual_clock, store};

fn partitioned_config(partitions: usize) -> StoreConfig {
    StoreConfig::new()
        .with_application(APP)
        .with_partition_count(partitions)
}

#[test]
fn test_four_partition_lock_scenario() {
    for kind in ALL_KINDS {
        let fixture = backends(kind, 4);
        let clock = manual_clock();
        let store = store(&partitioned_config(4), &fixture, &clock);

        let abc = SessionItem::new(b"abc-state".to_vec(), 20);
        let xyz = SessionItem::new(b"xyz-state".to_vec(), 5);
        store.insert_item(APP, "abc", ActionFlags::NONE, &abc).unwrap();
        store.insert_item(APP, "xyz", ActionFlags::NONE, &xyz).unwrap();

        assert_eq!(route("abc", 4), route("abc", 4));
        assert_eq!(route("abc", 4), 0);
        assert_eq!(route("xyz", 4), 2);
        let key = SessionKey::new(APP, "abc");
        assert!(store.shard(0).unwrap().backend().find(&key).unwrap().is_some());
        assert!(store.shard(1).unwrap().backend().find(&key).unwrap().is_none());

        let t1 = LockCookie::new(clock.now());
        let t2 = LockCookie::new(clock.now());
        let acquired = store.get_item_exclusive(APP, "abc", &t1).unwrap();
        assert_eq!(acquired.map(|s| s.item), Some(abc), "{kind:?}");
        assert!(store.get_item_exclusive(APP, "abc", &t2).unwrap().is_none(), "{kind:?}");

        match store.get_item_lock(APP, "abc").unwrap() {
            LockStatus::Locked(cookie) => assert_eq!(cookie.token(), t1.token(), "{kind:?}"),
            other => panic!("{kind:?}: expected locked, got {other:?}"),
        }

        let updated = SessionItem::new(b"abc-updated".to_vec(), 20);
        store
            .update_and_release_item(APP, "abc", &t1, ActionFlags::NONE, &updated)
            .unwrap();
        let reacquired = store.get_item_exclusive(APP, "abc", &t2).unwrap();
        assert_eq!(reacquired.map(|s| s.item), Some(updated), "{kind:?}");

        // Untouched by any of the above.
        match store.get_item(APP, "xyz").unwrap() {
            ReadOutcome::Available(state) => assert_eq!(state.item, xyz, "{kind:?}"),
            other => panic!("{kind:?}: expected xyz available, got {other:?}"),
        }
    }
}

#[test]
fn test_concurrent_exclusive_reads_admit_one() {
    for kind in ALL_KINDS {
        let fixture = backends(kind, 1);
        let clock = manual_clock();
        let store = store(&StoreConfig::new().with_application(APP), &fixture, &clock);
        store
            .insert_item(APP, "hot", ActionFlags::NONE, &SessionItem::empty(20))
            .unwrap();

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                let cookie = LockCookie::new(clock.now());
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .get_item_exclusive(APP, "hot", &cookie)
                        .unwrap()
                        .map(|_| cookie)
                })
            })
            .collect();

        let winners: Vec<LockCookie> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners.len(), 1, "{kind:?}");

        store.release_item(APP, "hot", &winners[0]).unwrap();
        let next = LockCookie::new(clock.now());
        assert!(store.get_item_exclusive(APP, "hot", &next).unwrap().is_some(), "{kind:?}");
    }
}

#[test]
fn test_wrong_token_leaves_record_unchanged() {
    for kind in ALL_KINDS {
        let fixture = backends(kind, 1);
        let clock = manual_clock();
        let store = store(&StoreConfig::new().with_application(APP), &fixture, &clock);
        let original = SessionItem::new(b"original".to_vec(), 20);
        store.insert_item(APP, "s1", ActionFlags::NONE, &original).unwrap();

        let holder = LockCookie::new(clock.now());
        store.get_item_exclusive(APP, "s1", &holder).unwrap().unwrap();
        let key = SessionKey::new(APP, "s1");
        let before = fixture.backends[0].find(&key).unwrap().unwrap();

        let stranger = LockCookie::new(clock.now());
        let replacement = SessionItem::new(b"clobbered".to_vec(), 99);
        store
            .update_and_release_item(APP, "s1", &stranger, ActionFlags::UNINITIALIZED, &replacement)
            .unwrap();
        store.release_item(APP, "s1", &stranger).unwrap();
        store.remove_item(APP, "s1", &stranger).unwrap();

        let after = fixture.backends[0].find(&key).unwrap().unwrap();
        assert_eq!(before, after, "{kind:?}");
    }
}

#[test]
fn test_sliding_expiry_never_moves_back() {
    for kind in ALL_KINDS {
        let fixture = backends(kind, 1);
        let clock = manual_clock();
        let store = store(&StoreConfig::new().with_application(APP), &fixture, &clock);
        store
            .insert_item(APP, "s1", ActionFlags::NONE, &SessionItem::empty(10))
            .unwrap();
        let key = SessionKey::new(APP, "s1");

        let mut previous = fixture.backends[0].find(&key).unwrap().unwrap().expires_at;
        for _ in 0..5 {
            clock.advance(Duration::minutes(3));
            store.get_item(APP, "s1").unwrap();
            let current = fixture.backends[0].find(&key).unwrap().unwrap().expires_at;
            assert!(current >= previous, "{kind:?}");
            previous = current;
        }
        assert_eq!(previous, clock.now() + Duration::minutes(10), "{kind:?}");
    }
}

#[test]
fn test_sweep_claims_each_expired_session_once() {
    for kind in ALL_KINDS {
        let fixture = backends(kind, 4);
        let clock = manual_clock();
        let store = store(&partitioned_config(4), &fixture, &clock);

        let expired = 40;
        for i in 0..expired {
            store
                .insert_item(APP, &format!("s-{i}"), ActionFlags::NONE, &SessionItem::empty(1))
                .unwrap();
        }
        store
            .insert_item(APP, "alive", ActionFlags::NONE, &SessionItem::empty(60))
            .unwrap();
        clock.advance(Duration::minutes(2));

        let mut seen = HashSet::new();
        while let Some(claimed) = store.get_expired_item_exclusive(APP, clock.now()).unwrap() {
            assert!(seen.insert(claimed.session_id.clone()), "{kind:?}: claimed twice");
            store
                .remove_item(APP, &claimed.session_id, &claimed.cookie)
                .unwrap();
        }
        assert_eq!(seen.len(), expired, "{kind:?}");
        assert!(matches!(
            store.get_item(APP, "alive").unwrap(),
            ReadOutcome::Available(_)
        ));
    }
}

#[test]
fn test_abandoned_lock_is_reclaimed_after_expiry() {
    for kind in ALL_KINDS {
        let fixture = backends(kind, 1);
        let clock = manual_clock();
        let store = store(&StoreConfig::new().with_application(APP), &fixture, &clock);
        store
            .insert_item(APP, "orphan", ActionFlags::NONE, &SessionItem::empty(1))
            .unwrap();
        let crashed_worker = LockCookie::new(clock.now());
        store
            .get_item_exclusive(APP, "orphan", &crashed_worker)
            .unwrap()
            .unwrap();

        clock.advance(Duration::minutes(5));
        let claimed = store
            .get_expired_item_exclusive(APP, clock.now())
            .unwrap()
            .expect("expired session should be claimable");
        assert_eq!(claimed.session_id, "orphan", "{kind:?}");
        assert_ne!(claimed.cookie, crashed_worker, "{kind:?}");
    }
}

#[test]
fn test_concurrent_sweepers_notify_exactly_once() {
    for kind in ALL_KINDS {
        let fixture = backends(kind, 4);
        let clock = manual_clock();
        let config = partitioned_config(4);
        let seeding_store = store(&config, &fixture, &clock);

        let total = 120;
        for i in 0..total {
            seeding_store
                .insert_item(APP, &format!("s-{i}"), ActionFlags::NONE, &SessionItem::empty(1))
                .unwrap();
        }
        clock.advance(Duration::minutes(2));
        let signal = clock.now();

        let notified = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let instance_store: Arc<dyn ExpirableStore> = store(&config, &fixture, &clock);
                let sink_seen = notified.clone();
                let sink = move |id: &str, _: &ItemState| -> Result<(), SinkError> {
                    sink_seen.lock().push(id.to_string());
                    Ok(())
                };
                let sweeper = ExpirationSweeper::new(APP, instance_store, Arc::new(sink));
                thread::spawn(move || sweeper.sweep(signal, &CancellationToken::new()).unwrap())
            })
            .collect();

        let removed: usize = handles.into_iter().map(|h| h.join().unwrap().removed).sum();
        let notified = notified.lock();
        let unique: HashSet<&String> = notified.iter().collect();
        assert_eq!(removed, total, "{kind:?}");
        assert_eq!(notified.len(), total, "{kind:?}");
        assert_eq!(unique.len(), total, "{kind:?}");
    }
}
