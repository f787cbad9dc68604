//! Both backends must agree on the conditional-write primitives.

mod common;

use chrono::Duration;
use shardlock_store::{
    ActionFlags, LockCookie, Precondition, SessionBackend, SessionKey, SessionRecord,
    SessionUpdate, WriteConcern,
};

use common::{ALL_KINDS, BackendKind, backends, now_millis};

fn record(app: &str, id: &str, expires_in: Duration) -> SessionRecord {
    let now = now_millis();
    SessionRecord {
        key: SessionKey::new(app, id),
        created_at: now,
        expires_at: now + expires_in,
        timeout_minutes: 20,
        flags: ActionFlags::NONE,
        payload: vec![0, 1, 2, 3],
        lock: None,
    }
}

fn for_each_backend(test: impl Fn(BackendKind, &dyn SessionBackend)) {
    for kind in ALL_KINDS {
        let fixture = backends(kind, 1);
        test(kind, fixture.backends[0].as_ref());
    }
}

#[test]
fn test_upsert_and_find() {
    for_each_backend(|kind, backend| {
        let rec = record("app", "s1", Duration::minutes(20));
        backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();

        assert_eq!(backend.find(&rec.key).unwrap(), Some(rec.clone()), "{kind:?}");
        assert_eq!(backend.find(&SessionKey::new("app", "other")).unwrap(), None);
        assert_eq!(backend.find(&SessionKey::new("other", "s1")).unwrap(), None);
    });
}

#[test]
fn test_upsert_replaces_including_lock() {
    for_each_backend(|kind, backend| {
        let mut rec = record("app", "s1", Duration::minutes(20));
        rec.lock = Some(LockCookie::new(now_millis()));
        backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();

        let fresh = record("app", "s1", Duration::minutes(5));
        backend.upsert(&fresh, WriteConcern::Acknowledged).unwrap();
        let stored = backend.find(&fresh.key).unwrap().unwrap();
        assert!(stored.lock.is_none(), "{kind:?}");
        assert_eq!(stored.expires_at, fresh.expires_at, "{kind:?}");
    });
}

#[test]
fn test_lock_predicates() {
    for_each_backend(|kind, backend| {
        let rec = record("app", "s1", Duration::minutes(20));
        backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();

        let first = LockCookie::new(now_millis());
        let second = LockCookie::new(now_millis());

        let locked = backend
            .find_and_modify(
                &rec.key,
                &Precondition::unlocked(),
                &SessionUpdate::new().set_lock(first.clone()),
                WriteConcern::Acknowledged,
            )
            .unwrap();
        assert_eq!(locked.and_then(|r| r.lock), Some(first.clone()), "{kind:?}");

        let contended = backend
            .find_and_modify(
                &rec.key,
                &Precondition::unlocked(),
                &SessionUpdate::new().set_lock(second.clone()),
                WriteConcern::Acknowledged,
            )
            .unwrap();
        assert!(contended.is_none(), "{kind:?}");

        let wrong_holder = backend
            .find_and_modify(
                &rec.key,
                &Precondition::held_by(&second),
                &SessionUpdate::new().clear_lock().payload(vec![9]),
                WriteConcern::Acknowledged,
            )
            .unwrap();
        assert!(wrong_holder.is_none(), "{kind:?}");
        let unchanged = backend.find(&rec.key).unwrap().unwrap();
        assert_eq!(unchanged.payload, rec.payload, "{kind:?}");

        let released = backend
            .find_and_modify(
                &rec.key,
                &Precondition::held_by(&first),
                &SessionUpdate::new().clear_lock().payload(vec![9]),
                WriteConcern::Acknowledged,
            )
            .unwrap()
            .unwrap();
        assert!(released.lock.is_none(), "{kind:?}");
        assert_eq!(released.payload, vec![9], "{kind:?}");
    });
}

#[test]
fn test_expiry_snapshot_predicate() {
    for_each_backend(|kind, backend| {
        let rec = record("app", "s1", -Duration::minutes(1));
        backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();

        let stale = Precondition::expires_at(rec.expires_at + Duration::milliseconds(1));
        let update = SessionUpdate::new().set_lock(LockCookie::new(now_millis()));
        assert!(
            backend
                .find_and_modify(&rec.key, &stale, &update, WriteConcern::Acknowledged)
                .unwrap()
                .is_none(),
            "{kind:?}"
        );

        let current = Precondition::expires_at(rec.expires_at);
        assert!(
            backend
                .find_and_modify(&rec.key, &current, &update, WriteConcern::Acknowledged)
                .unwrap()
                .is_some(),
            "{kind:?}"
        );
    });
}

#[test]
fn test_conditional_delete() {
    for_each_backend(|kind, backend| {
        let mut rec = record("app", "s1", Duration::minutes(20));
        let holder = LockCookie::new(now_millis());
        rec.lock = Some(holder.clone());
        backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();

        let stranger = LockCookie::new(now_millis());
        assert!(
            !backend
                .delete_if(&rec.key, &Precondition::held_by(&stranger), WriteConcern::Acknowledged)
                .unwrap(),
            "{kind:?}"
        );
        assert!(
            backend
                .delete_if(&rec.key, &Precondition::held_by(&holder), WriteConcern::Acknowledged)
                .unwrap(),
            "{kind:?}"
        );
        assert!(backend.find(&rec.key).unwrap().is_none(), "{kind:?}");
        assert!(
            !backend
                .delete_if(&rec.key, &Precondition::exists(), WriteConcern::Acknowledged)
                .unwrap(),
            "{kind:?}"
        );
    });
}

#[test]
fn test_expiring_before_is_sorted_capped_and_scoped() {
    for_each_backend(|kind, backend| {
        for (id, minutes) in [("c", -3), ("a", -10), ("b", -5), ("fresh", 10)] {
            backend
                .upsert(&record("app", id, Duration::minutes(minutes)), WriteConcern::Acknowledged)
                .unwrap();
        }
        backend
            .upsert(&record("other", "z", -Duration::minutes(30)), WriteConcern::Acknowledged)
            .unwrap();

        let now = now_millis();
        let ids: Vec<String> = backend
            .expiring_before("app", now, 10)
            .unwrap()
            .into_iter()
            .map(|c| c.session_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"], "{kind:?}");

        let capped = backend.expiring_before("app", now, 2).unwrap();
        assert_eq!(capped.len(), 2, "{kind:?}");
        assert_eq!(backend.count("app").unwrap(), 4, "{kind:?}");
        assert_eq!(backend.count("other").unwrap(), 1, "{kind:?}");
    });
}

#[test]
fn test_sqlite_connections_share_locks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let first = shardlock_store::SqliteBackend::open(&path).unwrap();
    let second = shardlock_store::SqliteBackend::open(&path).unwrap();

    let rec = record("app", "s1", Duration::minutes(20));
    first.upsert(&rec, WriteConcern::Acknowledged).unwrap();

    let cookie = LockCookie::new(now_millis());
    assert!(
        first
            .find_and_modify(
                &rec.key,
                &Precondition::unlocked(),
                &SessionUpdate::new().set_lock(cookie.clone()),
                WriteConcern::Acknowledged,
            )
            .unwrap()
            .is_some()
    );
    assert!(
        second
            .find_and_modify(
                &rec.key,
                &Precondition::unlocked(),
                &SessionUpdate::new().set_lock(LockCookie::new(now_millis())),
                WriteConcern::Acknowledged,
            )
            .unwrap()
            .is_none()
    );
    assert_eq!(second.find(&rec.key).unwrap().unwrap().lock, Some(cookie));
}
