//! SQLite backend.
//!
//! Every conditional primitive is a single SQL statement, so SQLite's
//! statement atomicity provides the check-and-mutate guarantee. Several
//! processes may open the same file; WAL mode plus a busy timeout keeps
//! them from failing on each other's write locks.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use tracing::{debug, info, trace};

use super::{LockMatch, Precondition, SessionBackend, SessionUpdate, WriteConcern};
use crate::cookie::LockCookie;
use crate::error::{Result, StoreError};
use crate::record::{ActionFlags, SessionEndCandidate, SessionKey, SessionRecord};

/// Current schema version, stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 1;

/// How long a writer waits on another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "application, session_id, created_at, expires_at, timeout_minutes, \
                       flags, payload, lock_token, lock_acquired_at";

/// Session backend over a SQLite database file.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let backend = Self::from_connection(conn)?;
        info!("Session database opened at {:?}", path);
        Ok(backend)
    }

    /// Private in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current_version >= SCHEMA_VERSION {
        debug!("Session schema up to date (version {})", current_version);
        return Ok(());
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            application TEXT NOT NULL,
            session_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            timeout_minutes INTEGER NOT NULL,
            flags INTEGER NOT NULL DEFAULT 0,
            payload BLOB NOT NULL,
            lock_token TEXT,
            lock_acquired_at INTEGER,
            PRIMARY KEY (application, session_id)
        );

        -- Expiration scans filter by application and sort by expiry
        CREATE INDEX IF NOT EXISTS idx_sessions_expiry
            ON sessions(application, expires_at);
        "#,
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    info!("Session schema created (version {})", SCHEMA_VERSION);
    Ok(())
}

/// Row as stored, before range checks.
struct RawRow {
    application: String,
    session_id: String,
    created_at: i64,
    expires_at: i64,
    timeout_minutes: i64,
    flags: i64,
    payload: Vec<u8>,
    lock_token: Option<String>,
    lock_acquired_at: Option<i64>,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            application: row.get(0)?,
            session_id: row.get(1)?,
            created_at: row.get(2)?,
            expires_at: row.get(3)?,
            timeout_minutes: row.get(4)?,
            flags: row.get(5)?,
            payload: row.get(6)?,
            lock_token: row.get(7)?,
            lock_acquired_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<SessionRecord> {
        let key = SessionKey::new(self.application, self.session_id);
        let timeout_minutes = u32::try_from(self.timeout_minutes)
            .map_err(|_| StoreError::InvalidRecord(format!("{key}: bad timeout")))?;
        let flags = u32::try_from(self.flags)
            .map_err(|_| StoreError::InvalidRecord(format!("{key}: bad flags")))?;
        let lock = match (self.lock_token, self.lock_acquired_at) {
            (Some(token), Some(at)) => LockCookie::from_parts(token, from_millis(&key, at)?),
            _ => None,
        };

        Ok(SessionRecord {
            created_at: from_millis(&key, self.created_at)?,
            expires_at: from_millis(&key, self.expires_at)?,
            timeout_minutes,
            flags: ActionFlags::from_bits(flags),
            payload: self.payload,
            lock,
            key,
        })
    }
}

fn from_millis(key: &SessionKey, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::InvalidRecord(format!("{key}: timestamp out of range")))
}

/// Append the WHERE clause for `key` and `precondition` to `sql`, numbering
/// parameters after those already in `values`.
fn push_precondition(
    sql: &mut String,
    values: &mut Vec<Box<dyn ToSql>>,
    key: &SessionKey,
    precondition: &Precondition,
) {
    let mut next = values.len() + 1;
    sql.push_str(&format!(
        " WHERE application = ?{} AND session_id = ?{}",
        next,
        next + 1
    ));
    values.push(Box::new(key.application.clone()));
    values.push(Box::new(key.session_id.clone()));
    next += 2;

    match &precondition.lock {
        LockMatch::Any => {}
        LockMatch::Unlocked => sql.push_str(" AND lock_token IS NULL"),
        LockMatch::HeldBy(token) => {
            sql.push_str(&format!(" AND lock_token = ?{next}"));
            values.push(Box::new(token.clone()));
            next += 1;
        }
    }
    if let Some(at) = precondition.expires_at {
        sql.push_str(&format!(" AND expires_at = ?{next}"));
        values.push(Box::new(at.timestamp_millis()));
    }
}

impl SessionBackend for SqliteBackend {
    fn find(&self, key: &SessionKey) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM sessions WHERE application = ?1 AND session_id = ?2"
                ),
                params![key.application, key.session_id],
                RawRow::read,
            )
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    fn find_and_modify(
        &self,
        key: &SessionKey,
        precondition: &Precondition,
        update: &SessionUpdate,
        concern: WriteConcern,
    ) -> Result<Option<SessionRecord>> {
        trace!(key = %key, ?concern, "find_and_modify");

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        let mut set = |column: &str, value: Box<dyn ToSql>, values: &mut Vec<Box<dyn ToSql>>| {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        };

        match &update.lock {
            Some(Some(cookie)) => {
                set("lock_token", Box::new(cookie.token().to_string()), &mut values);
                set(
                    "lock_acquired_at",
                    Box::new(cookie.acquired_at().timestamp_millis()),
                    &mut values,
                );
            }
            Some(None) => {
                set("lock_token", Box::new(Option::<String>::None), &mut values);
                set("lock_acquired_at", Box::new(Option::<i64>::None), &mut values);
            }
            None => {}
        }
        if let Some(at) = update.expires_at {
            set("expires_at", Box::new(at.timestamp_millis()), &mut values);
        }
        if let Some(minutes) = update.timeout_minutes {
            set("timeout_minutes", Box::new(i64::from(minutes)), &mut values);
        }
        if let Some(flags) = update.flags {
            set("flags", Box::new(i64::from(flags.bits())), &mut values);
        }
        if let Some(payload) = &update.payload {
            set("payload", Box::new(payload.clone()), &mut values);
        }

        let mut sql = if sets.is_empty() {
            format!("SELECT {COLUMNS} FROM sessions")
        } else {
            format!("UPDATE sessions SET {}", sets.join(", "))
        };
        push_precondition(&mut sql, &mut values, key, precondition);
        if !sets.is_empty() {
            sql.push_str(&format!(" RETURNING {COLUMNS}"));
        }

        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let conn = self.conn.lock();
        let raw = conn
            .query_row(&sql, params.as_slice(), RawRow::read)
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    fn delete_if(
        &self,
        key: &SessionKey,
        precondition: &Precondition,
        concern: WriteConcern,
    ) -> Result<bool> {
        trace!(key = %key, ?concern, "delete_if");

        let mut sql = String::from("DELETE FROM sessions");
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        push_precondition(&mut sql, &mut values, key, precondition);

        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let deleted = self.conn.lock().execute(&sql, params.as_slice())?;
        Ok(deleted > 0)
    }

    fn upsert(&self, record: &SessionRecord, concern: WriteConcern) -> Result<()> {
        trace!(key = %record.key, ?concern, "upsert");

        let (lock_token, lock_acquired_at) = match &record.lock {
            Some(cookie) => (
                Some(cookie.token().to_string()),
                Some(cookie.acquired_at().timestamp_millis()),
            ),
            None => (None, None),
        };

        self.conn.lock().execute(
            &format!(
                "INSERT INTO sessions ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(application, session_id) DO UPDATE SET
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at,
                    timeout_minutes = excluded.timeout_minutes,
                    flags = excluded.flags,
                    payload = excluded.payload,
                    lock_token = excluded.lock_token,
                    lock_acquired_at = excluded.lock_acquired_at"
            ),
            params![
                record.key.application,
                record.key.session_id,
                record.created_at.timestamp_millis(),
                record.expires_at.timestamp_millis(),
                i64::from(record.timeout_minutes),
                i64::from(record.flags.bits()),
                record.payload,
                lock_token,
                lock_acquired_at,
            ],
        )?;
        Ok(())
    }

    fn expiring_before(
        &self,
        application: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionEndCandidate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, expires_at FROM sessions
             WHERE application = ?1 AND expires_at < ?2
             ORDER BY expires_at ASC, session_id ASC
             LIMIT ?3",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(
            params![application, before.timestamp_millis(), limit],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let mut candidates = Vec::new();
        for row in rows {
            let (session_id, expires_at) = row?;
            let key = SessionKey::new(application, session_id.as_str());
            candidates.push(SessionEndCandidate {
                expires_at: from_millis(&key, expires_at)?,
                session_id,
            });
        }
        Ok(candidates)
    }

    fn count(&self, application: &str) -> Result<usize> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM sessions WHERE application = ?1",
            params![application],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, expires_at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            key: SessionKey::new("app", id),
            created_at: crate::clock::truncate_to_millis(Utc::now()),
            expires_at: crate::clock::truncate_to_millis(expires_at),
            timeout_minutes: 20,
            flags: ActionFlags::UNINITIALIZED,
            payload: vec![0, 1, 2],
            lock: None,
        }
    }

    #[test]
    fn test_upsert_and_find() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let rec = record("s1", Utc::now());
        backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();

        let found = backend.find(&rec.key).unwrap().unwrap();
        assert_eq!(found, rec);
        assert_eq!(backend.count("app").unwrap(), 1);
        assert_eq!(backend.count("other").unwrap(), 0);
    }

    #[test]
    fn test_conditional_update_checks_lock() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let rec = record("s1", Utc::now());
        backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();

        let now = crate::clock::truncate_to_millis(Utc::now());
        let cookie = LockCookie::new(now);
        let locked = backend
            .find_and_modify(
                &rec.key,
                &Precondition::unlocked(),
                &SessionUpdate::new().set_lock(cookie.clone()),
                WriteConcern::Acknowledged,
            )
            .unwrap()
            .unwrap();
        assert_eq!(locked.lock.as_ref().unwrap().acquired_at(), now);

        let again = backend
            .find_and_modify(
                &rec.key,
                &Precondition::unlocked(),
                &SessionUpdate::new().set_lock(LockCookie::new(now)),
                WriteConcern::Acknowledged,
            )
            .unwrap();
        assert!(again.is_none());

        let released = backend
            .find_and_modify(
                &rec.key,
                &Precondition::held_by(&cookie),
                &SessionUpdate::new().clear_lock(),
                WriteConcern::Acknowledged,
            )
            .unwrap()
            .unwrap();
        assert!(released.lock.is_none());
    }

    #[test]
    fn test_empty_update_is_a_conditional_read() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let rec = record("s1", Utc::now());
        backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();

        let found = backend
            .find_and_modify(
                &rec.key,
                &Precondition::expires_at(rec.expires_at),
                &SessionUpdate::new(),
                WriteConcern::Relaxed,
            )
            .unwrap();
        assert_eq!(found, Some(rec));
    }

    #[test]
    fn test_expiring_before_sorted_and_capped() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let base = Utc::now();
        for (i, offset) in [30, 10, 20, 90].iter().enumerate() {
            let rec = record(&format!("s{i}"), base - Duration::minutes(*offset));
            backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();
        }

        let candidates = backend
            .expiring_before("app", base - Duration::minutes(15), 2)
            .unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s0"]);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");
        let rec = record("s1", Utc::now());
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.upsert(&rec, WriteConcern::Acknowledged).unwrap();
        }
        let backend = SqliteBackend::open(&path).unwrap();
        assert_eq!(backend.find(&rec.key).unwrap(), Some(rec));
    }

    #[test]
    fn test_unusable_directory_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = SqliteBackend::open(blocker.join("nested").join("sessions.db")).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)), "unexpected error: {err}");
    }
}
