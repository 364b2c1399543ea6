//! SQLite implementation of a checkpoint store.
//!
//! One DB file holds the snapshots of every operator of a run. Each
//! snapshot is stored with a [`seahash`] digest of its bytes which is
//! checked on load, so a torn or tampered row surfaces as
//! [`PersistenceError::Corrupt`] instead of as garbage operator
//! state.

use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::CheckpointStore;
use crate::errors::PersistenceError;
use crate::recovery::model::*;
use crate::window::WindowId;

fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE snaps ( \
         created_at TEXT NOT NULL, \
         operator_id TEXT NOT NULL, \
         window_id INTEGER NOT NULL, \
         digest INTEGER NOT NULL, \
         snapshot BLOB NOT NULL, \
         PRIMARY KEY (operator_id, window_id) \
         ) STRICT",
    )])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), PersistenceError> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

/// Window ids are unsigned but SQLite integers are not.
fn window_to_sql(window: WindowId) -> Result<i64, PersistenceError> {
    i64::try_from(window.as_u64())
        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)).into())
}

fn digest(bytes: &[u8]) -> i64 {
    // Bit-cast: only equality of digests matters.
    seahash::hash(bytes) as i64
}

/// Use [SQLite](https://sqlite.org/index.html) to store checkpoints.
///
/// DB files and tables will automatically be created if there's no
/// previous checkpoint data.
pub struct SqliteStore {
    db_file: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_file: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let db_file = db_file.as_ref().to_path_buf();
        tracing::debug!("Opening SQLite connection to {db_file:?}");
        let mut conn = Connection::open_with_flags(
            &db_file,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        tracing::debug!("Running any pending SQLite migrations");
        setup_conn(&mut conn)?;
        Ok(Self {
            db_file,
            conn: Mutex::new(conn),
        })
    }

    pub fn db_file(&self) -> &Path {
        &self.db_file
    }

    fn corrupt(operator: &OperatorId, window: WindowId, reason: impl Into<String>) -> PersistenceError {
        PersistenceError::Corrupt {
            operator: operator.clone(),
            window,
            reason: reason.into(),
        }
    }
}

impl CheckpointStore for SqliteStore {
    fn save(
        &self,
        operator: &OperatorId,
        window: WindowId,
        state: &StateBytes,
    ) -> Result<CheckpointInfo, PersistenceError> {
        let info = CheckpointInfo {
            window_id: window,
            size: state.len(),
            created_at: Utc::now(),
        };
        tracing::trace!("Writing {info:?} for {operator}");
        let mut conn = self.conn.lock();
        let txn = conn.transaction()?;
        txn.execute(
            "INSERT INTO snaps (created_at, operator_id, window_id, digest, snapshot) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (operator_id, window_id) DO UPDATE \
             SET created_at = EXCLUDED.created_at, \
             digest = EXCLUDED.digest, \
             snapshot = EXCLUDED.snapshot",
            (
                info.created_at.to_rfc3339(),
                operator.as_str(),
                window_to_sql(window)?,
                digest(state.as_bytes()),
                state.as_bytes(),
            ),
        )?;
        txn.commit()?;
        Ok(info)
    }

    fn load(
        &self,
        operator: &OperatorId,
        window: WindowId,
    ) -> Result<Option<(WindowId, StateBytes)>, PersistenceError> {
        // `u64::MAX` doesn't fit, but anything above `i64::MAX` is
        // "everything" anyway.
        let bound = window_to_sql(window).unwrap_or(i64::MAX);
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT window_id, digest, snapshot \
                 FROM snaps \
                 WHERE operator_id = ?1 AND window_id <= ?2 \
                 ORDER BY window_id DESC \
                 LIMIT 1",
                (operator.as_str(), bound),
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((window, expected, bytes)) => {
                let window = WindowId::from_raw(window as u64);
                let found = digest(&bytes);
                if found != expected {
                    return Err(Self::corrupt(
                        operator,
                        window,
                        format!("digest mismatch: stored {expected:#x}, computed {found:#x}"),
                    ));
                }
                Ok(Some((window, StateBytes::from_vec(bytes))))
            }
        }
    }

    fn list(&self, operator: &OperatorId) -> Result<Vec<CheckpointInfo>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT window_id, length(snapshot), created_at \
             FROM snaps \
             WHERE operator_id = ?1 \
             ORDER BY window_id",
        )?;
        let rows = stmt
            .query_map([operator.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            // We have to collect so that we don't need to retain a
            // reference to the statement in the iterator.
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(window, size, created_at)| {
                let window_id = WindowId::from_raw(window as u64);
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|err| Self::corrupt(operator, window_id, err.to_string()))?
                    .with_timezone(&Utc);
                Ok(CheckpointInfo {
                    window_id,
                    size: usize::try_from(size).unwrap_or_default(),
                    created_at,
                })
            })
            .collect()
    }

    fn purge_before(
        &self,
        operator: &OperatorId,
        window: WindowId,
    ) -> Result<usize, PersistenceError> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM snaps \
             WHERE operator_id = ?1 AND window_id < ?2",
            (operator.as_str(), window_to_sql(window)?),
        )?;
        tracing::trace!("Purged {deleted} checkpoints of {operator} before {window}");
        Ok(deleted)
    }

    fn discard_after(
        &self,
        operator: &OperatorId,
        keep_through: Option<WindowId>,
    ) -> Result<usize, PersistenceError> {
        let conn = self.conn.lock();
        let deleted = match keep_through {
            Some(window) => conn.execute(
                "DELETE FROM snaps \
                 WHERE operator_id = ?1 AND window_id > ?2",
                (operator.as_str(), window_to_sql(window)?),
            )?,
            None => conn.execute(
                "DELETE FROM snaps WHERE operator_id = ?1",
                [operator.as_str()],
            )?,
        };
        if deleted > 0 {
            tracing::debug!("Discarded {deleted} checkpoints of {operator} after {keep_through:?}");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
fn w(seq: u32) -> WindowId {
    WindowId::new(1_700_000_000, seq)
}

#[test]
fn survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.sqlite3");
    let op = OperatorId::new("collector");

    {
        let store = SqliteStore::open(&path).unwrap();
        store.save(&op, w(2), &StateBytes::ser(&2u32).unwrap()).unwrap();
        store.save(&op, w(4), &StateBytes::ser(&4u32).unwrap()).unwrap();
    }

    // Migrations are already applied, opening again is a no-op.
    let store = SqliteStore::open(&path).unwrap();
    let (window, state) = store.load_latest(&op).unwrap().unwrap();
    assert_eq!(window, w(4));
    assert_eq!(state.de::<u32>().unwrap(), 4);
    assert_eq!(store.load(&op, w(3)).unwrap().unwrap().0, w(2));

    let sizes: Vec<_> = store.list(&op).unwrap().iter().map(|i| i.size).collect();
    assert_eq!(sizes, vec![1, 1]);
}

#[test]
fn purge_before_keeps_window() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("db.sqlite3")).unwrap();
    let op = OperatorId::new("op");
    for seq in 1..=4 {
        store.save(&op, w(seq), &StateBytes::empty()).unwrap();
    }
    assert_eq!(store.purge_before(&op, w(3)).unwrap(), 2);
    let windows: Vec<_> = store
        .list(&op)
        .unwrap()
        .into_iter()
        .map(|info| info.window_id)
        .collect();
    assert_eq!(windows, vec![w(3), w(4)]);

    assert_eq!(store.discard_after(&op, Some(w(3))).unwrap(), 1);
    assert_eq!(store.load_latest(&op).unwrap().unwrap().0, w(3));
    assert_eq!(store.discard_after(&op, None).unwrap(), 1);
    assert!(store.load_latest(&op).unwrap().is_none());
}

#[test]
fn tampered_snapshot_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("db.sqlite3")).unwrap();
    let op = OperatorId::new("op");
    store.save(&op, w(1), &StateBytes::ser(&"fine").unwrap()).unwrap();

    store
        .conn
        .lock()
        .execute("UPDATE snaps SET snapshot = x'00'", ())
        .unwrap();
    let err = store.load_latest(&op).unwrap_err();
    assert!(matches!(err, PersistenceError::Corrupt { .. }), "{err}");
}
