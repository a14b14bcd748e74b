//! SQLite-backed sync bookkeeping

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};
use uuid::Uuid;

use super::traits::{AcquireOptions, Acquisition, SyncBookkeeping};
use crate::models::{FolderKey, MailboxKey, SyncRecord};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: folder sync records
        M::up(
            r#"
            CREATE TABLE folder_sync (
                context_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                account_id INTEGER NOT NULL,
                folder TEXT NOT NULL,
                last_synced_ms INTEGER,
                syncing INTEGER NOT NULL DEFAULT 0,
                sync_started_ms INTEGER,
                PRIMARY KEY (context_id, user_id, account_id, folder)
            );

            CREATE INDEX idx_folder_sync_last_synced
                ON folder_sync(context_id, user_id, account_id, last_synced_ms);
            "#,
        ),
        // Migration 2: token of the current holder
        M::up("ALTER TABLE folder_sync ADD COLUMN sync_owner TEXT;"),
    ])
}

const RECORD_COLUMNS: &str =
    "context_id, user_id, account_id, folder, last_synced_ms, syncing, sync_started_ms";

fn millis_to_datetime(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    let mailbox = MailboxKey::new(row.get(0)?, row.get(1)?, row.get(2)?);
    Ok(SyncRecord {
        key: mailbox.folder(row.get::<_, String>(3)?),
        last_synced_at: millis_to_datetime(row.get(4)?),
        syncing: row.get(5)?,
        sync_started_at: millis_to_datetime(row.get(6)?),
    })
}

/// SQLite-based bookkeeping store
///
/// Safe to share between threads and between processes using the same
/// database file: ownership changes are single conditional statements.
pub struct SqliteBookkeeping {
    conn: Mutex<Connection>,
}

impl SqliteBookkeeping {
    /// Open (or create) the bookkeeping database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets discovery reads run while a job flips a syncing flag;
        // busy_timeout makes concurrent processes wait instead of failing.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        Self::with_connection(conn)
    }

    /// Create a private in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SyncBookkeeping for SqliteBookkeeping {
    fn record(&self, key: &FolderKey) -> Result<Option<SyncRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM folder_sync
                     WHERE context_id = ?1 AND user_id = ?2 AND account_id = ?3 AND folder = ?4"
                ),
                params![
                    key.mailbox.context_id,
                    key.mailbox.user_id,
                    key.mailbox.account_id,
                    key.folder
                ],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn insert_if_absent(&self, key: &FolderKey) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO folder_sync (context_id, user_id, account_id, folder)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key.mailbox.context_id,
                key.mailbox.user_id,
                key.mailbox.account_id,
                key.folder
            ],
        )?;
        Ok(inserted == 1)
    }

    fn try_acquire(&self, key: &FolderKey, options: AcquireOptions) -> Result<Acquisition> {
        let conn = self.conn.lock();
        let now_ms = options.now.timestamp_millis();
        let lease_cutoff_ms = (options.now - options.lease).timestamp_millis();
        let synced_cutoff_ms = options.not_synced_since.map(|at| at.timestamp_millis());

        let updated = conn.execute(
            "UPDATE folder_sync SET syncing = 1, sync_started_ms = ?5, sync_owner = ?8
             WHERE context_id = ?1 AND user_id = ?2 AND account_id = ?3 AND folder = ?4
               AND (syncing = 0 OR sync_started_ms IS NULL OR sync_started_ms <= ?6)
               AND (?7 IS NULL OR last_synced_ms IS NULL OR last_synced_ms <= ?7)",
            params![
                key.mailbox.context_id,
                key.mailbox.user_id,
                key.mailbox.account_id,
                key.folder,
                now_ms,
                lease_cutoff_ms,
                synced_cutoff_ms,
                options.owner.to_string(),
            ],
        )?;

        if updated == 1 {
            return Ok(Acquisition::Acquired);
        }

        // Only to tell the caller why; ownership was already decided above
        let syncing: Option<bool> = conn
            .query_row(
                "SELECT syncing FROM folder_sync
                 WHERE context_id = ?1 AND user_id = ?2 AND account_id = ?3 AND folder = ?4",
                params![
                    key.mailbox.context_id,
                    key.mailbox.user_id,
                    key.mailbox.account_id,
                    key.folder
                ],
                |row| row.get(0),
            )
            .optional()?;

        debug!("Could not acquire {} (syncing: {:?})", key, syncing);
        Ok(match syncing {
            Some(false) => Acquisition::RecentlySynced,
            _ => Acquisition::Held,
        })
    }

    fn renew(&self, key: &FolderKey, owner: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let renewed = conn.execute(
            "UPDATE folder_sync SET sync_started_ms = ?5
             WHERE context_id = ?1 AND user_id = ?2 AND account_id = ?3 AND folder = ?4
               AND syncing = 1 AND sync_owner = ?6",
            params![
                key.mailbox.context_id,
                key.mailbox.user_id,
                key.mailbox.account_id,
                key.folder,
                now.timestamp_millis(),
                owner.to_string(),
            ],
        )?;
        Ok(renewed == 1)
    }

    fn release(&self, key: &FolderKey, owner: Uuid, synced_at: Option<DateTime<Utc>>) -> Result<bool> {
        let conn = self.conn.lock();
        let released = conn.execute(
            "UPDATE folder_sync
             SET syncing = 0, sync_started_ms = NULL, sync_owner = NULL,
                 last_synced_ms = COALESCE(?5, last_synced_ms)
             WHERE context_id = ?1 AND user_id = ?2 AND account_id = ?3 AND folder = ?4
               AND syncing = 1 AND sync_owner = ?6",
            params![
                key.mailbox.context_id,
                key.mailbox.user_id,
                key.mailbox.account_id,
                key.folder,
                synced_at.map(|at| at.timestamp_millis()),
                owner.to_string(),
            ],
        )?;
        Ok(released == 1)
    }

    fn delete(&self, key: &FolderKey, owner: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM folder_sync
             WHERE context_id = ?1 AND user_id = ?2 AND account_id = ?3 AND folder = ?4
               AND (syncing = 0 OR sync_owner = ?5)",
            params![
                key.mailbox.context_id,
                key.mailbox.user_id,
                key.mailbox.account_id,
                key.folder,
                owner.to_string(),
            ],
        )?;
        Ok(deleted == 1)
    }

    fn list_stale(&self, mailbox: &MailboxKey, older_than: DateTime<Utc>) -> Result<Vec<SyncRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM folder_sync
             WHERE context_id = ?1 AND user_id = ?2 AND account_id = ?3
               AND (last_synced_ms IS NULL OR last_synced_ms < ?4)
             ORDER BY last_synced_ms ASC, folder ASC"
        ))?;

        let records = stmt
            .query_map(
                params![
                    mailbox.context_id,
                    mailbox.user_id,
                    mailbox.account_id,
                    older_than.timestamp_millis()
                ],
                record_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn inbox() -> FolderKey {
        MailboxKey::new(1, 5, 0).folder("INBOX")
    }

    fn lease() -> Duration {
        Duration::hours(1)
    }

    #[test]
    fn test_insert_if_absent() {
        let store = SqliteBookkeeping::in_memory().unwrap();
        assert!(store.record(&inbox()).unwrap().is_none());

        assert!(store.insert_if_absent(&inbox()).unwrap());
        assert!(!store.insert_if_absent(&inbox()).unwrap());

        let record = store.record(&inbox()).unwrap().unwrap();
        assert_eq!(record, SyncRecord::new(inbox()));
    }

    #[test]
    fn test_acquire_and_release() {
        let store = SqliteBookkeeping::in_memory().unwrap();
        store.insert_if_absent(&inbox()).unwrap();

        let options = AcquireOptions::stale_after(Duration::minutes(10), lease());
        assert_eq!(store.try_acquire(&inbox(), options).unwrap(), Acquisition::Acquired);
        assert_eq!(store.try_acquire(&inbox(), options).unwrap(), Acquisition::Held);

        let synced_at = Utc::now();
        assert!(store.release(&inbox(), options.owner, Some(synced_at)).unwrap());

        let record = store.record(&inbox()).unwrap().unwrap();
        assert!(!record.syncing);
        assert_eq!(
            record.last_synced_at.map(|at| at.timestamp_millis()),
            Some(synced_at.timestamp_millis())
        );

        // Synced a moment ago, so not stale yet
        let options = AcquireOptions::stale_after(Duration::minutes(10), lease());
        assert_eq!(
            store.try_acquire(&inbox(), options).unwrap(),
            Acquisition::RecentlySynced
        );

        // Forcing ignores the staleness span
        assert_eq!(
            store.try_acquire(&inbox(), AcquireOptions::forced(lease())).unwrap(),
            Acquisition::Acquired
        );
    }

    #[test]
    fn test_release_without_timestamp_keeps_last_synced() {
        let store = SqliteBookkeeping::in_memory().unwrap();
        store.insert_if_absent(&inbox()).unwrap();
        let options = AcquireOptions::forced(lease());
        store.try_acquire(&inbox(), options).unwrap();
        store.release(&inbox(), options.owner, None).unwrap();

        let record = store.record(&inbox()).unwrap().unwrap();
        assert!(!record.syncing);
        assert!(record.last_synced_at.is_none());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let store = SqliteBookkeeping::in_memory().unwrap();
        store.insert_if_absent(&inbox()).unwrap();

        let mut stale_holder = AcquireOptions::forced(lease());
        stale_holder.now = Utc::now() - Duration::hours(3);
        assert_eq!(
            store.try_acquire(&inbox(), stale_holder).unwrap(),
            Acquisition::Acquired
        );

        assert_eq!(
            store.try_acquire(&inbox(), AcquireOptions::forced(lease())).unwrap(),
            Acquisition::Acquired
        );
        assert_eq!(
            store.try_acquire(&inbox(), AcquireOptions::forced(lease())).unwrap(),
            Acquisition::Held
        );
    }

    #[test]
    fn test_taken_over_holder_cannot_release_or_delete() {
        let store = SqliteBookkeeping::in_memory().unwrap();
        store.insert_if_absent(&inbox()).unwrap();

        let mut stale_holder = AcquireOptions::forced(lease());
        stale_holder.now = Utc::now() - Duration::hours(3);
        store.try_acquire(&inbox(), stale_holder).unwrap();

        let successor = AcquireOptions::forced(lease());
        assert_eq!(
            store.try_acquire(&inbox(), successor).unwrap(),
            Acquisition::Acquired
        );

        assert!(!store.renew(&inbox(), stale_holder.owner, Utc::now()).unwrap());
        assert!(!store.release(&inbox(), stale_holder.owner, Some(Utc::now())).unwrap());
        assert!(!store.delete(&inbox(), stale_holder.owner).unwrap());

        let record = store.record(&inbox()).unwrap().unwrap();
        assert!(record.syncing, "successor still holds the folder");
        assert!(record.last_synced_at.is_none());
        assert_eq!(
            store.try_acquire(&inbox(), AcquireOptions::forced(lease())).unwrap(),
            Acquisition::Held
        );

        assert!(store.release(&inbox(), successor.owner, None).unwrap());
        assert!(!store.record(&inbox()).unwrap().unwrap().syncing);
    }

    #[test]
    fn test_renew_restarts_the_lease() {
        let store = SqliteBookkeeping::in_memory().unwrap();
        store.insert_if_absent(&inbox()).unwrap();

        let mut holder = AcquireOptions::forced(lease());
        holder.now = Utc::now() - Duration::minutes(50);
        store.try_acquire(&inbox(), holder).unwrap();

        let renewed_at = Utc::now();
        assert!(store.renew(&inbox(), holder.owner, renewed_at).unwrap());
        let record = store.record(&inbox()).unwrap().unwrap();
        assert_eq!(
            record.sync_started_at.map(|at| at.timestamp_millis()),
            Some(renewed_at.timestamp_millis())
        );

        // Twenty minutes on, the original lease would have run out
        let mut contender = AcquireOptions::forced(lease());
        contender.now = Utc::now() + Duration::minutes(20);
        assert_eq!(
            store.try_acquire(&inbox(), contender).unwrap(),
            Acquisition::Held
        );

        // Nothing to renew once released
        store.release(&inbox(), holder.owner, None).unwrap();
        assert!(!store.renew(&inbox(), holder.owner, Utc::now()).unwrap());
    }

    #[test]
    fn test_delete_spares_folder_held_by_another_owner() {
        let store = SqliteBookkeeping::in_memory().unwrap();
        store.insert_if_absent(&inbox()).unwrap();
        let holder = AcquireOptions::forced(lease());
        store.try_acquire(&inbox(), holder).unwrap();

        assert!(!store.delete(&inbox(), Uuid::new_v4()).unwrap());
        assert!(store.record(&inbox()).unwrap().is_some());

        assert!(store.delete(&inbox(), holder.owner).unwrap());
        assert!(store.record(&inbox()).unwrap().is_none());
    }

    #[test]
    fn test_acquire_missing_record_is_held() {
        let store = SqliteBookkeeping::in_memory().unwrap();
        assert_eq!(
            store.try_acquire(&inbox(), AcquireOptions::forced(lease())).unwrap(),
            Acquisition::Held
        );
    }

    #[test]
    fn test_list_stale_and_delete() {
        let store = SqliteBookkeeping::in_memory().unwrap();
        let mailbox = MailboxKey::new(1, 5, 0);
        for name in ["INBOX", "Sent", "Trash"] {
            store.insert_if_absent(&mailbox.folder(name)).unwrap();
        }
        // A different account must not show up
        store
            .insert_if_absent(&MailboxKey::new(1, 5, 1).folder("INBOX"))
            .unwrap();

        let sent = mailbox.folder("Sent");
        let options = AcquireOptions::forced(lease());
        store.try_acquire(&sent, options).unwrap();
        store.release(&sent, options.owner, Some(Utc::now())).unwrap();

        let stale = store
            .list_stale(&mailbox, Utc::now() - Duration::minutes(5))
            .unwrap();
        let names: Vec<_> = stale.iter().map(|r| r.key.folder.as_str()).collect();
        assert_eq!(names, vec!["INBOX", "Trash"]);

        assert!(store.delete(&mailbox.folder("Trash"), Uuid::new_v4()).unwrap());
        assert!(store.record(&mailbox.folder("Trash")).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_acquire_is_exclusive() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("bookkeeping.test.sqlite");
        let store = Arc::new(SqliteBookkeeping::open(&db_path).unwrap());
        store.insert_if_absent(&inbox()).unwrap();

        let acquired = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let acquired = Arc::clone(&acquired);
                std::thread::spawn(move || {
                    let outcome = store
                        .try_acquire(&inbox(), AcquireOptions::forced(lease()))
                        .unwrap();
                    if outcome == Acquisition::Acquired {
                        acquired.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_two_connections_share_exclusivity() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("bookkeeping.test.sqlite");
        let first = SqliteBookkeeping::open(&db_path).unwrap();
        let second = SqliteBookkeeping::open(&db_path).unwrap();

        first.insert_if_absent(&inbox()).unwrap();
        assert!(!second.insert_if_absent(&inbox()).unwrap());

        assert_eq!(
            first.try_acquire(&inbox(), AcquireOptions::forced(lease())).unwrap(),
            Acquisition::Acquired
        );
        assert_eq!(
            second.try_acquire(&inbox(), AcquireOptions::forced(lease())).unwrap(),
            Acquisition::Held
        );
    }
}
