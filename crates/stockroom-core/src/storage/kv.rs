//! Quota-bounded key/value store on SQLite
//!
//! Mirrors the capacity behavior of browser-style client storage: the sum
//! of stored value sizes may not exceed a fixed byte quota, and a write
//! that would cross it fails with [`StorageError::QuotaExceeded`] without
//! touching the previous value.
//!
//! Every write replaces the whole value for its key.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};

/// Suffix of the key an unreadable value is copied to before a reset
pub const CORRUPT_SUFFIX: &str = ".corrupt";

/// Durable key/value store
pub struct KvStore {
    conn: Mutex<Connection>,
    quota_bytes: u64,
    /// Last `updated_at` handed out; stamps strictly increase
    last_stamp: AtomicI64,
}

impl KvStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path, quota_bytes: u64) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn, quota_bytes)
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory(quota_bytes: u64) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, quota_bytes)
    }

    fn with_connection(conn: Connection, quota_bytes: u64) -> StorageResult<Self> {
        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes,
            last_stamp: AtomicI64::new(0),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// Bytes currently used by stored values
    pub fn used_bytes(&self) -> StorageResult<u64> {
        let conn = self.conn();
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(length(CAST(value AS BLOB))), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        Ok(used.max(0) as u64)
    }

    /// Read the raw JSON text stored under `key`
    pub fn get_raw(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Read and decode the value stored under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let Some(raw) = self.get_raw(key)? else {
            return Ok(None);
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::CorruptValue {
                key: key.to_string(),
                details: e.to_string(),
            })
    }

    /// Encode and store `value` under `key`, replacing any previous value
    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let json = serde_json::to_string(value)?;
        self.put_raw(key, &json)
    }

    /// Store raw JSON text under `key`, enforcing the quota
    pub fn put_raw(&self, key: &str, value: &str) -> StorageResult<()> {
        self.write(key, value, None).map(|_| ())
    }

    /// Encode and store `value`, evicting the oldest `evictable_prefix` keys
    /// until it fits
    ///
    /// Returns the evicted keys. If dropping every evictable key would still
    /// not make room, nothing is evicted and `QuotaExceeded` is returned.
    pub fn put_reclaiming<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        evictable_prefix: &str,
    ) -> StorageResult<Vec<String>> {
        let json = serde_json::to_string(value)?;
        self.write(key, &json, Some(evictable_prefix))
    }

    fn write(
        &self,
        key: &str,
        value: &str,
        evictable_prefix: Option<&str>,
    ) -> StorageResult<Vec<String>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let used_by_others: i64 = tx.query_row(
            "SELECT COALESCE(SUM(length(CAST(value AS BLOB))), 0) FROM kv WHERE key != ?1",
            [key],
            |row| row.get(0),
        )?;
        let used_by_others = used_by_others.max(0) as u64;
        let needed = value.len() as u64;
        let quota_exceeded = || StorageError::QuotaExceeded {
            key: key.to_string(),
            needed,
            available: self.quota_bytes.saturating_sub(used_by_others),
        };

        let mut evicted = Vec::new();
        if used_by_others.saturating_add(needed) > self.quota_bytes {
            let Some(prefix) = evictable_prefix else {
                return Err(quota_exceeded());
            };

            let candidates = {
                let mut stmt = tx.prepare(
                    "SELECT key, length(CAST(value AS BLOB)) FROM kv
                     WHERE substr(key, 1, length(?1)) = ?1 AND key != ?2
                     ORDER BY updated_at ASC, key ASC",
                )?;
                let rows = stmt
                    .query_map(params![prefix, key], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut used = used_by_others;
            for (candidate, size) in candidates {
                if used.saturating_add(needed) <= self.quota_bytes {
                    break;
                }
                used = used.saturating_sub(size.max(0) as u64);
                evicted.push(candidate);
            }
            if used.saturating_add(needed) > self.quota_bytes {
                return Err(quota_exceeded());
            }

            for candidate in &evicted {
                tx.execute("DELETE FROM kv WHERE key = ?1", [candidate])?;
            }
        }

        tx.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, self.next_stamp()],
        )?;
        tx.commit()?;

        if !evicted.is_empty() {
            warn!(key, evicted = evicted.len(), "Evicted older entries to make room");
        }
        debug!(key, bytes = needed, "Stored value");
        Ok(evicted)
    }

    /// Microsecond write time, bumped past the previous stamp so write
    /// order survives clock ties. Called with the connection lock held.
    fn next_stamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_micros();
        let stamp = now.max(self.last_stamp.load(Ordering::Relaxed) + 1);
        self.last_stamp.store(stamp, Ordering::Relaxed);
        stamp
    }

    /// Copy the raw value under `key` to `<key>.corrupt` before it is reset
    ///
    /// Best effort: a backup that does not fit the quota is only logged.
    pub fn back_up_raw(&self, key: &str) {
        let backup_key = format!("{}{}", key, CORRUPT_SUFFIX);
        let result = self
            .get_raw(key)
            .and_then(|raw| match raw {
                Some(raw) => {
                    warn!(key, value = %raw, "Backing up unreadable value");
                    self.put_raw(&backup_key, &raw)
                }
                None => Ok(()),
            });
        if let Err(e) = result {
            warn!(key, "Unreadable value not backed up: {}", e);
        }
    }

    /// Remove `key`; returns whether it existed
    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(removed > 0)
    }

    /// Keys starting with `prefix`, most recently written first
    pub fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY updated_at DESC, key ASC",
        )?;
        let keys = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
