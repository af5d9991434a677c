//! Cache storage trait and SQLite implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::traits::{Cacheable, CachedEntity, ConsistencyReport};
use crate::sync::{OperationType, SyncOperation};

/// Default lifetime of a cache entry.
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Trait for cache storage backends.
///
/// Every method is fallible; callers treat failures as a cache miss or a
/// skipped write, never as a failed user operation.
pub trait CacheStorage: Send + Sync + 'static {
  /// All unexpired entities of a type, in the order they were stored.
  fn get_all<T: Cacheable>(&self) -> Result<Vec<CachedEntity<T>>>;

  /// A single unexpired entity by id.
  fn get_by_id<T: Cacheable>(&self, id: &str) -> Result<Option<CachedEntity<T>>>;

  /// Upsert a batch of entities, refreshing their expiry.
  fn set_all<T: Cacheable>(&self, entities: &[T]) -> Result<()>;

  /// Upsert a single entity.
  fn set<T: Cacheable>(&self, entity: &T) -> Result<()>;

  /// Remove an entity. Returns true iff an entry was removed.
  fn delete<T: Cacheable>(&self, id: &str) -> Result<bool>;

  /// Remove every entity of a type.
  fn clear<T: Cacheable>(&self) -> Result<()>;

  /// Physically remove expired entries of every type.
  fn clean_expired(&self) -> Result<usize>;

  /// Delete every cached entity whose id is absent from `authoritative`.
  fn validate_consistency<T: Cacheable>(
    &self,
    authoritative: &HashSet<String>,
  ) -> Result<ConsistencyReport>;

  /// Queue a write intent, replacing any queued intent with the same key.
  fn enqueue_operation(&self, operation: &SyncOperation) -> Result<()>;

  /// Queued intents, oldest first.
  fn pending_operations(&self) -> Result<Vec<SyncOperation>>;

  /// Record a failed delivery attempt. Returns the new retry count.
  fn record_operation_failure(
    &self,
    op_type: OperationType,
    resource_id: &str,
    error: &str,
  ) -> Result<u32>;

  /// Drop a queued intent. Returns true iff it existed.
  fn remove_operation(&self, op_type: OperationType, resource_id: &str) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  ttl: Duration,
}

impl SqliteStorage {
  /// Open the cache at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory cache. Nothing survives the handle.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      ttl: Duration::hours(DEFAULT_TTL_HOURS),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Set how long entries stay readable after they are written.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("marketsync").join("cache.db"))
  }

  /// Close the underlying connection, surfacing any error SQLite reports.
  pub fn close(self) -> Result<()> {
    let conn = self
      .conn
      .into_inner()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .close()
      .map_err(|(_, e)| eyre!("Failed to close cache database: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    now + self.ttl
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Entity cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    fetched_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_entity_cache_expires
    ON entity_cache(expires_at);

-- Write intents waiting for delivery, one per (op_type, resource_id)
CREATE TABLE IF NOT EXISTS sync_queue (
    op_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    queued_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    PRIMARY KEY (op_type, resource_id)
);
"#;

const UPSERT_ENTITY: &str = "INSERT INTO entity_cache (entity_type, entity_key, data, position, fetched_at, expires_at)
   VALUES (?1, ?2, ?3, ?4, ?5, ?6)
   ON CONFLICT (entity_type, entity_key) DO UPDATE SET
     data = excluded.data,
     position = excluded.position,
     fetched_at = excluded.fetched_at,
     expires_at = excluded.expires_at";

impl CacheStorage for SqliteStorage {
  fn get_all<T: Cacheable>(&self) -> Result<Vec<CachedEntity<T>>> {
    let conn = self.lock()?;
    let now = Utc::now().timestamp_millis();

    let mut stmt = conn
      .prepare(
        "SELECT entity_key, data, fetched_at, expires_at FROM entity_cache
         WHERE entity_type = ? AND expires_at > ?
         ORDER BY position, entity_key",
      )
      .map_err(|e| eyre!("Failed to prepare entity query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, i64, i64)> = stmt
      .query_map(params![T::entity_type(), now], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query entities: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read entity row: {}", e))?;

    let mut entities = Vec::with_capacity(rows.len());
    for (key, data, fetched_at, expires_at) in rows {
      match serde_json::from_slice::<T>(&data) {
        Ok(entity) => entities.push(CachedEntity {
          entity,
          fetched_at: from_millis(fetched_at)?,
          expires_at: from_millis(expires_at)?,
        }),
        // A row we cannot read is as good as absent; the next sync rewrites it.
        Err(e) => warn!(key = %key, error = %e, "Skipping undecodable cache entry"),
      }
    }

    Ok(entities)
  }

  fn get_by_id<T: Cacheable>(&self, id: &str) -> Result<Option<CachedEntity<T>>> {
    let conn = self.lock()?;
    let now = Utc::now().timestamp_millis();

    let row: Option<(Vec<u8>, i64, i64)> = conn
      .query_row(
        "SELECT data, fetched_at, expires_at FROM entity_cache
         WHERE entity_type = ? AND entity_key = ? AND expires_at > ?",
        params![T::entity_type(), id, now],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entity {}: {}", id, e))?;

    match row {
      Some((data, fetched_at, expires_at)) => {
        let entity: T = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize entity {}: {}", id, e))?;
        Ok(Some(CachedEntity {
          entity,
          fetched_at: from_millis(fetched_at)?,
          expires_at: from_millis(expires_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn set_all<T: Cacheable>(&self, entities: &[T]) -> Result<()> {
    let mut conn = self.lock()?;
    let now = Utc::now();
    let expires_at = self.expiry_from(now).timestamp_millis();
    let now = now.timestamp_millis();

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (position, entity) in entities.iter().enumerate() {
      let data =
        serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

      tx.execute(
        UPSERT_ENTITY,
        params![
          T::entity_type(),
          entity.cache_key(),
          data,
          position as i64,
          now,
          expires_at
        ],
      )
      .map_err(|e| eyre!("Failed to store entity: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn set<T: Cacheable>(&self, entity: &T) -> Result<()> {
    let conn = self.lock()?;
    let now = Utc::now();
    let expires_at = self.expiry_from(now).timestamp_millis();
    let key = entity.cache_key();
    let data =
      serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

    // Keep an existing entry's place in the list; new entries go last.
    let position: i64 = conn
      .query_row(
        "SELECT COALESCE(
           (SELECT position FROM entity_cache WHERE entity_type = ?1 AND entity_key = ?2),
           (SELECT COALESCE(MAX(position) + 1, 0) FROM entity_cache WHERE entity_type = ?1))",
        params![T::entity_type(), key],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to resolve cache position: {}", e))?;

    conn
      .execute(
        UPSERT_ENTITY,
        params![
          T::entity_type(),
          key,
          data,
          position,
          now.timestamp_millis(),
          expires_at
        ],
      )
      .map_err(|e| eyre!("Failed to store entity: {}", e))?;

    Ok(())
  }

  fn delete<T: Cacheable>(&self, id: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
        params![T::entity_type(), id],
      )
      .map_err(|e| eyre!("Failed to delete entity {}: {}", id, e))?;

    Ok(removed > 0)
  }

  fn clear<T: Cacheable>(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM entity_cache WHERE entity_type = ?",
        params![T::entity_type()],
      )
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }

  fn clean_expired(&self) -> Result<usize> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM entity_cache WHERE expires_at <= ?",
        params![Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to remove expired entries: {}", e))
  }

  fn validate_consistency<T: Cacheable>(
    &self,
    authoritative: &HashSet<String>,
  ) -> Result<ConsistencyReport> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let cached_keys: Vec<String> = {
      let mut stmt = tx
        .prepare("SELECT entity_key FROM entity_cache WHERE entity_type = ? ORDER BY position, entity_key")
        .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;
      let keys = stmt
        .query_map(params![T::entity_type()], |row| row.get(0))
        .map_err(|e| eyre!("Failed to query cached keys: {}", e))?
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| eyre!("Failed to read cached key: {}", e))?;
      keys
    };

    let mut report = ConsistencyReport::default();
    for key in cached_keys {
      if authoritative.contains(&key) {
        continue;
      }
      report.removed += tx
        .execute(
          "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
          params![T::entity_type(), key],
        )
        .map_err(|e| eyre!("Failed to delete stale entity {}: {}", key, e))?;
      report.inconsistencies.push(key);
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(report)
  }

  fn enqueue_operation(&self, operation: &SyncOperation) -> Result<()> {
    let conn = self.lock()?;
    let payload = serde_json::to_string(&operation.payload)
      .map_err(|e| eyre!("Failed to serialize operation payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_queue (op_type, resource_id, payload, queued_at, retry_count, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (op_type, resource_id) DO UPDATE SET
           payload = excluded.payload,
           queued_at = excluded.queued_at,
           retry_count = excluded.retry_count,
           last_error = excluded.last_error",
        params![
          operation.op_type.as_str(),
          operation.resource_id,
          payload,
          operation.timestamp.timestamp_millis(),
          operation.retry_count,
          operation.last_error
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue operation: {}", e))?;

    Ok(())
  }

  fn pending_operations(&self) -> Result<Vec<SyncOperation>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT op_type, resource_id, payload, queued_at, retry_count, last_error
         FROM sync_queue ORDER BY queued_at, resource_id",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(String, String, String, i64, u32, Option<String>)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    let mut operations = Vec::with_capacity(rows.len());
    for (op_type, resource_id, payload, queued_at, retry_count, last_error) in rows {
      let Some(op_type) = OperationType::parse(&op_type) else {
        warn!(op_type = %op_type, resource_id = %resource_id, "Skipping queued operation of unknown type");
        continue;
      };
      let payload = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Failed to deserialize payload for {}: {}", resource_id, e))?;
      operations.push(SyncOperation {
        op_type,
        resource_id,
        payload,
        timestamp: from_millis(queued_at)?,
        retry_count,
        last_error,
      });
    }

    Ok(operations)
  }

  fn record_operation_failure(
    &self,
    op_type: OperationType,
    resource_id: &str,
    error: &str,
  ) -> Result<u32> {
    let conn = self.lock()?;

    conn
      .query_row(
        "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ?3
         WHERE op_type = ?1 AND resource_id = ?2
         RETURNING retry_count",
        params![op_type.as_str(), resource_id, error],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to record failure for {}: {}", resource_id, e))
  }

  fn remove_operation(&self, op_type: OperationType, resource_id: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM sync_queue WHERE op_type = ? AND resource_id = ?",
        params![op_type.as_str(), resource_id],
      )
      .map_err(|e| eyre!("Failed to remove operation for {}: {}", resource_id, e))?;

    Ok(removed > 0)
  }
}

/// Convert stored epoch milliseconds back to a timestamp.
fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(millis)
    .single()
    .ok_or_else(|| eyre!("Invalid stored timestamp: {}", millis))
}
