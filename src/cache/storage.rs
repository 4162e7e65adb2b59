//! Layer store trait and SQLite implementation.

use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{Layer, LayerRecord};

/// Age in hours after which a layer is considered stale.
pub const LAYER_STALE_HOURS: i64 = 24;

/// Trait for layer storage backends.
///
/// One partition per [`Layer`] plus a metadata partition with the last
/// completed sync time of each layer and the cursor of any refresh still in
/// progress. Writes are upserts by record key.
pub trait LayerStore: Send + Sync {
  /// Upsert records by key. Keyless records are skipped.
  /// Returns the number of records written.
  fn save_chunk<T: LayerRecord>(&self, records: &[T]) -> Result<usize>;

  /// All records of a layer, in first-insertion order.
  fn get_all<T: LayerRecord>(&self) -> Result<Vec<T>>;

  fn count(&self, layer: Layer) -> Result<usize>;

  /// Drop every record of a layer and its timestamp.
  fn clear_layer(&self, layer: Layer) -> Result<()>;

  fn get_timestamp(&self, layer: Layer) -> Result<Option<DateTime<Utc>>>;

  fn set_timestamp(&self, layer: Layer, at: DateTime<Utc>) -> Result<()>;

  /// Offset an interrupted refresh of an expired layer continues from.
  fn get_refresh_offset(&self, layer: Layer) -> Result<Option<usize>>;

  /// Advance the refresh cursor, or drop it with `None`.
  fn set_refresh_offset(&self, layer: Layer, offset: Option<usize>) -> Result<()>;

  /// Stale when never synced or last synced more than 24h before `now`.
  fn is_stale_at(&self, layer: Layer, now: DateTime<Utc>) -> Result<bool> {
    Ok(match self.get_timestamp(layer)? {
      Some(ts) => now - ts > Duration::hours(LAYER_STALE_HOURS),
      None => true,
    })
  }

  fn is_stale(&self, layer: Layer) -> Result<bool> {
    self.is_stale_at(layer, Utc::now())
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopLayerStore;

impl LayerStore for NoopLayerStore {
  fn save_chunk<T: LayerRecord>(&self, _records: &[T]) -> Result<usize> {
    Ok(0) // Discard
  }

  fn get_all<T: LayerRecord>(&self) -> Result<Vec<T>> {
    Ok(Vec::new()) // Always miss
  }

  fn count(&self, _layer: Layer) -> Result<usize> {
    Ok(0)
  }

  fn clear_layer(&self, _layer: Layer) -> Result<()> {
    Ok(())
  }

  fn get_timestamp(&self, _layer: Layer) -> Result<Option<DateTime<Utc>>> {
    Ok(None)
  }

  fn set_timestamp(&self, _layer: Layer, _at: DateTime<Utc>) -> Result<()> {
    Ok(())
  }

  fn get_refresh_offset(&self, _layer: Layer) -> Result<Option<usize>> {
    Ok(None)
  }

  fn set_refresh_offset(&self, _layer: Layer, _offset: Option<usize>) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based layer storage.
pub struct SqliteLayerStore {
  conn: Mutex<Connection>,
}

impl SqliteLayerStore {
  /// Open (or create) the layer database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open layer store at {}: {}", path.display(), e))?;

    Self::init(conn)
  }

  /// Volatile store, mainly for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory layer store: {}", e))?;
    Self::init(conn)
  }

  fn init(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(LAYER_SCHEMA)
      .map_err(|e| eyre!("Failed to run layer store migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for the layer partitions. Table names must match [`Layer::table`].
const LAYER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS main_layer (
    record_key TEXT PRIMARY KEY,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS panels_layer (
    record_key TEXT PRIMARY KEY,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS partner_layer (
    record_key TEXT PRIMARY KEY,
    data BLOB NOT NULL
);

-- Last completed sync per layer (epoch milliseconds)
CREATE TABLE IF NOT EXISTS layer_meta (
    layer TEXT PRIMARY KEY,
    synced_at INTEGER NOT NULL
);

-- Next offset of a refresh that has not completed yet
CREATE TABLE IF NOT EXISTS layer_refresh (
    layer TEXT PRIMARY KEY,
    next_offset INTEGER NOT NULL
);
"#;

impl LayerStore for SqliteLayerStore {
  fn save_chunk<T: LayerRecord>(&self, records: &[T]) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // ON CONFLICT keeps the rowid, so get_all stays in first-seen order.
    let sql = format!(
      "INSERT INTO {} (record_key, data) VALUES (?, ?)
       ON CONFLICT(record_key) DO UPDATE SET data = excluded.data",
      T::LAYER.table()
    );

    let mut written = 0;
    {
      let mut stmt = tx
        .prepare(&sql)
        .map_err(|e| eyre!("Failed to prepare upsert: {}", e))?;

      for record in records {
        let Some(key) = record.layer_key() else {
          continue;
        };
        let data =
          serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize record: {}", e))?;
        stmt
          .execute(params![key, data])
          .map_err(|e| eyre!("Failed to store record {}: {}", key, e))?;
        written += 1;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(written)
  }

  fn get_all<T: LayerRecord>(&self) -> Result<Vec<T>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT data FROM {} ORDER BY rowid",
        T::LAYER.table()
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let records: Vec<T> = stmt
      .query_map([], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| eyre!("Failed to query {}: {}", T::LAYER, e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| serde_json::from_slice(&data).ok())
      .collect();

    Ok(records)
  }

  fn count(&self, layer: Layer) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(&format!("SELECT COUNT(*) FROM {}", layer.table()), [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count {}: {}", layer, e))?;

    Ok(count.max(0) as usize)
  }

  fn clear_layer(&self, layer: Layer) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(&format!("DELETE FROM {}", layer.table()), [])
      .map_err(|e| eyre!("Failed to clear {}: {}", layer, e))?;
    tx.execute(
      "DELETE FROM layer_meta WHERE layer = ?",
      params![layer.as_str()],
    )
    .map_err(|e| eyre!("Failed to clear {} timestamp: {}", layer, e))?;
    tx.execute(
      "DELETE FROM layer_refresh WHERE layer = ?",
      params![layer.as_str()],
    )
    .map_err(|e| eyre!("Failed to clear {} refresh cursor: {}", layer, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get_timestamp(&self, layer: Layer) -> Result<Option<DateTime<Utc>>> {
    let conn = self.lock()?;

    let millis: Option<i64> = conn
      .query_row(
        "SELECT synced_at FROM layer_meta WHERE layer = ?",
        params![layer.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} timestamp: {}", layer, e))?;

    Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
  }

  fn set_timestamp(&self, layer: Layer, at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO layer_meta (layer, synced_at) VALUES (?, ?)",
        params![layer.as_str(), at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to store {} timestamp: {}", layer, e))?;

    Ok(())
  }

  fn get_refresh_offset(&self, layer: Layer) -> Result<Option<usize>> {
    let conn = self.lock()?;

    let offset: Option<i64> = conn
      .query_row(
        "SELECT next_offset FROM layer_refresh WHERE layer = ?",
        params![layer.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} refresh cursor: {}", layer, e))?;

    Ok(offset.map(|o| o.max(0) as usize))
  }

  fn set_refresh_offset(&self, layer: Layer, offset: Option<usize>) -> Result<()> {
    let conn = self.lock()?;

    let result = match offset {
      Some(offset) => conn.execute(
        "INSERT OR REPLACE INTO layer_refresh (layer, next_offset) VALUES (?, ?)",
        params![layer.as_str(), offset as i64],
      ),
      None => conn.execute(
        "DELETE FROM layer_refresh WHERE layer = ?",
        params![layer.as_str()],
      ),
    };
    result.map_err(|e| eyre!("Failed to store {} refresh cursor: {}", layer, e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::layers::{EquipmentRecord, PanelRecord};

  fn equipment(id: Option<&str>, address: &str) -> EquipmentRecord {
    EquipmentRecord {
      electro_id: id.map(String::from),
      address: Some(address.to_string()),
      ..Default::default()
    }
  }

  #[test]
  fn test_save_chunk_upserts_by_key() {
    let store = SqliteLayerStore::open_in_memory().unwrap();

    let written = store
      .save_chunk(&[equipment(Some("E1"), "old"), equipment(Some("E2"), "b")])
      .unwrap();
    assert_eq!(written, 2);

    store
      .save_chunk(&[equipment(Some("E1"), "new"), equipment(Some("E3"), "c")])
      .unwrap();

    let all: Vec<EquipmentRecord> = store.get_all().unwrap();
    let ids: Vec<_> = all.iter().filter_map(|r| r.electro_id.as_deref()).collect();
    assert_eq!(ids, vec!["E1", "E2", "E3"]);
    assert_eq!(all[0].address.as_deref(), Some("new"));
    assert_eq!(store.count(Layer::Main).unwrap(), 3);
  }

  #[test]
  fn test_save_chunk_is_idempotent() {
    let store = SqliteLayerStore::open_in_memory().unwrap();
    let chunk = vec![equipment(Some("E1"), "a"), equipment(Some("E2"), "b")];

    store.save_chunk(&chunk).unwrap();
    store.save_chunk(&chunk).unwrap();

    assert_eq!(store.count(Layer::Main).unwrap(), 2);
  }

  #[test]
  fn test_keyless_records_are_not_persisted() {
    let store = SqliteLayerStore::open_in_memory().unwrap();

    let written = store
      .save_chunk(&[equipment(None, "orphan"), equipment(Some("E1"), "a")])
      .unwrap();

    assert_eq!(written, 1);
    assert_eq!(store.count(Layer::Main).unwrap(), 1);
  }

  #[test]
  fn test_layers_are_independent_partitions() {
    let store = SqliteLayerStore::open_in_memory().unwrap();
    store.save_chunk(&[equipment(Some("E1"), "a")]).unwrap();
    store
      .save_chunk(&[PanelRecord {
        electro_id: Some("E1".into()),
        ..Default::default()
      }])
      .unwrap();
    store.set_timestamp(Layer::Main, Utc::now()).unwrap();

    store.clear_layer(Layer::Main).unwrap();

    assert_eq!(store.count(Layer::Main).unwrap(), 0);
    assert_eq!(store.get_timestamp(Layer::Main).unwrap(), None);
    assert_eq!(store.count(Layer::Panels).unwrap(), 1);
  }

  #[test]
  fn test_staleness_window() {
    let store = SqliteLayerStore::open_in_memory().unwrap();
    let now = Utc::now();

    assert!(store.is_stale_at(Layer::Panels, now).unwrap());

    store
      .set_timestamp(Layer::Panels, now - Duration::hours(25))
      .unwrap();
    assert!(store.is_stale_at(Layer::Panels, now).unwrap());

    store
      .set_timestamp(Layer::Panels, now - Duration::hours(1))
      .unwrap();
    assert!(!store.is_stale_at(Layer::Panels, now).unwrap());
    assert!(!store.is_stale(Layer::Panels).unwrap());
  }

  #[test]
  fn test_timestamp_round_trips_at_millisecond_precision() {
    let store = SqliteLayerStore::open_in_memory().unwrap();
    let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

    store.set_timestamp(Layer::Partner, at).unwrap();

    assert_eq!(store.get_timestamp(Layer::Partner).unwrap(), Some(at));
  }

  #[test]
  fn test_refresh_cursor_is_per_layer_and_cleared_with_layer() {
    let store = SqliteLayerStore::open_in_memory().unwrap();
    assert_eq!(store.get_refresh_offset(Layer::Main).unwrap(), None);

    store.set_refresh_offset(Layer::Main, Some(4000)).unwrap();
    store.set_refresh_offset(Layer::Main, Some(6000)).unwrap();
    store.set_refresh_offset(Layer::Panels, Some(100)).unwrap();
    assert_eq!(store.get_refresh_offset(Layer::Main).unwrap(), Some(6000));

    store.set_refresh_offset(Layer::Main, None).unwrap();
    assert_eq!(store.get_refresh_offset(Layer::Main).unwrap(), None);

    store.clear_layer(Layer::Panels).unwrap();
    assert_eq!(store.get_refresh_offset(Layer::Panels).unwrap(), None);
  }

  #[test]
  fn test_noop_store_always_misses() {
    let store = NoopLayerStore;
    assert_eq!(store.save_chunk(&[equipment(Some("E1"), "a")]).unwrap(), 0);
    assert!(store.get_all::<EquipmentRecord>().unwrap().is_empty());
    assert!(store.is_stale(Layer::Main).unwrap());
  }
}
