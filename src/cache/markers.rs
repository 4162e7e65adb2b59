//! Marker cache: the derived map marker set and map view metadata.
//!
//! Kept in its own database so it can be dropped without touching the
//! layer store. The marker set is valid only for the dataset fingerprint
//! it was saved with, and for at most 24 hours.

use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::map::{Marker, MarkerFilters};

const MARKER_STALE_HOURS: i64 = 24;

const META_HASH: &str = "markers_hash";
const META_SAVED_AT: &str = "markers_saved_at";
const META_VIEW: &str = "view_state";
const META_FILTERS: &str = "filters";

/// Last map viewport, restored on the next start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapViewState {
  pub center_lat: f64,
  pub center_lng: f64,
  pub zoom: f64,
}

pub struct MarkerCache {
  conn: Mutex<Connection>,
}

/// Schema for the marker database.
const MARKER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS map_markers (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL
);

-- View state, filters and the marker-set fingerprint
CREATE TABLE IF NOT EXISTS map_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl MarkerCache {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open marker cache at {}: {}", path.display(), e))?;

    Self::init(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory marker cache: {}", e))?;
    Self::init(conn)
  }

  fn init(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(MARKER_SCHEMA)
      .map_err(|e| eyre!("Failed to run marker cache migrations: {}", e))?;

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

  fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn
      .query_row(
        "SELECT value FROM map_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read map meta {}: {}", key, e))
  }

  fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn
      .execute(
        "INSERT OR REPLACE INTO map_meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store map meta {}: {}", key, e))?;
    Ok(())
  }

  /// Fingerprint the stored marker set was saved with.
  pub fn stored_hash(&self) -> Result<Option<String>> {
    let conn = self.lock()?;
    Self::get_meta(&conn, META_HASH)
  }

  fn saved_at(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    Ok(
      Self::get_meta(conn, META_SAVED_AT)?
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    )
  }

  fn is_fresh(conn: &Connection, now: DateTime<Utc>) -> Result<bool> {
    Ok(
      Self::saved_at(conn)?
        .is_some_and(|at| now - at <= Duration::hours(MARKER_STALE_HOURS)),
    )
  }

  /// True when the stored set matches `hash` and is less than 24h old.
  pub fn is_valid_at(&self, hash: &str, now: DateTime<Utc>) -> Result<bool> {
    let conn = self.lock()?;
    let matches = Self::get_meta(&conn, META_HASH)?.as_deref() == Some(hash);
    Ok(matches && Self::is_fresh(&conn, now)?)
  }

  pub fn is_valid(&self, hash: &str) -> Result<bool> {
    self.is_valid_at(hash, Utc::now())
  }

  /// Replace the whole marker set in one transaction.
  pub fn save_markers(&self, markers: &[Marker], hash: &str) -> Result<()> {
    self.save_markers_at(markers, hash, Utc::now())
  }

  pub fn save_markers_at(&self, markers: &[Marker], hash: &str, now: DateTime<Utc>) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM map_markers", [])
      .map_err(|e| eyre!("Failed to clear markers: {}", e))?;

    {
      let mut stmt = tx
        .prepare("INSERT OR REPLACE INTO map_markers (id, data) VALUES (?, ?)")
        .map_err(|e| eyre!("Failed to prepare marker insert: {}", e))?;
      for marker in markers {
        let data =
          serde_json::to_vec(marker).map_err(|e| eyre!("Failed to serialize marker: {}", e))?;
        stmt
          .execute(params![marker.id, data])
          .map_err(|e| eyre!("Failed to store marker {}: {}", marker.id, e))?;
      }
    }

    Self::set_meta(&tx, META_HASH, hash)?;
    Self::set_meta(&tx, META_SAVED_AT, &now.timestamp_millis().to_string())?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  /// Stored markers, or None on a miss or when the set is older than 24h.
  pub fn load_markers(&self) -> Result<Option<Vec<Marker>>> {
    self.load_markers_at(Utc::now())
  }

  pub fn load_markers_at(&self, now: DateTime<Utc>) -> Result<Option<Vec<Marker>>> {
    let conn = self.lock()?;
    if Self::get_meta(&conn, META_HASH)?.is_none() || !Self::is_fresh(&conn, now)? {
      return Ok(None);
    }

    let mut stmt = conn
      .prepare("SELECT data FROM map_markers ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare marker query: {}", e))?;

    let markers: Vec<Marker> = stmt
      .query_map([], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| eyre!("Failed to query markers: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| serde_json::from_slice(&data).ok())
      .collect();

    Ok(Some(markers))
  }

  pub fn save_view_state(&self, view: &MapViewState) -> Result<()> {
    let json = serde_json::to_string(view).map_err(|e| eyre!("Failed to serialize view: {}", e))?;
    let conn = self.lock()?;
    Self::set_meta(&conn, META_VIEW, &json)
  }

  pub fn load_view_state(&self) -> Result<Option<MapViewState>> {
    let conn = self.lock()?;
    Ok(
      Self::get_meta(&conn, META_VIEW)?
        .and_then(|json| serde_json::from_str(&json).ok()),
    )
  }

  pub fn save_filters(&self, filters: &MarkerFilters) -> Result<()> {
    let json =
      serde_json::to_string(filters).map_err(|e| eyre!("Failed to serialize filters: {}", e))?;
    let conn = self.lock()?;
    Self::set_meta(&conn, META_FILTERS, &json)
  }

  pub fn load_filters(&self) -> Result<Option<MarkerFilters>> {
    let conn = self.lock()?;
    Ok(
      Self::get_meta(&conn, META_FILTERS)?
        .and_then(|json| serde_json::from_str(&json).ok()),
    )
  }

  /// Drop markers and all map metadata.
  pub fn clear(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch("DELETE FROM map_markers; DELETE FROM map_meta;")
      .map_err(|e| eyre!("Failed to clear marker cache: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn marker(id: &str) -> Marker {
    Marker {
      id: id.to_string(),
      lat: -23.5,
      lng: -46.6,
      stop_id: None,
      address: Some("Av. Paulista".into()),
      neighborhood: None,
      area: None,
      status: None,
      model: None,
      partner_client: None,
      has_digital: true,
      has_static: false,
      has_abrigo_amigo: false,
    }
  }

  #[test]
  fn test_empty_cache_misses() {
    let cache = MarkerCache::open_in_memory().unwrap();
    assert_eq!(cache.load_markers().unwrap(), None);
    assert!(!cache.is_valid("anything").unwrap());
  }

  #[test]
  fn test_save_replaces_previous_generation() {
    let cache = MarkerCache::open_in_memory().unwrap();

    cache
      .save_markers(&[marker("E1"), marker("E2")], "gen1")
      .unwrap();
    cache.save_markers(&[marker("E3")], "gen2").unwrap();

    let loaded = cache.load_markers().unwrap().unwrap();
    assert_eq!(loaded, vec![marker("E3")]);
    assert!(cache.is_valid("gen2").unwrap());
    assert!(!cache.is_valid("gen1").unwrap());
    assert_eq!(cache.stored_hash().unwrap().as_deref(), Some("gen2"));
  }

  #[test]
  fn test_markers_expire_after_a_day() {
    let cache = MarkerCache::open_in_memory().unwrap();
    let now = Utc::now();

    cache
      .save_markers_at(&[marker("E1")], "h", now - Duration::hours(25))
      .unwrap();

    assert!(!cache.is_valid_at("h", now).unwrap());
    assert_eq!(cache.load_markers_at(now).unwrap(), None);
    assert!(cache
      .is_valid_at("h", now - Duration::hours(2))
      .unwrap());
  }

  #[test]
  fn test_view_state_and_filters_persist() {
    let cache = MarkerCache::open_in_memory().unwrap();
    let view = MapViewState {
      center_lat: -23.55,
      center_lng: -46.63,
      zoom: 12.0,
    };
    let filters = MarkerFilters {
      has_abrigo_amigo: Some(true),
      ..Default::default()
    };

    cache.save_view_state(&view).unwrap();
    cache.save_filters(&filters).unwrap();

    assert_eq!(cache.load_view_state().unwrap(), Some(view));
    assert_eq!(cache.load_filters().unwrap(), Some(filters));

    cache.clear().unwrap();
    assert_eq!(cache.load_view_state().unwrap(), None);
  }
}
