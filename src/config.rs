use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::map::ClusterOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncSettings,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub map: MapConfig,
  #[serde(default)]
  pub search: SearchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Endpoint serving `?layer=...&start=...&limit=...`
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Attempts per request when the server keeps rate limiting
  #[serde(default = "default_rate_limit_attempts")]
  pub max_rate_limit_attempts: u32,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: String::new(),
      timeout_secs: default_timeout_secs(),
      max_rate_limit_attempts: default_rate_limit_attempts(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_rate_limit_attempts() -> u32 {
  3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
  /// Rows fetched directly when the store is empty
  pub initial_batch: usize,
  pub chunk_size: usize,
  pub panel_chunk_size: usize,
  pub partner_chunk_size: usize,
  /// How long the final progress snapshot stays visible
  pub progress_clear_delay_ms: u64,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      initial_batch: 1000,
      chunk_size: 5000,
      panel_chunk_size: 5000,
      partner_chunk_size: 5000,
      progress_clear_delay_ms: 1500,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Defaults to the platform data directory
  pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      dir: None,
    }
  }
}

impl CacheConfig {
  pub fn resolve_dir(&self) -> Result<PathBuf> {
    match &self.dir {
      Some(dir) => Ok(dir.clone()),
      None => dirs::data_dir()
        .map(|d| d.join("streetsync"))
        .ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }

  pub fn layer_db_path(&self) -> Result<PathBuf> {
    Ok(self.resolve_dir()?.join("layers.db"))
  }

  pub fn marker_db_path(&self) -> Result<PathBuf> {
    Ok(self.resolve_dir()?.join("markers.db"))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MapConfig {
  /// Markers derived per cooperative batch
  pub batch_size: usize,
  pub radius: f64,
  pub extent: f64,
  pub min_zoom: u8,
  pub max_zoom: u8,
  pub min_points: usize,
}

impl Default for MapConfig {
  fn default() -> Self {
    Self {
      batch_size: 1000,
      radius: 60.0,
      extent: 512.0,
      min_zoom: 0,
      max_zoom: 16,
      min_points: 2,
    }
  }
}

impl MapConfig {
  pub fn cluster_options(&self) -> ClusterOptions {
    ClusterOptions {
      min_zoom: self.min_zoom,
      max_zoom: self.max_zoom,
      radius: self.radius,
      extent: self.extent,
      min_points: self.min_points,
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
  pub debounce_ms: u64,
  pub max_results: usize,
}

impl Default for SearchConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 50,
      max_results: 50,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./streetsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/streetsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/streetsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("streetsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("streetsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.api.url.trim().is_empty() {
      return Err(eyre!("api.url must not be empty"));
    }
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("api:\n  url: https://example.com/api\n").unwrap();

    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.api.max_rate_limit_attempts, 3);
    assert_eq!(config.sync.initial_batch, 1000);
    assert_eq!(config.sync.chunk_size, 5000);
    assert!(config.cache.enabled);
    assert_eq!(config.map.cluster_options(), ClusterOptions::default());
    assert_eq!(config.search.debounce_ms, 50);
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let yaml = r#"
api:
  url: https://example.com/api
  max_rate_limit_attempts: 5
sync:
  chunk_size: 2000
cache:
  enabled: false
  dir: /tmp/streetsync
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.api.max_rate_limit_attempts, 5);
    assert_eq!(config.sync.chunk_size, 2000);
    assert_eq!(config.sync.panel_chunk_size, 5000);
    assert!(!config.cache.enabled);
    assert_eq!(
      config.cache.layer_db_path().unwrap(),
      PathBuf::from("/tmp/streetsync/layers.db")
    );
  }

  #[test]
  fn test_missing_url_is_rejected() {
    assert!(Config::from_yaml("api:\n  url: ''\n").is_err());
    assert!(Config::from_yaml("sync:\n  chunk_size: 10\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_errors() {
    let err = Config::load(Some(Path::new("/nonexistent/streetsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
