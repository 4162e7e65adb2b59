//! Phased fetch-and-persist driver for the three layers.
//!
//! One cycle runs `initializing → loading → syncing_main → syncing_panels →
//! syncing_partner → preparing_map → complete`, skipping phases that have
//! nothing to do. Every chunk is persisted before the next one is requested,
//! and a layer's timestamp is only written once the whole layer has been
//! fetched, so an aborted cycle resumes from the persisted row count. A
//! refresh of an expired layer records a cursor after every chunk and
//! resumes from it instead.
//!
//! The live dataset, the marker set and progress snapshots are published on
//! `watch` channels; callers subscribe, they never drive the machine.

use chrono::Utc;
use color_eyre::{eyre::WrapErr, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, LayerSource, Page};
use crate::cache::{Layer, LayerRecord, LayerStore, MarkerCache};
use crate::config::Config;
use crate::layers::{
  batch_attach, EquipmentRecord, PanelMap, PanelRecord, PartnerMap, PartnerRecord, UnifiedEntity,
};
use crate::map::{dataset_fingerprint, prepare_markers, Marker};

use super::progress::{SyncPhase, SyncProgress};

#[derive(Debug, Clone)]
pub struct SyncConfig {
  /// Rows fetched in `loading` when the store is empty
  pub initial_batch: usize,
  pub main_chunk_size: usize,
  pub panel_chunk_size: usize,
  pub partner_chunk_size: usize,
  /// Markers derived between cooperative yields
  pub marker_batch_size: usize,
  /// Attempts per request while the server keeps rate limiting
  pub max_rate_limit_attempts: u32,
  pub progress_clear_delay: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      initial_batch: 1000,
      main_chunk_size: 5000,
      panel_chunk_size: 5000,
      partner_chunk_size: 5000,
      marker_batch_size: 1000,
      max_rate_limit_attempts: 3,
      progress_clear_delay: Duration::from_millis(1500),
    }
  }
}

impl SyncConfig {
  pub fn from_config(config: &Config) -> Self {
    Self {
      initial_batch: config.sync.initial_batch,
      main_chunk_size: config.sync.chunk_size,
      panel_chunk_size: config.sync.panel_chunk_size,
      partner_chunk_size: config.sync.partner_chunk_size,
      marker_batch_size: config.map.batch_size,
      max_rate_limit_attempts: config.api.max_rate_limit_attempts,
      progress_clear_delay: Duration::from_millis(config.sync.progress_clear_delay_ms),
    }
  }

  fn chunk_size(&self, layer: Layer) -> usize {
    let size = match layer {
      Layer::Main => self.main_chunk_size,
      Layer::Panels => self.panel_chunk_size,
      Layer::Partner => self.partner_chunk_size,
    };
    size.max(1)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerReport {
  pub layer: Layer,
  /// Fresh and complete; nothing was fetched
  pub skipped: bool,
  pub start_offset: usize,
  pub fetched: usize,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
  /// Phases entered, in order
  pub phases: Vec<SyncPhase>,
  /// Rows fetched during `loading`
  pub initial_rows: usize,
  pub layers: Vec<LayerReport>,
  pub entities: usize,
  pub markers: usize,
  pub markers_rebuilt: bool,
}

impl SyncReport {
  pub fn layer(&self, layer: Layer) -> Option<&LayerReport> {
    self.layers.iter().find(|r| r.layer == layer)
  }
}

// ============================================================================
// In-memory layers
// ============================================================================

/// In-memory copy of one layer, upserted by key. Keyless rows are upserted
/// by their server position instead, so refetching a page replaces them and
/// identical orphans at different positions are all kept.
#[derive(Debug)]
struct LiveLayer<T> {
  rows: Vec<T>,
  index: HashMap<String, usize>,
  orphans: HashMap<usize, usize>,
}

impl<T> Default for LiveLayer<T> {
  fn default() -> Self {
    Self {
      rows: Vec::new(),
      index: HashMap::new(),
      orphans: HashMap::new(),
    }
  }
}

impl<T: LayerRecord> LiveLayer<T> {
  /// Merge rows fetched starting at server position `offset`.
  fn upsert(&mut self, offset: usize, rows: impl IntoIterator<Item = T>) {
    for (i, row) in rows.into_iter().enumerate() {
      let slot = match row.layer_key().map(str::to_owned) {
        Some(key) => *self.index.entry(key).or_insert(self.rows.len()),
        None => *self.orphans.entry(offset + i).or_insert(self.rows.len()),
      };
      if slot == self.rows.len() {
        self.rows.push(row);
      } else {
        self.rows[slot] = row;
      }
    }
  }

  fn keyed_len(&self) -> usize {
    self.index.len()
  }
}

#[derive(Debug, Default)]
struct LiveLayers {
  main: LiveLayer<EquipmentRecord>,
  panels: LiveLayer<PanelRecord>,
  partners: LiveLayer<PartnerRecord>,
}

impl LiveLayers {
  fn is_empty(&self) -> bool {
    self.main.rows.is_empty() && self.panels.rows.is_empty() && self.partners.rows.is_empty()
  }
}

/// Record types the orchestrator keeps a live copy of.
trait LiveRecord: LayerRecord {
  fn slot(live: &mut LiveLayers) -> &mut LiveLayer<Self>;
}

impl LiveRecord for EquipmentRecord {
  fn slot(live: &mut LiveLayers) -> &mut LiveLayer<Self> {
    &mut live.main
  }
}

impl LiveRecord for PanelRecord {
  fn slot(live: &mut LiveLayers) -> &mut LiveLayer<Self> {
    &mut live.panels
  }
}

impl LiveRecord for PartnerRecord {
  fn slot(live: &mut LiveLayers) -> &mut LiveLayer<Self> {
    &mut live.partners
  }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives sync cycles. Taking `&mut self` in [`SyncOrchestrator::run`] keeps
/// at most one cycle in flight per orchestrator.
pub struct SyncOrchestrator<S: LayerStore, A: LayerSource> {
  store: S,
  source: A,
  marker_cache: Option<MarkerCache>,
  config: SyncConfig,
  live: LiveLayers,
  panel_map: PanelMap,
  partner_map: PartnerMap,
  dataset: Arc<Vec<UnifiedEntity>>,
  /// Fingerprint of the dataset the published markers were derived from
  markers_hash: Option<String>,
  dataset_tx: watch::Sender<Arc<Vec<UnifiedEntity>>>,
  markers_tx: watch::Sender<Arc<Vec<Marker>>>,
  progress_tx: Arc<watch::Sender<Option<SyncProgress>>>,
  clear_task: Option<JoinHandle<()>>,
}

impl<S: LayerStore, A: LayerSource> SyncOrchestrator<S, A> {
  pub fn new(store: S, source: A, config: SyncConfig) -> Self {
    let dataset = Arc::new(Vec::new());
    let (dataset_tx, _) = watch::channel(dataset.clone());
    let (markers_tx, _) = watch::channel(Arc::new(Vec::new()));
    let (progress_tx, _) = watch::channel(None);

    Self {
      store,
      source,
      marker_cache: None,
      config,
      live: LiveLayers::default(),
      panel_map: PanelMap::default(),
      partner_map: PartnerMap::default(),
      dataset,
      markers_hash: None,
      dataset_tx,
      markers_tx,
      progress_tx: Arc::new(progress_tx),
      clear_task: None,
    }
  }

  pub fn with_marker_cache(mut self, cache: MarkerCache) -> Self {
    self.marker_cache = Some(cache);
    self
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  pub fn marker_cache(&self) -> Option<&MarkerCache> {
    self.marker_cache.as_ref()
  }

  pub fn subscribe_dataset(&self) -> watch::Receiver<Arc<Vec<UnifiedEntity>>> {
    self.dataset_tx.subscribe()
  }

  pub fn subscribe_markers(&self) -> watch::Receiver<Arc<Vec<Marker>>> {
    self.markers_tx.subscribe()
  }

  /// `None` while idle.
  pub fn subscribe_progress(&self) -> watch::Receiver<Option<SyncProgress>> {
    self.progress_tx.subscribe()
  }

  pub fn dataset(&self) -> Arc<Vec<UnifiedEntity>> {
    self.dataset.clone()
  }

  pub fn markers(&self) -> Arc<Vec<Marker>> {
    self.markers_tx.borrow().clone()
  }

  /// Run one sync cycle.
  ///
  /// A fetch failure aborts the cycle and is returned; chunks persisted
  /// before it stay, and the next call resumes after them. Rate limits are
  /// retried after the advised wait up to `max_rate_limit_attempts`.
  pub async fn run(&mut self) -> Result<SyncReport> {
    if let Some(handle) = self.clear_task.take() {
      handle.abort();
    }

    let mut report = SyncReport::default();
    let result = self.run_phases(&mut report).await;
    match result {
      Ok(()) => {
        self.schedule_progress_clear();
        Ok(report)
      }
      Err(e) => {
        warn!(error = %e, "Sync cycle failed");
        self.progress_tx.send_replace(None);
        Err(e)
      }
    }
  }

  async fn run_phases(&mut self, report: &mut SyncReport) -> Result<()> {
    self.enter(report, SyncPhase::Initializing, 0, 0);
    if self.live.is_empty() {
      self.warm_start();
    }

    let mut main_total = None;
    if self.store_is_empty() {
      let limit = self.config.initial_batch.max(1);
      self.enter(report, SyncPhase::Loading, 0, limit);

      let page = self
        .fetch_page::<EquipmentRecord>(0, limit)
        .await
        .wrap_err("Failed to load initial batch")?;
      main_total = page.total;
      report.initial_rows = page.rows.len();
      self.absorb(0, page.rows);
      self.emit(SyncPhase::Loading, page.received, main_total.unwrap_or(page.received));
      info!(rows = report.initial_rows, total = ?main_total, "Loaded initial batch");
    }

    let main = self.sync_layer::<EquipmentRecord>(report, main_total).await?;
    report.layers.push(main);
    let panels = self.sync_layer::<PanelRecord>(report, None).await?;
    report.layers.push(panels);
    let partners = self.sync_layer::<PartnerRecord>(report, None).await?;
    report.layers.push(partners);

    self.prepare_map(report).await;

    report.entities = self.dataset.len();
    self.enter(report, SyncPhase::Complete, report.entities, report.entities);
    info!(
      entities = report.entities,
      markers = report.markers,
      "Sync complete"
    );
    Ok(())
  }

  /// Publish whatever the store already holds, plus a matching cached
  /// marker set. Returns the number of base records loaded.
  pub fn warm_start(&mut self) -> usize {
    let main: Vec<EquipmentRecord> = self.load_layer();
    let panels: Vec<PanelRecord> = self.load_layer();
    let partners: Vec<PartnerRecord> = self.load_layer();
    let loaded = main.len();

    self.live.main.upsert(0, main);
    self.live.panels.upsert(0, panels);
    self.live.partners.upsert(0, partners);
    self.panel_map = PanelMap::build(&self.live.panels.rows);
    self.partner_map = PartnerMap::build(&self.live.partners.rows);
    self.publish_dataset();

    if self.dataset.is_empty() {
      return loaded;
    }
    info!(records = loaded, "Warm start from layer store");

    let hash = dataset_fingerprint(&self.dataset);
    if let Some(markers) = self.cached_markers(&hash) {
      debug!(markers = markers.len(), "Using cached marker set");
      self.publish_markers(markers, hash);
    }
    loaded
  }

  fn load_layer<T: LayerRecord>(&self) -> Vec<T> {
    self.store.get_all::<T>().unwrap_or_else(|e| {
      warn!(layer = %T::LAYER, error = %e, "Failed to read layer store; starting empty");
      Vec::new()
    })
  }

  fn store_is_empty(&self) -> bool {
    let persisted = self.store.count(Layer::Main).unwrap_or_else(|e| {
      warn!(error = %e, "Failed to count main layer");
      0
    });
    persisted == 0 && self.live.main.rows.is_empty()
  }

  /// Offset a resumed sync starts at: the persisted row count, or the live
  /// count when the store is behind or unavailable.
  fn resume_offset<T: LiveRecord>(&mut self) -> usize {
    let persisted = self.store.count(T::LAYER).unwrap_or_else(|e| {
      warn!(layer = %T::LAYER, error = %e, "Failed to count layer");
      0
    });
    persisted.max(T::slot(&mut self.live).keyed_len())
  }

  async fn sync_layer<T: LiveRecord>(
    &mut self,
    report: &mut SyncReport,
    known_total: Option<usize>,
  ) -> Result<LayerReport> {
    let layer = T::LAYER;
    let phase = SyncPhase::syncing(layer);

    let synced_at = self.store.get_timestamp(layer).unwrap_or_else(|e| {
      warn!(%layer, error = %e, "Failed to read layer timestamp");
      None
    });
    let stale = self.store.is_stale(layer).unwrap_or(true);
    let resume = self.resume_offset::<T>();

    let mut total = known_total;
    if !stale {
      if total.is_none() {
        total = self
          .fetch_page::<T>(0, 1)
          .await
          .wrap_err_with(|| format!("Failed to check {} layer size", layer))?
          .total;
      }
      if !total.is_some_and(|t| resume < t) {
        debug!(%layer, rows = resume, ?total, "Layer is fresh; skipping");
        return Ok(LayerReport {
          layer,
          skipped: true,
          start_offset: resume,
          fetched: 0,
        });
      }
    }

    // A layer that completed once but expired is refreshed from the top, or
    // from where an interrupted refresh left off.
    let refreshing = stale && synced_at.is_some();
    let start = if refreshing {
      self
        .store
        .get_refresh_offset(layer)
        .unwrap_or_else(|e| {
          warn!(%layer, error = %e, "Failed to read refresh cursor");
          None
        })
        .unwrap_or(0)
    } else {
      resume
    };
    let chunk = self.config.chunk_size(layer);
    self.enter(report, phase, start, total.unwrap_or(0));
    info!(%layer, start, ?total, stale, "Syncing layer");

    let mut offset = start;
    let mut fetched = 0;
    loop {
      if total.is_some_and(|t| offset >= t) {
        break;
      }

      let page = self
        .fetch_page::<T>(offset, chunk)
        .await
        .wrap_err_with(|| format!("Failed to sync {} layer at offset {}", layer, offset))?;
      total = page.total.or(total);

      let received = page.received;
      fetched += page.rows.len();
      self.absorb(offset, page.rows);

      offset += received;
      if refreshing {
        if let Err(e) = self.store.set_refresh_offset(layer, Some(offset)) {
          warn!(%layer, error = %e, "Failed to record refresh cursor");
        }
      }
      self.emit(phase, offset, total.unwrap_or(offset));
      debug!(%layer, offset, ?total, "Chunk persisted");

      if received < chunk {
        break;
      }
    }

    match self.store.set_timestamp(layer, Utc::now()) {
      Ok(()) if refreshing => {
        if let Err(e) = self.store.set_refresh_offset(layer, None) {
          warn!(%layer, error = %e, "Failed to drop refresh cursor");
        }
      }
      Ok(()) => {}
      Err(e) => warn!(%layer, error = %e, "Failed to stamp layer"),
    }
    info!(%layer, fetched, "Layer synced");

    Ok(LayerReport {
      layer,
      skipped: false,
      start_offset: start,
      fetched,
    })
  }

  /// Fetch with the rate-limit policy applied.
  async fn fetch_page<T: LayerRecord>(
    &self,
    offset: usize,
    limit: usize,
  ) -> std::result::Result<Page<T>, ApiError> {
    let max_attempts = self.config.max_rate_limit_attempts.max(1);
    let mut attempt = 1;
    loop {
      match self.source.fetch::<T>(offset, limit, None).await {
        Err(ApiError::RateLimited { retry_after }) if attempt < max_attempts => {
          warn!(
            layer = %T::LAYER,
            offset,
            attempt,
            wait_ms = retry_after.as_millis() as u64,
            "Rate limited; waiting before retry"
          );
          tokio::time::sleep(retry_after).await;
          attempt += 1;
        }
        other => return other,
      }
    }
  }

  /// Persist a chunk fetched at `offset`, merge it into the live layer and
  /// republish.
  fn absorb<T: LiveRecord>(&mut self, offset: usize, rows: Vec<T>) {
    if let Err(e) = self.store.save_chunk(&rows) {
      warn!(layer = %T::LAYER, error = %e, "Failed to persist chunk; continuing without cache");
    }
    T::slot(&mut self.live).upsert(offset, rows);

    match T::LAYER {
      Layer::Main => {}
      Layer::Panels => self.panel_map = PanelMap::build(&self.live.panels.rows),
      Layer::Partner => self.partner_map = PartnerMap::build(&self.live.partners.rows),
    }
    self.publish_dataset();
  }

  fn publish_dataset(&mut self) {
    self.dataset = Arc::new(batch_attach(
      &self.live.main.rows,
      &self.panel_map,
      &self.partner_map,
    ));
    self.dataset_tx.send_replace(self.dataset.clone());
  }

  fn cached_markers(&self, hash: &str) -> Option<Vec<Marker>> {
    let cache = self.marker_cache.as_ref()?;
    match cache.is_valid(hash) {
      Ok(true) => cache.load_markers().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to read marker cache");
        None
      }),
      Ok(false) => None,
      Err(e) => {
        warn!(error = %e, "Failed to check marker cache");
        None
      }
    }
  }

  fn publish_markers(&mut self, markers: Vec<Marker>, hash: String) {
    self.markers_hash = Some(hash);
    self.markers_tx.send_replace(Arc::new(markers));
  }

  async fn prepare_map(&mut self, report: &mut SyncReport) {
    let dataset = self.dataset.clone();
    self.enter(report, SyncPhase::PreparingMap, 0, dataset.len());

    let hash = dataset_fingerprint(&dataset);
    if self.markers_hash.as_deref() == Some(hash.as_str()) {
      report.markers = self.markers_tx.borrow().len();
      debug!("Marker set is current");
      return;
    }

    if let Some(markers) = self.cached_markers(&hash) {
      report.markers = markers.len();
      self.publish_markers(markers, hash);
      return;
    }

    let markers = prepare_markers(&dataset, self.config.marker_batch_size).await;
    if let Some(cache) = &self.marker_cache {
      if let Err(e) = cache.save_markers(&markers, &hash) {
        warn!(error = %e, "Failed to save marker cache");
      }
    }
    info!(markers = markers.len(), "Rebuilt marker set");

    report.markers = markers.len();
    report.markers_rebuilt = true;
    self.publish_markers(markers, hash);
  }

  fn enter(&mut self, report: &mut SyncReport, phase: SyncPhase, current: usize, total: usize) {
    debug!(%phase, "Entering sync phase");
    report.phases.push(phase);
    self.emit(phase, current, total);
  }

  fn emit(&self, phase: SyncPhase, current: usize, total: usize) {
    self
      .progress_tx
      .send_replace(Some(SyncProgress::new(phase, current, total)));
  }

  fn schedule_progress_clear(&mut self) {
    let delay = self.config.progress_clear_delay;
    if delay.is_zero() {
      clear_completed(&self.progress_tx);
      return;
    }

    let tx = self.progress_tx.clone();
    self.clear_task = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      clear_completed(&tx);
    }));
  }
}

/// Reset progress to idle, unless a newer cycle has started since.
fn clear_completed(tx: &watch::Sender<Option<SyncProgress>>) {
  tx.send_if_modified(|progress| {
    if matches!(progress, Some(p) if p.phase == SyncPhase::Complete) {
      *progress = None;
      true
    } else {
      false
    }
  });
}

impl<S: LayerStore, A: LayerSource> Drop for SyncOrchestrator<S, A> {
  fn drop(&mut self) {
    if let Some(handle) = self.clear_task.take() {
      handle.abort();
    }
  }
}
