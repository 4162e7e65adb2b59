//! Clustering offload: a background thread owning the cluster index.
//!
//! The interactive side talks to it only through messages. Every request
//! carries an integer id and every response echoes it, including error
//! responses, so a caller waiting on a failed request is always released.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::filters::MarkerFilters;
use super::marker::Marker;
use super::supercluster::{BBox, ClusterError, ClusterFeature, ClusterIndex, ClusterOptions};

/// Message with its correlation id.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
  pub id: u64,
  pub body: T,
}

#[derive(Debug, Clone)]
pub enum WorkerRequest {
  /// Load the full marker set and build the index for `filters`
  Init {
    points: Vec<Marker>,
    filters: MarkerFilters,
  },
  /// Viewport query; rebuilds the index first if `filters` changed
  GetClusters {
    bbox: BBox,
    zoom: f64,
    filters: MarkerFilters,
  },
  GetClusterExpansionZoom {
    cluster_id: u64,
  },
  GetLeaves {
    cluster_id: u64,
    limit: usize,
    offset: usize,
  },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResponse {
  Ready {
    point_count: usize,
  },
  Clusters {
    clusters: Vec<ClusterFeature>,
    total_filtered: usize,
  },
  ExpansionZoom {
    zoom: u8,
  },
  Leaves {
    leaves: Vec<Marker>,
  },
  Error {
    message: String,
  },
}

#[derive(Debug, Error)]
pub enum WorkerError {
  #[error("Cluster index not initialized")]
  NotInitialized,
  #[error(transparent)]
  Cluster(#[from] ClusterError),
}

/// Worker-side state: all markers plus one index for the current filters.
pub struct ClusterWorker {
  options: ClusterOptions,
  points: Vec<Marker>,
  filter_hash: Option<String>,
  index: Option<ClusterIndex>,
}

impl ClusterWorker {
  pub fn new(options: ClusterOptions) -> Self {
    Self {
      options,
      points: Vec::new(),
      filter_hash: None,
      index: None,
    }
  }

  /// Handle one request. Errors and panics both become `Error` responses.
  pub fn handle(&mut self, request: WorkerRequest) -> WorkerResponse {
    match catch_unwind(AssertUnwindSafe(|| self.dispatch(request))) {
      Ok(Ok(response)) => response,
      Ok(Err(e)) => WorkerResponse::Error {
        message: e.to_string(),
      },
      Err(panic) => {
        // A panic may have left a half-built index behind.
        self.index = None;
        self.filter_hash = None;
        let message = panic
          .downcast_ref::<&str>()
          .map(|s| s.to_string())
          .or_else(|| panic.downcast_ref::<String>().cloned())
          .unwrap_or_else(|| "Cluster worker panicked".to_string());
        WorkerResponse::Error { message }
      }
    }
  }

  fn dispatch(&mut self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
    match request {
      WorkerRequest::Init { points, filters } => {
        self.points = points;
        self.filter_hash = None;
        let index = self.apply_filters(&filters);
        Ok(WorkerResponse::Ready {
          point_count: index.len(),
        })
      }
      WorkerRequest::GetClusters {
        bbox,
        zoom,
        filters,
      } => {
        if self.index.is_none() && self.points.is_empty() {
          return Err(WorkerError::NotInitialized);
        }
        let index = self.apply_filters(&filters);
        Ok(WorkerResponse::Clusters {
          clusters: index.get_clusters(bbox, zoom),
          total_filtered: index.len(),
        })
      }
      WorkerRequest::GetClusterExpansionZoom { cluster_id } => {
        let index = self.index.as_ref().ok_or(WorkerError::NotInitialized)?;
        Ok(WorkerResponse::ExpansionZoom {
          zoom: index.get_cluster_expansion_zoom(cluster_id)?,
        })
      }
      WorkerRequest::GetLeaves {
        cluster_id,
        limit,
        offset,
      } => {
        let index = self.index.as_ref().ok_or(WorkerError::NotInitialized)?;
        Ok(WorkerResponse::Leaves {
          leaves: index.get_leaves(cluster_id, limit, offset)?,
        })
      }
    }
  }

  /// Current index for `filters`, rebuilt only when the filter set changed.
  fn apply_filters(&mut self, filters: &MarkerFilters) -> &ClusterIndex {
    let hash = filters.structural_hash();
    if self.index.is_none() || self.filter_hash.as_deref() != Some(hash.as_str()) {
      let filtered: Vec<Marker> = self
        .points
        .iter()
        .filter(|m| filters.matches(m))
        .cloned()
        .collect();
      debug!(
        total = self.points.len(),
        filtered = filtered.len(),
        "Rebuilding cluster index"
      );
      self.index = Some(ClusterIndex::build(filtered, self.options));
      self.filter_hash = Some(hash);
    }
    self
      .index
      .get_or_insert_with(|| ClusterIndex::build(Vec::new(), self.options))
  }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerResponse>>>>;

/// Interactive-side handle to the clustering thread.
///
/// Dropping the client stops the thread.
pub struct ClusterClient {
  tx: mpsc::UnboundedSender<Envelope<WorkerRequest>>,
  pending: Pending,
  next_id: AtomicU64,
}

impl ClusterClient {
  /// Start the worker thread. Must be called inside a Tokio runtime.
  pub fn spawn(options: ClusterOptions) -> Result<Self> {
    let (tx, mut requests) = mpsc::unbounded_channel::<Envelope<WorkerRequest>>();
    let (responses_tx, mut responses) = mpsc::unbounded_channel::<Envelope<WorkerResponse>>();

    std::thread::Builder::new()
      .name("cluster-worker".to_string())
      .spawn(move || {
        let mut worker = ClusterWorker::new(options);
        while let Some(Envelope { id, body }) = requests.blocking_recv() {
          let body = worker.handle(body);
          if responses_tx.send(Envelope { id, body }).is_err() {
            break;
          }
        }
      })
      .map_err(|e| eyre!("Failed to spawn cluster worker: {}", e))?;

    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let router = Arc::clone(&pending);
    tokio::spawn(async move {
      while let Some(Envelope { id, body }) = responses.recv().await {
        let waiter = router.lock().ok().and_then(|mut p| p.remove(&id));
        match waiter {
          Some(waiter) => {
            let _ = waiter.send(body);
          }
          None => warn!(id, "Dropping cluster response with no waiter"),
        }
      }
      // Worker gone: release everyone still waiting.
      if let Ok(mut p) = router.lock() {
        p.clear();
      }
    });

    Ok(Self {
      tx,
      pending,
      next_id: AtomicU64::new(1),
    })
  }

  /// Send a request and wait for the response with the same id.
  pub async fn request(&self, body: WorkerRequest) -> Result<WorkerResponse> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (waiter, response) = oneshot::channel();

    self
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(id, waiter);

    if self.tx.send(Envelope { id, body }).is_err() {
      if let Ok(mut p) = self.pending.lock() {
        p.remove(&id);
      }
      return Err(eyre!("Cluster worker is not running"));
    }

    match response.await {
      Ok(WorkerResponse::Error { message }) => Err(eyre!("Cluster request {} failed: {}", id, message)),
      Ok(response) => Ok(response),
      Err(_) => Err(eyre!("Cluster worker stopped before answering request {}", id)),
    }
  }

  pub async fn init(&self, points: Vec<Marker>, filters: MarkerFilters) -> Result<usize> {
    match self.request(WorkerRequest::Init { points, filters }).await? {
      WorkerResponse::Ready { point_count } => Ok(point_count),
      other => Err(unexpected(&other)),
    }
  }

  /// Clusters in the viewport plus the number of markers passing the filters.
  pub async fn get_clusters(
    &self,
    bbox: BBox,
    zoom: f64,
    filters: MarkerFilters,
  ) -> Result<(Vec<ClusterFeature>, usize)> {
    match self
      .request(WorkerRequest::GetClusters {
        bbox,
        zoom,
        filters,
      })
      .await?
    {
      WorkerResponse::Clusters {
        clusters,
        total_filtered,
      } => Ok((clusters, total_filtered)),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn get_cluster_expansion_zoom(&self, cluster_id: u64) -> Result<u8> {
    match self
      .request(WorkerRequest::GetClusterExpansionZoom { cluster_id })
      .await?
    {
      WorkerResponse::ExpansionZoom { zoom } => Ok(zoom),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn get_leaves(&self, cluster_id: u64, limit: usize, offset: usize) -> Result<Vec<Marker>> {
    match self
      .request(WorkerRequest::GetLeaves {
        cluster_id,
        limit,
        offset,
      })
      .await?
    {
      WorkerResponse::Leaves { leaves } => Ok(leaves),
      other => Err(unexpected(&other)),
    }
  }
}

fn unexpected(response: &WorkerResponse) -> color_eyre::Report {
  eyre!("Unexpected cluster worker response: {:?}", response)
}
