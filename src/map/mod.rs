//! Map marker preparation and clustering.
//!
//! - `marker`: projection of unified entities onto markers, fingerprints
//! - `filters`: marker filters and their structural hash
//! - `kdindex`, `supercluster`: spatial index and zoom hierarchy
//! - `worker`: background clustering thread and its message protocol

mod filters;
mod kdindex;
mod marker;
mod supercluster;
mod worker;

pub use filters::MarkerFilters;
pub use marker::{
  dataset_fingerprint, derive_markers, generate_hash, parse_position, prepare_markers, Marker,
  FINGERPRINT_SAMPLE,
};
pub use supercluster::{BBox, ClusterError, ClusterFeature, ClusterIndex, ClusterOptions};
pub use worker::{
  ClusterClient, ClusterWorker, Envelope, WorkerError, WorkerRequest, WorkerResponse,
};
