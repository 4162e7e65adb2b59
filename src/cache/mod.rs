//! Persistent caches for the synchronized layers and the derived marker set.
//!
//! Both stores are best-effort: losing either is safe because everything
//! can be rebuilt from the remote API.
//! - `storage`: one partition per layer plus per-layer sync timestamps
//! - `markers`: the map marker set, keyed by a dataset fingerprint

mod markers;
mod storage;
mod traits;

pub use markers::{MapViewState, MarkerCache};
pub use storage::{LayerStore, NoopLayerStore, SqliteLayerStore, LAYER_STALE_HOURS};
pub use traits::{Layer, LayerRecord};
