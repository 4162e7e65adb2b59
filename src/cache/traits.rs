//! Core traits and types shared by the layer stores.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// One independently-fetched, independently-keyed slice of equipment data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
  /// Base inventory, keyed by `electroId`
  Main,
  /// Panel specifications, keyed by `electroId`
  Panels,
  /// Partner-program flags, keyed by `stopId`
  Partner,
}

impl Layer {
  pub const ALL: [Layer; 3] = [Layer::Main, Layer::Panels, Layer::Partner];

  /// Name used on the wire (`?layer=`) and in metadata rows.
  pub fn as_str(self) -> &'static str {
    match self {
      Layer::Main => "main",
      Layer::Panels => "panels",
      Layer::Partner => "partner",
    }
  }

  /// Storage partition holding this layer's records.
  pub fn table(self) -> &'static str {
    match self {
      Layer::Main => "main_layer",
      Layer::Panels => "panels_layer",
      Layer::Partner => "partner_layer",
    }
  }

  pub fn parse(name: &str) -> Option<Self> {
    Self::ALL
      .into_iter()
      .find(|layer| layer.as_str().eq_ignore_ascii_case(name.trim()))
  }
}

impl fmt::Display for Layer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

/// Trait for records that live in a layer partition.
///
/// Records without a key can still be displayed but are never persisted
/// or joined.
pub trait LayerRecord: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Partition this record type belongs to
  const LAYER: Layer;

  /// Join/upsert key, or None when the record is orphaned
  fn layer_key(&self) -> Option<&str>;
}
