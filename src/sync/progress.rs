use serde::Serialize;
use std::fmt;

use crate::cache::Layer;

/// Phases of one sync cycle, in the order they run. Some are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
  Initializing,
  Loading,
  SyncingMain,
  SyncingPanels,
  SyncingPartner,
  PreparingMap,
  Complete,
}

impl SyncPhase {
  pub fn as_str(self) -> &'static str {
    match self {
      SyncPhase::Initializing => "initializing",
      SyncPhase::Loading => "loading",
      SyncPhase::SyncingMain => "syncing_main",
      SyncPhase::SyncingPanels => "syncing_panels",
      SyncPhase::SyncingPartner => "syncing_partner",
      SyncPhase::PreparingMap => "preparing_map",
      SyncPhase::Complete => "complete",
    }
  }

  /// Phase that syncs `layer`.
  pub fn syncing(layer: Layer) -> Self {
    match layer {
      Layer::Main => SyncPhase::SyncingMain,
      Layer::Panels => SyncPhase::SyncingPanels,
      Layer::Partner => SyncPhase::SyncingPartner,
    }
  }
}

impl fmt::Display for SyncPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

/// Advisory progress snapshot. `total` is 0 when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
  pub phase: SyncPhase,
  pub current: usize,
  pub total: usize,
}

impl SyncProgress {
  pub fn new(phase: SyncPhase, current: usize, total: usize) -> Self {
    Self {
      phase,
      current,
      total,
    }
  }

  /// Completion ratio in `0.0..=1.0`, if the total is known.
  pub fn ratio(&self) -> Option<f64> {
    (self.total > 0).then(|| (self.current as f64 / self.total as f64).min(1.0))
  }
}

impl fmt::Display for SyncProgress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.total > 0 {
      write!(f, "{}: {}/{}", self.phase, self.current, self.total)
    } else {
      write!(f, "{}", self.phase)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_phases_are_ordered() {
    assert!(SyncPhase::Initializing < SyncPhase::Loading);
    assert!(SyncPhase::SyncingPartner < SyncPhase::PreparingMap);
    assert_eq!(SyncPhase::syncing(Layer::Panels), SyncPhase::SyncingPanels);
  }

  #[test]
  fn test_progress_display_and_ratio() {
    let p = SyncProgress::new(SyncPhase::SyncingMain, 6000, 12000);
    assert_eq!(p.to_string(), "syncing_main: 6000/12000");
    assert_eq!(p.ratio(), Some(0.5));
    assert_eq!(SyncProgress::new(SyncPhase::Complete, 0, 0).ratio(), None);
  }
}
