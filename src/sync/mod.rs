//! Layer synchronization.
//!
//! - `orchestrator`: the phased sync driver and its live snapshots
//! - `progress`: phase enum and progress snapshots

mod orchestrator;
mod progress;

pub use orchestrator::{LayerReport, SyncConfig, SyncOrchestrator, SyncReport};
pub use progress::{SyncPhase, SyncProgress};
