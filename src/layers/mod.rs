//! Layer record types and the stacker that joins them.

mod stacker;
mod types;

pub use stacker::{batch_attach, stack_layers, PanelMap, PartnerMap, UnifiedEntity};
pub use types::{
  Coordinate, EquipmentRecord, PanelRecord, PanelSpec, PartnerClient, PartnerRecord,
};
