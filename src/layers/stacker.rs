//! Joins the layers into one unified entity per equipment record.
//!
//! Pure and synchronous. Lookup maps are built once per secondary layer so
//! that re-attaching against a stable map (only the base layer changed)
//! stays O(n).

use serde::{Serialize, Serializer};
use std::collections::HashMap;

use super::types::{EquipmentRecord, PanelRecord, PartnerRecord};

/// An equipment record plus its optional layer attachments.
///
/// Attachment presence is the only source of truth for the `_has*` flags,
/// so a flag can never disagree with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedEntity {
  pub record: EquipmentRecord,
  pub panel: Option<PanelRecord>,
  pub partner: Option<PartnerRecord>,
}

impl UnifiedEntity {
  pub fn bare(record: EquipmentRecord) -> Self {
    Self {
      record,
      panel: None,
      partner: None,
    }
  }

  pub fn id(&self) -> Option<&str> {
    self.record.electro_id.as_deref()
  }

  pub fn has_panel_data(&self) -> bool {
    self.panel.is_some()
  }

  pub fn has_abrigo_amigo(&self) -> bool {
    self.partner.is_some()
  }
}

impl AsRef<EquipmentRecord> for UnifiedEntity {
  fn as_ref(&self) -> &EquipmentRecord {
    &self.record
  }
}

impl AsRef<EquipmentRecord> for EquipmentRecord {
  fn as_ref(&self) -> &EquipmentRecord {
    self
  }
}

/// Flattened JSON shape consumed by the presentation layer.
#[derive(Serialize)]
struct UnifiedEntityView<'a> {
  #[serde(flatten)]
  record: &'a EquipmentRecord,
  #[serde(rename = "_hasPanelData")]
  has_panel_data: bool,
  #[serde(rename = "_panelData", skip_serializing_if = "Option::is_none")]
  panel_data: Option<&'a PanelRecord>,
  #[serde(rename = "_hasAbrigoAmigo")]
  has_abrigo_amigo: bool,
  #[serde(rename = "_abrigoAmigoData", skip_serializing_if = "Option::is_none")]
  abrigo_amigo_data: Option<&'a PartnerRecord>,
}

impl Serialize for UnifiedEntity {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    UnifiedEntityView {
      record: &self.record,
      has_panel_data: self.has_panel_data(),
      panel_data: self.panel.as_ref(),
      has_abrigo_amigo: self.has_abrigo_amigo(),
      abrigo_amigo_data: self.partner.as_ref(),
    }
    .serialize(serializer)
  }
}

/// Panel lookup keyed by `electroId`. Later records win on duplicate keys.
#[derive(Debug, Clone, Default)]
pub struct PanelMap {
  by_id: HashMap<String, PanelRecord>,
}

impl PanelMap {
  pub fn build(panels: &[PanelRecord]) -> Self {
    let by_id = panels
      .iter()
      .filter_map(|p| Some((p.electro_id.clone()?, p.clone())))
      .collect();
    Self { by_id }
  }

  pub fn get(&self, electro_id: &str) -> Option<&PanelRecord> {
    self.by_id.get(electro_id)
  }

  pub fn len(&self) -> usize {
    self.by_id.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }
}

/// Partner lookup keyed by `stopId`, holding enabled records only.
#[derive(Debug, Clone, Default)]
pub struct PartnerMap {
  by_stop: HashMap<String, PartnerRecord>,
}

impl PartnerMap {
  pub fn build(partners: &[PartnerRecord]) -> Self {
    let by_stop = partners
      .iter()
      .filter(|p| p.enabled)
      .filter_map(|p| Some((p.stop_id.clone()?, p.clone())))
      .collect();
    Self { by_stop }
  }

  pub fn get(&self, stop_id: &str) -> Option<&PartnerRecord> {
    self.by_stop.get(stop_id)
  }

  pub fn len(&self) -> usize {
    self.by_stop.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_stop.is_empty()
  }
}

/// Attach both layers to every base record using prebuilt maps.
///
/// Records without an `electroId` are orphans: they stay in the output but
/// take part in no join.
pub fn batch_attach<R: AsRef<EquipmentRecord>>(
  base: &[R],
  panels: &PanelMap,
  partners: &PartnerMap,
) -> Vec<UnifiedEntity> {
  base
    .iter()
    .map(|r| {
      let record = r.as_ref();
      let Some(id) = record.electro_id.as_deref() else {
        return UnifiedEntity::bare(record.clone());
      };
      let partner = record
        .stop_id
        .as_deref()
        .and_then(|stop| partners.get(stop))
        .cloned();
      UnifiedEntity {
        record: record.clone(),
        panel: panels.get(id).cloned(),
        partner,
      }
    })
    .collect()
}

/// Build the lookup maps and join in one go.
pub fn stack_layers<R: AsRef<EquipmentRecord>>(
  base: &[R],
  panels: &[PanelRecord],
  partners: &[PartnerRecord],
) -> Vec<UnifiedEntity> {
  batch_attach(base, &PanelMap::build(panels), &PartnerMap::build(partners))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::layers::types::PartnerClient;

  fn equipment(id: Option<&str>, stop: Option<&str>) -> EquipmentRecord {
    EquipmentRecord {
      electro_id: id.map(String::from),
      stop_id: stop.map(String::from),
      ..Default::default()
    }
  }

  fn panel(id: &str, total: u32) -> PanelRecord {
    PanelRecord {
      electro_id: Some(id.to_string()),
      has_digital: true,
      total_panels: total,
      ..Default::default()
    }
  }

  fn partner(stop: &str, enabled: bool) -> PartnerRecord {
    PartnerRecord {
      stop_id: Some(stop.to_string()),
      enabled,
      client: PartnerClient::Claro,
    }
  }

  #[test]
  fn test_flags_always_match_attachments() {
    let main = vec![
      equipment(Some("E1"), Some("S1")),
      equipment(Some("E2"), Some("S2")),
      equipment(None, Some("S1")),
    ];
    let unified = stack_layers(&main, &[panel("E1", 1)], &[partner("S1", true)]);

    for entity in &unified {
      assert_eq!(entity.has_panel_data(), entity.panel.is_some());
      let json = serde_json::to_value(entity).unwrap();
      assert_eq!(json["_hasPanelData"].as_bool().unwrap(), !json["_panelData"].is_null());
      assert_eq!(
        json["_hasAbrigoAmigo"].as_bool().unwrap(),
        !json["_abrigoAmigoData"].is_null()
      );
    }
    assert!(unified[0].has_panel_data() && unified[0].has_abrigo_amigo());
    assert!(!unified[1].has_panel_data() && !unified[1].has_abrigo_amigo());
  }

  #[test]
  fn test_orphans_are_kept_but_never_joined() {
    let main = vec![equipment(None, Some("S1"))];
    let unified = stack_layers(&main, &[panel("E1", 1)], &[partner("S1", true)]);
    assert_eq!(unified.len(), 1);
    assert!(!unified[0].has_abrigo_amigo());
    assert!(!unified[0].has_panel_data());
  }

  #[test]
  fn test_restacking_is_idempotent() {
    let main = vec![equipment(Some("E1"), None), equipment(Some("E2"), None)];
    let panels = vec![panel("E1", 3)];

    let once = stack_layers(&main, &panels, &[]);
    let twice = stack_layers(&once, &panels, &[]);

    assert_eq!(once, twice);
  }

  #[test]
  fn test_duplicate_keys_last_record_wins() {
    let main = vec![equipment(Some("E1"), None)];
    let panels = vec![panel("E1", 1), panel("E1", 7)];
    let unified = stack_layers(&main, &panels, &[]);
    assert_eq!(unified[0].panel.as_ref().unwrap().total_panels, 7);

    let reversed: Vec<_> = panels.into_iter().rev().collect();
    let unified = stack_layers(&main, &reversed, &[]);
    assert_eq!(unified[0].panel.as_ref().unwrap().total_panels, 1);
  }

  #[test]
  fn test_disabled_partners_are_absent() {
    let main = vec![equipment(Some("E1"), Some("S1")), equipment(Some("E2"), Some("S2"))];
    let partners = vec![partner("S1", false), partner("S2", true), partner("S2", false)];
    let map = PartnerMap::build(&partners);
    assert_eq!(map.len(), 1);
    assert!(map.get("S1").is_none());

    let unified = batch_attach(&main, &PanelMap::default(), &map);
    assert!(!unified[0].has_abrigo_amigo());
    assert!(unified[1].has_abrigo_amigo());
  }

  #[test]
  fn test_prebuilt_maps_match_one_shot_stacking() {
    let main = vec![equipment(Some("E1"), Some("S1")), equipment(Some("E2"), Some("S9"))];
    let panels = vec![panel("E2", 2)];
    let partners = vec![partner("S1", true)];

    let panel_map = PanelMap::build(&panels);
    let partner_map = PartnerMap::build(&partners);
    assert_eq!(panel_map.len(), 1);
    assert_eq!(partner_map.len(), 1);

    assert_eq!(
      batch_attach(&main, &panel_map, &partner_map),
      stack_layers(&main, &panels, &partners)
    );
  }
}
