//! Marker derivation: the minimal geospatial projection of a unified entity.
//!
//! `Marker::from_entity` is the single derivation used both by the
//! background preparer and by the synchronous fallback when the marker
//! cache misses.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::layers::{Coordinate, UnifiedEntity};

/// How many leading ids feed the dataset fingerprint.
pub const FINGERPRINT_SAMPLE: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
  pub id: String,
  pub lat: f64,
  pub lng: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stop_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub neighborhood: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub area: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub partner_client: Option<String>,
  pub has_digital: bool,
  pub has_static: bool,
  pub has_abrigo_amigo: bool,
}

impl Marker {
  /// Project an entity onto a marker.
  ///
  /// None for orphans and for records without usable coordinates.
  pub fn from_entity(entity: &UnifiedEntity) -> Option<Self> {
    let id = entity.id()?;
    let record = &entity.record;
    let (lat, lng) = parse_position(record.latitude.as_ref(), record.longitude.as_ref())?;

    // Panel layer first, then the base record's own flags.
    let has_digital = entity
      .panel
      .as_ref()
      .map_or_else(|| record.flag("hasDigital"), |p| p.digital_present());
    let has_static = entity
      .panel
      .as_ref()
      .map_or_else(|| record.flag("hasStatic"), |p| p.static_present());

    Some(Self {
      id: id.to_string(),
      lat,
      lng,
      stop_id: record.stop_id.clone(),
      address: record.address.clone(),
      neighborhood: record.neighborhood.clone(),
      area: record.area.clone(),
      status: record.status.clone(),
      model: record.model.clone(),
      partner_client: entity
        .partner
        .as_ref()
        .map(|p| p.client.as_str().to_string())
        .filter(|c| !c.is_empty()),
      has_digital,
      has_static,
      has_abrigo_amigo: entity.has_abrigo_amigo(),
    })
  }
}

/// Validate a latitude/longitude pair.
///
/// Rejects missing or non-numeric values, out-of-range values and the
/// `(0, 0)` placeholder.
pub fn parse_position(lat: Option<&Coordinate>, lng: Option<&Coordinate>) -> Option<(f64, f64)> {
  let lat = lat?.value()?;
  let lng = lng?.value()?;

  if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
    return None;
  }
  if lat == 0.0 && lng == 0.0 {
    return None;
  }
  Some((lat, lng))
}

/// Cheap fingerprint of a dataset: record count plus the first few ids.
///
/// Not collision resistant; a match only means "probably unchanged".
pub fn generate_hash<S: AsRef<str>>(count: usize, sample_ids: &[S]) -> String {
  let sample: Vec<&str> = sample_ids
    .iter()
    .take(FINGERPRINT_SAMPLE)
    .map(AsRef::as_ref)
    .collect();

  let mut hasher = Sha256::new();
  hasher.update(format!("{}:{}", count, sample.join(",")).as_bytes());
  hex::encode(&hasher.finalize()[..8])
}

/// Fingerprint of a unified dataset.
pub fn dataset_fingerprint(entities: &[UnifiedEntity]) -> String {
  let ids: Vec<&str> = entities
    .iter()
    .filter_map(UnifiedEntity::id)
    .take(FINGERPRINT_SAMPLE)
    .collect();
  generate_hash(entities.len(), &ids)
}

/// Derive markers synchronously. Used when the marker cache misses and the
/// caller cannot wait for the cooperative preparer.
pub fn derive_markers(entities: &[UnifiedEntity]) -> Vec<Marker> {
  entities.iter().filter_map(Marker::from_entity).collect()
}

/// Derive markers in batches, yielding to the scheduler between batches so
/// long scans never hold the executor.
pub async fn prepare_markers(entities: &[UnifiedEntity], batch_size: usize) -> Vec<Marker> {
  let batch_size = batch_size.max(1);
  let mut markers = Vec::with_capacity(entities.len());

  for (i, batch) in entities.chunks(batch_size).enumerate() {
    if i > 0 {
      tokio::task::yield_now().await;
    }
    markers.extend(batch.iter().filter_map(Marker::from_entity));
  }

  debug!(
    markers = markers.len(),
    skipped = entities.len() - markers.len(),
    "Prepared map markers"
  );
  markers
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::layers::{stack_layers, EquipmentRecord, PanelRecord, PartnerRecord};

  fn located(id: &str, lat: Coordinate, lng: Coordinate) -> EquipmentRecord {
    EquipmentRecord {
      electro_id: Some(id.to_string()),
      stop_id: Some(format!("S-{id}")),
      latitude: Some(lat),
      longitude: Some(lng),
      ..Default::default()
    }
  }

  #[test]
  fn test_hash_is_deterministic() {
    let ids = ["A001", "A002", "A003", "A004", "A005"];
    assert_eq!(generate_hash(12000, &ids), generate_hash(12000, &ids));
    assert_ne!(generate_hash(12000, &ids), generate_hash(12001, &ids));
  }

  #[test]
  fn test_hash_only_samples_first_five_ids() {
    let a = ["A001", "A002", "A003", "A004", "A005", "A006"];
    let b = ["A001", "A002", "A003", "A004", "A005", "Z999"];
    assert_eq!(generate_hash(12000, &a), generate_hash(12000, &b));

    let c = ["A001", "A002", "A003", "A004", "Z999"];
    assert_ne!(generate_hash(12000, &a), generate_hash(12000, &c));
  }

  #[test]
  fn test_invalid_coordinates_are_skipped() {
    let main = vec![
      located("E1", Coordinate::Number(-23.55), Coordinate::Text("-46,63".into())),
      located("E2", Coordinate::Text("N/A".into()), Coordinate::Number(-46.6)),
      located("E3", Coordinate::Number(0.0), Coordinate::Number(0.0)),
      located("E4", Coordinate::Number(123.0), Coordinate::Number(-46.6)),
      EquipmentRecord {
        electro_id: Some("E5".into()),
        ..Default::default()
      },
      EquipmentRecord {
        latitude: Some(Coordinate::Number(-23.5)),
        longitude: Some(Coordinate::Number(-46.6)),
        ..Default::default()
      },
    ];
    let markers = derive_markers(&stack_layers(&main, &[], &[]));

    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].id, "E1");
    assert_eq!(markers[0].lng, -46.63);
  }

  #[test]
  fn test_feature_flags_prefer_panel_layer() {
    let mut base = located("E1", Coordinate::Number(-23.5), Coordinate::Number(-46.6));
    base
      .extra
      .insert("hasStatic".into(), serde_json::Value::Bool(true));
    let mut bare = located("E2", Coordinate::Number(-23.5), Coordinate::Number(-46.6));
    bare
      .extra
      .insert("hasStatic".into(), serde_json::Value::Bool(true));

    let panels = vec![PanelRecord {
      electro_id: Some("E1".into()),
      has_digital: true,
      ..Default::default()
    }];
    let partners = vec![PartnerRecord {
      stop_id: Some("S-E1".into()),
      enabled: true,
      client: "claro".into(),
    }];
    let markers = derive_markers(&stack_layers(&[base, bare], &panels, &partners));

    assert!(markers[0].has_digital && !markers[0].has_static && markers[0].has_abrigo_amigo);
    assert_eq!(markers[0].partner_client.as_deref(), Some("claro"));
    assert!(!markers[1].has_digital && markers[1].has_static && !markers[1].has_abrigo_amigo);
  }

  #[tokio::test]
  async fn test_batched_preparation_matches_direct_derivation() {
    let main: Vec<_> = (0..25)
      .map(|i| {
        located(
          &format!("E{i}"),
          Coordinate::Number(-23.0 - f64::from(i) / 100.0),
          Coordinate::Number(-46.0),
        )
      })
      .collect();
    let entities = stack_layers(&main, &[], &[]);

    let batched = prepare_markers(&entities, 4).await;

    assert_eq!(batched, derive_markers(&entities));
    assert_eq!(batched.len(), 25);
  }
}
