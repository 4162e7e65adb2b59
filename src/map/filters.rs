//! Marker filters applied before clustering.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use super::marker::Marker;

/// Filter set for the map. Empty sets and `None` flags match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerFilters {
  /// Accepted statuses (case-insensitive)
  #[serde(default, deserialize_with = "deserialize_lowercase_set")]
  pub statuses: BTreeSet<String>,
  /// Accepted neighborhoods (case-insensitive)
  #[serde(default, deserialize_with = "deserialize_lowercase_set")]
  pub neighborhoods: BTreeSet<String>,
  #[serde(default)]
  pub has_digital: Option<bool>,
  #[serde(default)]
  pub has_static: Option<bool>,
  #[serde(default)]
  pub has_abrigo_amigo: Option<bool>,
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl MarkerFilters {
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }

  pub fn matches(&self, marker: &Marker) -> bool {
    fn in_set(set: &BTreeSet<String>, value: Option<&String>) -> bool {
      if set.is_empty() {
        return true;
      }
      let Some(v) = value.map(|v| v.to_lowercase()) else {
        return false;
      };
      set.contains(&v) || set.iter().any(|s| s.to_lowercase() == v)
    }
    fn flag(wanted: Option<bool>, actual: bool) -> bool {
      wanted.map_or(true, |w| w == actual)
    }

    in_set(&self.statuses, marker.status.as_ref())
      && in_set(&self.neighborhoods, marker.neighborhood.as_ref())
      && flag(self.has_digital, marker.has_digital)
      && flag(self.has_static, marker.has_static)
      && flag(self.has_abrigo_amigo, marker.has_abrigo_amigo)
  }

  /// Structural hash: equal filter sets hash equal regardless of the order
  /// values were inserted in.
  pub fn structural_hash(&self) -> String {
    let mut normalized = self.clone();
    normalized.statuses = self.statuses.iter().map(|s| s.to_lowercase()).collect();
    normalized.neighborhoods = self
      .neighborhoods
      .iter()
      .map(|s| s.to_lowercase())
      .collect();

    // BTreeSet serializes in sorted order, so the JSON is canonical.
    let canonical = serde_json::to_string(&normalized).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn marker(status: &str, digital: bool) -> Marker {
    Marker {
      id: "E1".into(),
      lat: -23.5,
      lng: -46.6,
      stop_id: None,
      address: None,
      neighborhood: Some("Pinheiros".into()),
      area: None,
      status: Some(status.into()),
      model: None,
      partner_client: None,
      has_digital: digital,
      has_static: false,
      has_abrigo_amigo: false,
    }
  }

  #[test]
  fn test_empty_filters_match_everything() {
    let filters = MarkerFilters::default();
    assert!(filters.is_empty());
    assert!(filters.matches(&marker("Ativo", false)));
  }

  #[test]
  fn test_filters_combine_with_and() {
    let filters = MarkerFilters {
      statuses: ["ativo".to_string()].into(),
      has_digital: Some(true),
      ..Default::default()
    };
    assert!(filters.matches(&marker("ATIVO", true)));
    assert!(!filters.matches(&marker("Ativo", false)));
    assert!(!filters.matches(&marker("Inativo", true)));
  }

  #[test]
  fn test_accented_values_match_case_insensitively() {
    let filters: MarkerFilters =
      serde_json::from_str(r#"{"neighborhoods":["São Miguel"],"statuses":["Em Manutenção"]}"#)
        .unwrap();
    let mut m = marker("EM MANUTENÇÃO", false);
    m.neighborhood = Some("SÃO MIGUEL".into());
    assert!(filters.matches(&m));

    m.neighborhood = Some("Sao Miguel".into());
    assert!(!filters.matches(&m));
  }

  #[test]
  fn test_structural_hash_ignores_insertion_order_and_case() {
    let a = MarkerFilters {
      neighborhoods: ["pinheiros".to_string(), "se".to_string()].into(),
      ..Default::default()
    };
    let b = MarkerFilters {
      neighborhoods: ["Se".to_string(), "Pinheiros".to_string()].into(),
      ..Default::default()
    };
    assert_eq!(a.structural_hash(), b.structural_hash());

    let c = MarkerFilters {
      has_static: Some(false),
      ..a.clone()
    };
    assert_ne!(a.structural_hash(), c.structural_hash());
  }

  #[test]
  fn test_deserialize_lowercases_sets() {
    let filters: MarkerFilters =
      serde_json::from_str(r#"{"statuses":["Ativo"],"hasDigital":true}"#).unwrap();
    assert!(filters.statuses.contains("ativo"));
    assert_eq!(filters.has_digital, Some(true));
  }
}
