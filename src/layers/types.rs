//! Record types for the three synchronized layers.
//!
//! The remote API is loosely typed: ids arrive as strings or numbers,
//! coordinates as numbers or free text, flags as booleans or `"true"`.
//! The lenient deserializers here normalize that once at the edge so the
//! rest of the crate works with fixed shapes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::cache::{Layer, LayerRecord};

// ============================================================================
// Equipment (main layer)
// ============================================================================

/// Base unit of the inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentRecord {
  #[serde(
    default,
    deserialize_with = "lenient_id",
    skip_serializing_if = "Option::is_none"
  )]
  pub electro_id: Option<String>,
  #[serde(
    default,
    deserialize_with = "lenient_id",
    skip_serializing_if = "Option::is_none"
  )]
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
  pub latitude: Option<Coordinate>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub longitude: Option<Coordinate>,
  /// Everything else the API sends (feature flags, dates, ...)
  #[serde(flatten)]
  pub extra: BTreeMap<String, Value>,
}

impl EquipmentRecord {
  /// Truthiness of an open attribute such as `hasWifi`.
  pub fn flag(&self, name: &str) -> bool {
    self.extra.get(name).is_some_and(truthy)
  }
}

impl LayerRecord for EquipmentRecord {
  const LAYER: Layer = Layer::Main;

  fn layer_key(&self) -> Option<&str> {
    self.electro_id.as_deref()
  }
}

/// A coordinate as sent by the API: sometimes numeric, sometimes text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coordinate {
  Number(f64),
  Text(String),
}

impl Coordinate {
  /// Numeric value, or None for placeholders like `""`, `"-"` or `"N/A"`.
  pub fn value(&self) -> Option<f64> {
    let v = match self {
      Coordinate::Number(n) => *n,
      Coordinate::Text(s) => s.trim().replace(',', ".").parse::<f64>().ok()?,
    };
    v.is_finite().then_some(v)
  }
}

// ============================================================================
// Panels layer
// ============================================================================

/// One digital or static panel installation on a piece of equipment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelSpec {
  #[serde(default)]
  pub boxes: u32,
  #[serde(default)]
  pub faces: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub position: Option<String>,
  #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
  pub panel_type: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub brand: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelRecord {
  #[serde(
    default,
    deserialize_with = "lenient_id",
    skip_serializing_if = "Option::is_none"
  )]
  pub electro_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub digital: Option<PanelSpec>,
  #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
  pub static_panel: Option<PanelSpec>,
  #[serde(default, deserialize_with = "lenient_bool")]
  pub has_digital: bool,
  #[serde(default, deserialize_with = "lenient_bool")]
  pub has_static: bool,
  #[serde(default)]
  pub total_panels: u32,
}

impl PanelRecord {
  /// Digital presence, falling back to the sub-object when the flag is unset.
  pub fn digital_present(&self) -> bool {
    self.has_digital || self.digital.as_ref().is_some_and(|p| p.boxes > 0)
  }

  pub fn static_present(&self) -> bool {
    self.has_static || self.static_panel.as_ref().is_some_and(|p| p.boxes > 0)
  }
}

impl LayerRecord for PanelRecord {
  const LAYER: Layer = Layer::Panels;

  fn layer_key(&self) -> Option<&str> {
    self.electro_id.as_deref()
  }
}

// ============================================================================
// Partner-program layer
// ============================================================================

/// Partner-program client. Unknown identifiers are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum PartnerClient {
  Claro,
  Eletromidia,
  #[default]
  Unknown,
  Other(String),
}

impl PartnerClient {
  pub fn as_str(&self) -> &str {
    match self {
      PartnerClient::Claro => "claro",
      PartnerClient::Eletromidia => "eletromidia",
      PartnerClient::Unknown => "",
      PartnerClient::Other(s) => s,
    }
  }
}

impl From<&str> for PartnerClient {
  fn from(s: &str) -> Self {
    match s.trim().to_lowercase().as_str() {
      "" => PartnerClient::Unknown,
      "claro" => PartnerClient::Claro,
      "eletromidia" => PartnerClient::Eletromidia,
      _ => PartnerClient::Other(s.trim().to_string()),
    }
  }
}

impl Serialize for PartnerClient {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for PartnerClient {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.as_deref().map(PartnerClient::from).unwrap_or_default())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerRecord {
  #[serde(
    default,
    deserialize_with = "lenient_id",
    skip_serializing_if = "Option::is_none"
  )]
  pub stop_id: Option<String>,
  #[serde(default, deserialize_with = "lenient_bool")]
  pub enabled: bool,
  #[serde(default)]
  pub client: PartnerClient,
}

impl LayerRecord for PartnerRecord {
  const LAYER: Layer = Layer::Partner;

  fn layer_key(&self) -> Option<&str> {
    self.stop_id.as_deref()
  }
}

// ============================================================================
// Lenient field decoding
// ============================================================================

/// Accept string or numeric ids; empty strings count as missing.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Option::<Value>::deserialize(deserializer)?;
  Ok(match value {
    Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
    Some(Value::Number(n)) => Some(n.to_string()),
    _ => None,
  })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Option::<Value>::deserialize(deserializer)?;
  Ok(value.as_ref().is_some_and(truthy))
}

fn truthy(value: &Value) -> bool {
  match value {
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
    Value::String(s) => matches!(
      s.trim().to_lowercase().as_str(),
      "true" | "1" | "sim" | "yes" | "s"
    ),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_equipment_accepts_numeric_ids_and_keeps_extra_fields() {
    let record: EquipmentRecord = serde_json::from_value(json!({
      "electroId": 1516,
      "stopId": "",
      "address": "Rua Augusta, 100",
      "latitude": "-23,55",
      "longitude": -46.63,
      "hasWifi": "true"
    }))
    .unwrap();

    assert_eq!(record.electro_id.as_deref(), Some("1516"));
    assert_eq!(record.stop_id, None);
    assert_eq!(record.latitude.as_ref().and_then(Coordinate::value), Some(-23.55));
    assert!(record.flag("hasWifi"));
    assert!(!record.flag("hasUsb"));
  }

  #[test]
  fn test_coordinate_placeholders_have_no_value() {
    assert_eq!(Coordinate::Text("-".into()).value(), None);
    assert_eq!(Coordinate::Text("N/A".into()).value(), None);
    assert_eq!(Coordinate::Text(String::new()).value(), None);
    assert_eq!(Coordinate::Number(f64::NAN).value(), None);
  }

  #[test]
  fn test_partner_client_categories() {
    let record: PartnerRecord = serde_json::from_value(json!({
      "stopId": "S1", "enabled": 1, "client": "CLARO"
    }))
    .unwrap();
    assert!(record.enabled);
    assert_eq!(record.client, PartnerClient::Claro);

    let other: PartnerRecord = serde_json::from_value(json!({
      "stopId": "S2", "enabled": "false", "client": "Acme"
    }))
    .unwrap();
    assert!(!other.enabled);
    assert_eq!(other.client, PartnerClient::Other("Acme".into()));

    let missing: PartnerRecord = serde_json::from_value(json!({ "stopId": "S3" })).unwrap();
    assert_eq!(missing.client, PartnerClient::Unknown);
  }

  #[test]
  fn test_panel_presence_falls_back_to_sub_objects() {
    let record: PanelRecord = serde_json::from_value(json!({
      "electroId": "E1",
      "digital": { "boxes": 2, "faces": 4, "type": "LED" },
      "totalPanels": 2
    }))
    .unwrap();
    assert!(!record.has_digital);
    assert!(record.digital_present());
    assert!(!record.static_present());
    assert_eq!(record.digital.unwrap().panel_type.as_deref(), Some("LED"));
  }
}
