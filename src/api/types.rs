//! Wire types for the inventory API response envelope.
//!
//! Success: `{status, meta: {count, total, cached}, data: [...]}`.
//! Failure: `{status: "error", code, message, meta: {retryAfter}}`, where a
//! `code` of 429 signals rate limiting in-body.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use super::error::ApiError;

/// Wait used when the server rate limits without saying for how long.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Longest advised wait honoured before retrying.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

const RATE_LIMIT_CODE: i64 = 429;

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
  #[serde(default)]
  status: Option<String>,
  #[serde(default)]
  meta: ResponseMeta,
  #[serde(default)]
  data: Option<Vec<Value>>,
  #[serde(default)]
  code: Option<Value>,
  #[serde(default)]
  message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseMeta {
  total: Option<u64>,
  #[serde(default)]
  cached: bool,
  /// Seconds
  retry_after: Option<f64>,
}

/// One page of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
  pub rows: Vec<T>,
  /// Rows the server sent, including ones dropped as malformed. Pagination
  /// advances by this, not by `rows.len()`.
  pub received: usize,
  /// Server-reported size of the whole layer, when given
  pub total: Option<usize>,
  /// Server answered from its own cache
  pub cached: bool,
}

fn parse_code(code: &Value) -> Option<i64> {
  match code {
    Value::Number(n) => n.as_i64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

/// Convert an advised wait in seconds into a duration, capped at
/// [`MAX_RETRY_AFTER`]. Negative or unrepresentable hints mean the default.
pub fn retry_after_from_secs(secs: Option<f64>) -> Duration {
  secs
    .and_then(|s| Duration::try_from_secs_f64(s).ok())
    .map_or(DEFAULT_RETRY_AFTER, |wait| wait.min(MAX_RETRY_AFTER))
}

/// Decode a response body into a page of `T`.
///
/// Rows that fail to deserialize are skipped with a warning rather than
/// failing the whole page.
pub fn decode_page<T: DeserializeOwned>(body: &[u8]) -> Result<Page<T>, ApiError> {
  let envelope: ResponseEnvelope =
    serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;

  if envelope.status.as_deref() == Some("error") {
    let code = envelope.code.as_ref().and_then(parse_code).unwrap_or(0);
    if code == RATE_LIMIT_CODE {
      return Err(ApiError::RateLimited {
        retry_after: retry_after_from_secs(envelope.meta.retry_after),
      });
    }
    return Err(ApiError::Server {
      code,
      message: envelope.message.unwrap_or_else(|| "unknown error".to_string()),
    });
  }

  let data = envelope
    .data
    .ok_or_else(|| ApiError::Decode("response has no data array".to_string()))?;
  let received = data.len();

  let mut rows = Vec::with_capacity(received);
  let mut malformed = 0usize;
  for value in data {
    match serde_json::from_value::<T>(value) {
      Ok(row) => rows.push(row),
      Err(e) => {
        malformed += 1;
        if malformed == 1 {
          warn!(error = %e, "Skipping malformed row");
        }
      }
    }
  }
  if malformed > 1 {
    warn!(malformed, "Skipped malformed rows in page");
  }

  Ok(Page {
    rows,
    received,
    total: envelope.meta.total.map(|t| t as usize),
    cached: envelope.meta.cached,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::layers::{EquipmentRecord, PartnerRecord};

  #[test]
  fn test_decode_success_page() {
    let body = br#"{
      "status": "success",
      "meta": {"count": 2, "total": 12000, "cached": true},
      "data": [
        {"electroId": "A01516", "address": "Rua A", "latitude": "-23.5", "longitude": -46.6},
        {"electroId": 42, "stopId": "S9"}
      ]
    }"#;

    let page: Page<EquipmentRecord> = decode_page(body).unwrap();
    assert_eq!(page.received, 2);
    assert_eq!(page.total, Some(12000));
    assert!(page.cached);
    assert_eq!(page.rows[1].electro_id.as_deref(), Some("42"));
  }

  #[test]
  fn test_in_body_rate_limit() {
    let body = br#"{"status":"error","code":429,"message":"slow down","meta":{"retryAfter":2}}"#;
    let err = decode_page::<EquipmentRecord>(body).unwrap_err();
    assert_eq!(
      err,
      ApiError::RateLimited {
        retry_after: Duration::from_secs(2)
      }
    );
  }

  #[test]
  fn test_rate_limit_without_hint_uses_default() {
    let body = br#"{"status":"error","code":"429"}"#;
    let err = decode_page::<EquipmentRecord>(body).unwrap_err();
    assert_eq!(
      err,
      ApiError::RateLimited {
        retry_after: DEFAULT_RETRY_AFTER
      }
    );
  }

  #[test]
  fn test_huge_retry_hint_is_capped() {
    let body = br#"{"status":"error","code":429,"meta":{"retryAfter":1e30}}"#;
    let err = decode_page::<EquipmentRecord>(body).unwrap_err();
    assert_eq!(
      err,
      ApiError::RateLimited {
        retry_after: MAX_RETRY_AFTER
      }
    );

    assert_eq!(retry_after_from_secs(Some(f64::INFINITY)), DEFAULT_RETRY_AFTER);
    assert_eq!(retry_after_from_secs(Some(-3.0)), DEFAULT_RETRY_AFTER);
    assert_eq!(
      retry_after_from_secs(Some(0.25)),
      Duration::from_millis(250)
    );
  }

  #[test]
  fn test_server_error() {
    let body = br#"{"status":"error","code":500,"message":"boom"}"#;
    let err = decode_page::<EquipmentRecord>(body).unwrap_err();
    assert_eq!(
      err,
      ApiError::Server {
        code: 500,
        message: "boom".into()
      }
    );
  }

  #[test]
  fn test_malformed_rows_are_skipped_but_counted() {
    let body = br#"{"status":"success","meta":{"total":3},"data":[
      {"stopId":"S1","enabled":true,"client":"claro"},
      "not an object",
      {"stopId":"S2","enabled":false}
    ]}"#;

    let page: Page<PartnerRecord> = decode_page(body).unwrap();
    assert_eq!(page.rows.len(), 2);
    assert_eq!(page.received, 3);
  }

  #[test]
  fn test_garbage_body_is_decode_error() {
    let err = decode_page::<EquipmentRecord>(b"<html>").unwrap_err();
    assert!(matches!(err, ApiError::Decode(_)));
  }
}
