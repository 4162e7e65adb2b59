use std::time::Duration;
use thiserror::Error;

/// Failure talking to the inventory API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
  #[error("Request failed: {0}")]
  Transport(String),

  #[error("Server responded with HTTP {status}")]
  Http { status: u16 },

  #[error("API error {code}: {message}")]
  Server { code: i64, message: String },

  #[error("Failed to decode response: {0}")]
  Decode(String),

  /// The server asked us to back off. `retry_after` is its advised wait.
  #[error("Rate limited, retry after {}ms", retry_after.as_millis())]
  RateLimited { retry_after: Duration },
}

impl ApiError {
  pub fn is_rate_limited(&self) -> bool {
    matches!(self, ApiError::RateLimited { .. })
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(e: reqwest::Error) -> Self {
    match e.status() {
      Some(status) => ApiError::Http {
        status: status.as_u16(),
      },
      None => ApiError::Transport(e.to_string()),
    }
  }
}
