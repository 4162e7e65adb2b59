use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::LayerRecord;
use crate::config::ApiConfig;

use super::error::ApiError;
use super::types::{decode_page, retry_after_from_secs, Page};

/// Source of layer pages.
///
/// `HttpLayerSource` talks to the real API; tests substitute an in-process
/// fake.
pub trait LayerSource: Send + Sync {
  /// Fetch `limit` rows of `T`'s layer starting at `offset`.
  fn fetch<T: LayerRecord>(
    &self,
    offset: usize,
    limit: usize,
    query: Option<&str>,
  ) -> impl Future<Output = Result<Page<T>, ApiError>> + Send;
}

/// Inventory API client
#[derive(Clone)]
pub struct HttpLayerSource {
  client: reqwest::Client,
  base: Url,
}

impl HttpLayerSource {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid API url {}: {}", config.url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }
}

impl LayerSource for HttpLayerSource {
  async fn fetch<T: LayerRecord>(
    &self,
    offset: usize,
    limit: usize,
    query: Option<&str>,
  ) -> Result<Page<T>, ApiError> {
    let layer = T::LAYER;
    let mut params = vec![
      ("layer", layer.as_str().to_string()),
      ("start", offset.to_string()),
      ("limit", limit.to_string()),
      ("docs", "false".to_string()),
    ];
    if let Some(q) = query.filter(|q| !q.is_empty()) {
      params.push(("q", q.to_string()));
    }

    debug!(%layer, offset, limit, "Fetching page");

    let response = self
      .client
      .get(self.base.clone())
      .query(&params)
      .send()
      .await?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
      let secs = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok());
      return Err(ApiError::RateLimited {
        retry_after: retry_after_from_secs(secs),
      });
    }
    if !status.is_success() {
      return Err(ApiError::Http {
        status: status.as_u16(),
      });
    }

    let body = response.bytes().await?;
    decode_page(&body)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rejects_invalid_url() {
    let config = ApiConfig {
      url: "not a url".into(),
      ..Default::default()
    };
    assert!(HttpLayerSource::new(&config).is_err());
  }
}
