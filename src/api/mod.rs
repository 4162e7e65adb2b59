//! Inventory API access.
//!
//! - `client`: the `LayerSource` seam and its HTTP implementation
//! - `types`: response envelope decoding
//! - `error`: typed API failures, including rate limiting

mod client;
mod error;
mod types;

pub use client::{HttpLayerSource, LayerSource};
pub use error::ApiError;
pub use types::{decode_page, retry_after_from_secs, Page, DEFAULT_RETRY_AFTER, MAX_RETRY_AFTER};
