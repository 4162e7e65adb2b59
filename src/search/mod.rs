//! In-memory search over the unified dataset.

mod debounce;
mod engine;

pub use debounce::DebouncedSearch;
pub use engine::{search, SearchField, SearchHit, SearchResults};
