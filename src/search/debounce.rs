//! Debounced search over the live dataset.
//!
//! `search()` (re)arms a short timer; when it fires, the query runs on a
//! background task and the result comes back over a channel tagged with the
//! generation of the request that produced it. `poll()` drops anything that
//! is not for the most recent request, so a slow superseded search can never
//! overwrite a fresher one, even when the query text repeats.
//!
//! ```ignore
//! let mut search = DebouncedSearch::from_config(dataset.clone(), &config.search);
//! search.search("A015");
//!
//! // In event loop tick
//! if search.poll() {
//!     render(search.results());
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::engine::{search, SearchResults};
use crate::config::SearchConfig;
use crate::layers::UnifiedEntity;

type Dataset = Arc<Vec<UnifiedEntity>>;

pub struct DebouncedSearch {
  dataset: Dataset,
  delay: Duration,
  max_results: usize,
  /// Bumped by every `search()` call
  generation: u64,
  /// Query the caller most recently asked for
  latest: Option<String>,
  /// Results for the current generation
  current: Option<SearchResults>,
  sender: mpsc::UnboundedSender<(u64, SearchResults)>,
  receiver: mpsc::UnboundedReceiver<(u64, SearchResults)>,
  pending: Option<JoinHandle<()>>,
}

impl DebouncedSearch {
  pub fn new(dataset: Dataset, delay: Duration, max_results: usize) -> Self {
    let (sender, receiver) = mpsc::unbounded_channel();
    Self {
      dataset,
      delay,
      max_results,
      generation: 0,
      latest: None,
      current: None,
      sender,
      receiver,
      pending: None,
    }
  }

  pub fn from_config(dataset: Dataset, config: &SearchConfig) -> Self {
    Self::new(
      dataset,
      Duration::from_millis(config.debounce_ms),
      config.max_results,
    )
  }

  /// Swap in a newer snapshot. Applies to searches started after this call.
  pub fn set_dataset(&mut self, dataset: Dataset) {
    self.dataset = dataset;
  }

  /// Schedule `query`, cancelling a search that has not started yet.
  pub fn search(&mut self, query: impl Into<String>) {
    let query = query.into();
    if let Some(handle) = self.pending.take() {
      handle.abort();
    }
    self.generation += 1;
    self.latest = Some(query.clone());
    self.current = None;

    let generation = self.generation;
    let dataset = self.dataset.clone();
    let delay = self.delay;
    let max_results = self.max_results;
    let tx = self.sender.clone();
    self.pending = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let results = search(&dataset, &query, max_results);
      // Ignore send errors - the receiver lives as long as self
      let _ = tx.send((generation, results));
    }));
  }

  /// Drain finished searches. Returns `true` when fresh results arrived.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok((generation, results)) = self.receiver.try_recv() {
      if generation == self.generation {
        self.current = Some(results);
        changed = true;
      }
    }
    changed
  }

  /// Results for the latest query, once they have arrived.
  pub fn results(&self) -> Option<&SearchResults> {
    self.current.as_ref()
  }

  /// The most recently requested query
  pub fn query(&self) -> Option<&str> {
    self.latest.as_deref()
  }

  pub fn is_pending(&self) -> bool {
    self.latest.is_some() && self.results().is_none()
  }
}

impl Drop for DebouncedSearch {
  fn drop(&mut self) {
    if let Some(handle) = self.pending.take() {
      handle.abort();
    }
  }
}
