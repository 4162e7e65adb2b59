//! Layered synchronization and caching engine for a street furniture
//! inventory.
//!
//! Data flows `sync` → `cache` (persist) → `layers` (stack) → unified
//! dataset → `search` and `map` (markers, clustering).

pub mod api;
pub mod cache;
pub mod config;
pub mod layers;
pub mod logging;
pub mod map;
pub mod search;
pub mod sync;
