//! Client-side caching, request de-duplication and cursor pagination for the
//! job-application tracker's document store.
//!
//! [`cache::DataCache`] is the core: a TTL cache with coalesced fetches and
//! stale-while-revalidate refresh. [`paging::Paginator`] pages through
//! owner-scoped collections on top of it, and [`tracker::TrackerData`] is the
//! read/write facade that keeps both consistent with the store.

pub mod cache;
pub mod config;
pub mod error;
pub mod paging;
pub mod store;
pub mod tracker;

pub use error::{CacheError, Result};
