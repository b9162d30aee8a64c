//! Client-side data cache for tracker documents.
//!
//! This module provides a memory-only caching mechanism that:
//! - Stores values per key with a TTL and lazy expiry
//! - Coalesces concurrent fetches for one key onto a single execution
//! - Serves stale entries while refreshing them in the background
//! - Scopes keys by owner so a user's data can be dropped in one call

mod coalesce;
pub mod key;
mod layer;
mod policy;
mod storage;
mod traits;

pub use key::{CacheKey, EntityKind, OwnerScope};
pub use layer::{CacheStats, DataCache};
pub use policy::TtlPolicy;
pub use traits::{CacheResult, CacheSource, CacheValue};
