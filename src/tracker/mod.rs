//! Cache-aware access to the job-application tracker's documents.

mod data;

pub use data::{PreloadReport, TrackerData};

/// Document field holding the owning user's uid.
pub const OWNER_FIELD: &str = "userId";
/// Creation timestamp (RFC 3339, UTC). Lists are ordered newest first on it.
pub const CREATED_FIELD: &str = "createdAt";
pub const UPDATED_FIELD: &str = "updatedAt";
