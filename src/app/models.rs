//! Shared data types
//!
//! Core value types passed between the coordinator, downloader, and
//! cache index.

use serde::{Deserialize, Serialize};

/// Conditional-request validator captured from an origin response.
///
/// Holds the `ETag` and `Last-Modified` header values verbatim. Either
/// field alone makes a response cacheable; both empty means the origin
/// gave us nothing to revalidate with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachingInfo {
    /// `ETag` response header value, empty if absent
    pub etag: String,
    /// `Last-Modified` response header value, empty if absent
    pub last_modified: String,
}

impl CachingInfo {
    /// A response is cacheable when it carried at least one validator.
    pub fn is_cacheable(&self) -> bool {
        !self.etag.is_empty() || !self.last_modified.is_empty()
    }
}
