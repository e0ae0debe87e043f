//! Cache entry metadata and the pluggable key/value store behind the loader.

mod attributes;
mod backend;

pub use attributes::CacheEntryAttributes;
pub(crate) use attributes::header_date_millis;
pub use backend::{CacheBackend, InMemoryCache};

/// How long an entry stays fresh when the origin sent no explicit expiry.
pub const DEFAULT_EXPIRE_TIME: u64 = 1000 * 60 * 60 * 24 * 7; // 7 days

/// Upper bound applied to server-provided expiry values. Origins frequently
/// send implausibly far-future `Expires` headers.
pub const EXPIRE_TIME_SERVER_LIMIT: u64 = 1000 * 60 * 60 * 24 * 28; // 4 weeks

/// Entries whose origin copy is older than this are never served, not even as
/// a stale fallback after a failed refresh.
pub const ABSOLUTE_EXPIRE_TIME_LIMIT: u64 = 1000 * 60 * 60 * 24 * 365; // 1 year

/// Response code recorded when the transport failed before producing a status
/// line.
pub const TRANSPORT_ERROR_CODE: u16 = 499;
