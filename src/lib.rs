//! A concurrent, revalidating HTTP object cache.
//!
//! `tilecache` fetches small binary artifacts (map tiles, attribution blobs)
//! over HTTP and keeps them in a pluggable [`CacheBackend`]. Entries carry the
//! validators the origin sent (`Expires`, `Cache-Control: max-age`,
//! `Last-Modified`, `ETag`) and are revalidated with conditional requests when
//! they go stale. Origins that answer conditional requests with a full `200`
//! despite unchanged validators are remembered and probed with `HEAD` instead.
//!
//! Concurrent submissions for the same URL are coalesced: a single job
//! performs the network round trip while every submitted listener is notified
//! with the shared outcome. Jobs run on a bounded worker pool whose queue is
//! drained newest-first, so the most recently requested artifacts (the ones a
//! user is most likely still waiting for) load first.

pub mod caching;
pub mod config;
pub mod download;
pub mod loader;
pub mod logging;
mod utils;


pub use crate::caching::{CacheBackend, CacheEntryAttributes, InMemoryCache};
pub use crate::config::Config;
pub use crate::loader::{
    ByteObject, CacheObject, CachedLoaderJob, LoadListener, LoadResult, LoaderContext,
    LoaderRequest, SubmitError,
};
