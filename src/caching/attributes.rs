use std::time::UNIX_EPOCH;

use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, ETAG, EXPIRES};
use serde::{Deserialize, Serialize};

use super::{ABSOLUTE_EXPIRE_TIME_LIMIT, DEFAULT_EXPIRE_TIME, EXPIRE_TIME_SERVER_LIMIT};

/// Metadata stored next to a cached object.
///
/// All timestamps are milliseconds since the Unix epoch. A zero
/// `expiration_time` means the origin did not communicate an expiry; freshness
/// then falls back to the age of the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryAttributes {
    /// When the entry was stored. Stamped by the backend at put.
    pub create_time: u64,
    /// When the origin copy was last observed (the job's clock at response
    /// time, not the origin's `Last-Modified` value).
    pub last_modification: u64,
    /// Absolute expiry communicated by the origin, or `0` if unknown.
    pub expiration_time: u64,
    /// The origin's entity tag, if it sent one.
    pub etag: Option<String>,
    /// HTTP status of the response that produced this entry. `499` stands in
    /// for a transport failure that never reached a status line.
    pub response_code: u16,
    /// Human-readable failure detail, if the fetch did not complete cleanly.
    pub error_message: Option<String>,
}

impl CacheEntryAttributes {
    /// Builds attributes from the headers of a received response.
    ///
    /// The expiry is taken from `Expires` when present, otherwise from the
    /// first `max-age` token of `Cache-Control`. Malformed values are ignored.
    /// The response code is filled in by the caller once redirects and
    /// backoff have been resolved.
    pub fn parse_response_headers(headers: &HeaderMap, now: u64) -> Self {
        let mut expiration_time = header_date_millis(headers.get(EXPIRES)).unwrap_or(0);

        if expiration_time == 0 {
            if let Some(max_age) = parse_max_age(headers.get(CACHE_CONTROL)) {
                expiration_time = max_age.saturating_mul(1000).saturating_add(now);
            }
        }

        CacheEntryAttributes {
            create_time: 0,
            last_modification: now,
            expiration_time,
            etag: headers
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            response_code: 0,
            error_message: None,
        }
    }

    /// The expiry used in freshness decisions: the origin's value, clamped to
    /// [`EXPIRE_TIME_SERVER_LIMIT`] past entry creation.
    pub fn effective_expiration(&self) -> u64 {
        self.expiration_time
            .min(self.create_time.saturating_add(EXPIRE_TIME_SERVER_LIMIT))
    }

    /// Decides whether the entry can be served without revalidation.
    ///
    /// An origin-provided expiry wins when present; otherwise the entry stays
    /// fresh for [`DEFAULT_EXPIRE_TIME`] past the last observation of the
    /// origin copy, or past its creation when no observation was recorded.
    pub fn is_fresh(&self, now: u64) -> bool {
        if self.expiration_time != 0 {
            now <= self.effective_expiration()
        } else if self.last_modification > 0 {
            now.saturating_sub(self.last_modification) <= DEFAULT_EXPIRE_TIME
        } else {
            now.saturating_sub(self.create_time) <= DEFAULT_EXPIRE_TIME
        }
    }

    /// Whether the origin copy is recent enough to be used at all. Entries
    /// beyond this age are dropped rather than served stale or revalidated.
    pub fn within_absolute_limit(&self, now: u64) -> bool {
        now.saturating_sub(self.last_modification) <= ABSOLUTE_EXPIRE_TIME_LIMIT
    }

    /// Prepares the attributes for storage: stamps `create_time` when unset
    /// and clamps a nonzero expiry to [`EXPIRE_TIME_SERVER_LIMIT`] past
    /// creation. Backends call this from `put`.
    pub fn finalize_for_store(&mut self, now: u64) {
        if self.create_time == 0 {
            self.create_time = now;
        }
        if self.expiration_time != 0 {
            self.expiration_time = self.effective_expiration();
        }
    }
}

/// Parses an HTTP date header into milliseconds since the Unix epoch.
pub(crate) fn header_date_millis(value: Option<&HeaderValue>) -> Option<u64> {
    let date = httpdate::parse_http_date(value?.to_str().ok()?).ok()?;
    let since_epoch = date.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as u64)
}

/// Extracts the first `max-age` value (in seconds) from a `Cache-Control`
/// header, skipping tokens that do not parse.
fn parse_max_age(value: Option<&HeaderValue>) -> Option<u64> {
    let value = value?.to_str().ok()?;
    for token in value.split(',') {
        if let Some(seconds) = token.trim().strip_prefix("max-age=") {
            if let Ok(seconds) = seconds.parse::<u64>() {
                return Some(seconds);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use reqwest::header::LAST_MODIFIED;

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    #[test]
    fn fresh_until_explicit_expiry() {
        let attributes = CacheEntryAttributes {
            create_time: 1000,
            expiration_time: 10_000,
            ..Default::default()
        };

        assert!(attributes.is_fresh(5000));
        assert!(attributes.is_fresh(10_000));
        assert!(!attributes.is_fresh(10_001));
    }

    #[test]
    fn freshness_is_monotonic_in_time() {
        let attributes = CacheEntryAttributes {
            create_time: 1000,
            expiration_time: 10_000,
            ..Default::default()
        };

        for now in (0..=10_000).step_by(500) {
            assert!(attributes.is_fresh(now), "not fresh at {now}");
        }
    }

    #[test]
    fn implausible_expiry_is_clamped() {
        let attributes = CacheEntryAttributes {
            create_time: 1000,
            expiration_time: u64::MAX,
            ..Default::default()
        };

        assert_eq!(
            attributes.effective_expiration(),
            1000 + EXPIRE_TIME_SERVER_LIMIT
        );
        assert!(!attributes.is_fresh(1001 + EXPIRE_TIME_SERVER_LIMIT));
    }

    #[test]
    fn falls_back_to_last_modification_age() {
        let attributes = CacheEntryAttributes {
            create_time: 0,
            last_modification: 1000,
            ..Default::default()
        };

        assert!(attributes.is_fresh(1000 + DEFAULT_EXPIRE_TIME));
        assert!(!attributes.is_fresh(1001 + DEFAULT_EXPIRE_TIME));
    }

    #[test]
    fn falls_back_to_creation_age() {
        let attributes = CacheEntryAttributes {
            create_time: 1000,
            last_modification: 0,
            ..Default::default()
        };

        assert!(attributes.is_fresh(1000 + DEFAULT_EXPIRE_TIME));
        assert!(!attributes.is_fresh(1001 + DEFAULT_EXPIRE_TIME));
    }

    #[test]
    fn parses_expires_header() {
        let headers = headers(&[
            ("Expires", "Wed, 21 Oct 2015 07:28:00 GMT"),
            ("ETag", "\"abc\""),
        ]);
        let attributes = CacheEntryAttributes::parse_response_headers(&headers, 42);

        assert_eq!(attributes.expiration_time, 1_445_412_480_000);
        assert_eq!(attributes.last_modification, 42);
        assert_eq!(attributes.etag.as_deref(), Some("\"abc\""));
    }

    #[test]
    fn max_age_applies_when_expires_is_absent() {
        let headers = headers(&[("Cache-Control", "public, max-age=300, immutable")]);
        let attributes = CacheEntryAttributes::parse_response_headers(&headers, 1000);

        assert_eq!(attributes.expiration_time, 300 * 1000 + 1000);
    }

    #[test]
    fn first_max_age_token_wins() {
        let headers = headers(&[("Cache-Control", "max-age=10, max-age=99999")]);
        let attributes = CacheEntryAttributes::parse_response_headers(&headers, 0);

        assert_eq!(attributes.expiration_time, 10_000);
    }

    #[test]
    fn malformed_max_age_is_ignored() {
        let headers = headers(&[("Cache-Control", "max-age=soon")]);
        let attributes = CacheEntryAttributes::parse_response_headers(&headers, 1000);

        assert_eq!(attributes.expiration_time, 0);
    }

    #[test]
    fn parse_then_reparse_is_stable() {
        let headers = headers(&[
            ("Expires", "Wed, 21 Oct 2015 07:28:00 GMT"),
            ("ETag", "\"v1\""),
        ]);
        let first = CacheEntryAttributes::parse_response_headers(&headers, 7);
        let second = CacheEntryAttributes::parse_response_headers(&headers, 7);

        assert_eq!(first, second);
    }

    #[test]
    fn absolute_limit_cuts_off_ancient_entries() {
        let attributes = CacheEntryAttributes {
            last_modification: 1000,
            ..Default::default()
        };

        assert!(attributes.within_absolute_limit(1000 + ABSOLUTE_EXPIRE_TIME_LIMIT));
        assert!(!attributes.within_absolute_limit(1001 + ABSOLUTE_EXPIRE_TIME_LIMIT));
    }

    #[test]
    fn finalize_stamps_creation_and_clamps() {
        let mut attributes = CacheEntryAttributes {
            expiration_time: u64::MAX,
            ..Default::default()
        };
        attributes.finalize_for_store(5000);

        assert_eq!(attributes.create_time, 5000);
        assert_eq!(attributes.expiration_time, 5000 + EXPIRE_TIME_SERVER_LIMIT);

        // An explicit create_time (e.g. from a backend restore) is kept.
        let mut attributes = CacheEntryAttributes {
            create_time: 77,
            ..Default::default()
        };
        attributes.finalize_for_store(5000);
        assert_eq!(attributes.create_time, 77);
        assert_eq!(attributes.expiration_time, 0);
    }

    #[test]
    fn last_modified_header_parses_to_millis() {
        let headers = headers(&[("Last-Modified", "Thu, 01 Jan 1970 00:00:10 GMT")]);
        assert_eq!(header_date_millis(headers.get(LAST_MODIFIED)), Some(10_000));
    }
}
