//! The conditional-fetch protocol against remote origins.
//!
//! One [`Fetcher::fetch`] call performs the whole network interaction of a
//! job: an optional `HEAD` probe for origins known to ignore conditional
//! requests, a conditional `GET` carrying `If-Modified-Since` /
//! `If-None-Match`, a capped redirect chain, and polite backoff on `503`.

use std::collections::BTreeMap;
use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use rand::Rng;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, LOCATION,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use thiserror::Error;

use crate::caching::{header_date_millis, CacheEntryAttributes, TRANSPORT_ERROR_CODE};
use crate::config::Config;
use crate::loader::{LoaderRequest, OriginProfile};

mod client;

pub use client::{create_client, DownloadTimeouts};

/// Sent with every request unless overridden by configured headers.
const DEFAULT_ACCEPT: &str = "text/html, image/png, image/jpeg, image/gif, */*";

/// How many `302` responses are followed before giving up on the chain.
const MAX_REDIRECTS: usize = 5;

/// How many responses are observed before a fetch is abandoned. Relevant for
/// origins answering `503`.
const MAX_RESPONSE_ATTEMPTS: usize = 5;

/// Base delay before retrying after a `503`; an equally sized random jitter
/// is added on top.
const UNAVAILABLE_BACKOFF: Duration = Duration::from_millis(5000);

/// What a fetch produced, and what the job should do with the cache.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The cached object is still valid; nothing was transferred and the
    /// stored entry stays as it is.
    NotModified,
    /// A response was consumed. Store `body` (empty for a negatively cached
    /// result) together with the new attributes.
    Store {
        body: Bytes,
        attributes: CacheEntryAttributes,
    },
    /// The fetch failed and the cache was left untouched. The attributes
    /// carry the response code and error detail for the listeners.
    Failed { attributes: CacheEntryAttributes },
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid redirect location: {0}")]
    InvalidRedirect(String),
}

/// Executes the conditional-GET / HEAD-probe protocol for the loader.
#[derive(Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    headers: BTreeMap<String, String>,
    pub(crate) backoff_base: Duration,
}

impl Fetcher {
    pub fn new(config: &Config) -> Self {
        Fetcher {
            client: create_client(&DownloadTimeouts::from_config(config)),
            headers: config.headers.clone(),
            backoff_base: UNAVAILABLE_BACKOFF,
        }
    }

    /// Runs one network interaction for `url`.
    ///
    /// `cached` carries the attributes of a loadable cached entry, if one
    /// exists; it drives conditional headers and the HEAD shortcut. `now` is
    /// the job's clock and becomes the `last_modification` of any stored
    /// attributes. `force` additionally disables intermediary caching.
    pub async fn fetch<R: LoaderRequest>(
        &self,
        request: &R,
        url: &Url,
        cached: Option<&CacheEntryAttributes>,
        force: bool,
        now: u64,
        origins: &OriginProfile,
    ) -> FetchOutcome {
        let host = request.server_key(url);

        // Origins that answer conditional requests with a full 200 are
        // checked with a cheap HEAD probe instead.
        if let Some(attributes) = cached {
            if origins.needs_head_probe(&host) {
                match self.cache_valid_using_head(url, attributes, force).await {
                    Ok(true) => {
                        tracing::debug!(%url, "cache entry verified with HEAD probe");
                        return FetchOutcome::NotModified;
                    }
                    Ok(false) => {}
                    Err(error) => return self.transport_failure(request, cached, error),
                }
            }
        }

        let mut response = match self.open_conditional_get(url, cached, force, now).await {
            Ok(response) => response,
            Err(error) => return self.transport_failure(request, cached, error),
        };

        tracing::info!("GET {} -> {}", url, response.status());

        if response.status() == StatusCode::NOT_MODIFIED {
            tracing::debug!(%url, "conditional request: local version is up to date");
            return FetchOutcome::NotModified;
        }

        // No 304 even though the validators match: remember that this origin
        // does not honor conditional requests.
        if let Some(attributes) = cached {
            let etag_unchanged = attributes.etag.is_some()
                && attributes.etag.as_deref() == header_str(response.headers(), &ETAG);
            let modification_unchanged = attributes.last_modification
                == header_date_millis(response.headers().get(LAST_MODIFIED)).unwrap_or(0);
            if (etag_unchanged || modification_unchanged) && origins.mark_head_only(&host) {
                tracing::info!(
                    host = %host,
                    "origin does not return 304 for matching validators, switching to HEAD probes"
                );
            }
        }

        let mut attributes = CacheEntryAttributes::parse_response_headers(response.headers(), now);

        for attempt in 1..=MAX_RESPONSE_ATTEMPTS {
            if response.status() == StatusCode::SERVICE_UNAVAILABLE {
                tokio::time::sleep(self.backoff_delay()).await;
                if attempt == MAX_RESPONSE_ATTEMPTS {
                    break;
                }
                // Reopen a fresh request; the previous response is spent.
                response = match self.open_plain_get(url, force).await {
                    Ok(response) => response,
                    Err(error) => return self.transport_failure(request, cached, error),
                };
                attributes = CacheEntryAttributes::parse_response_headers(response.headers(), now);
                continue;
            }

            attributes.response_code = response.status().as_u16();
            let headers = response.headers().clone();
            let body = if response.status() == StatusCode::OK {
                match response.bytes().await {
                    Ok(body) => body,
                    Err(error) => return self.transport_failure(request, cached, error.into()),
                }
            } else {
                Bytes::new()
            };

            return if request.is_response_loadable(Some(&headers), attributes.response_code, &body)
            {
                tracing::debug!(%url, bytes = body.len(), "downloaded object");
                FetchOutcome::Store { body, attributes }
            } else if request.cache_as_empty(&attributes) {
                tracing::debug!(%url, "caching empty object");
                FetchOutcome::Store {
                    body: Bytes::new(),
                    attributes,
                }
            } else {
                tracing::debug!(%url, "response is neither loadable nor cacheable as empty");
                FetchOutcome::Failed { attributes }
            };
        }

        tracing::warn!(%url, "giving up after repeated 503 responses");
        attributes.response_code = StatusCode::SERVICE_UNAVAILABLE.as_u16();
        attributes.error_message = Some("giving up after repeated 503 responses".to_owned());
        FetchOutcome::Failed { attributes }
    }

    /// Opens the initial GET carrying the conditional headers derived from
    /// the cached attributes, then resolves redirects.
    async fn open_conditional_get(
        &self,
        url: &Url,
        cached: Option<&CacheEntryAttributes>,
        force: bool,
        now: u64,
    ) -> Result<Response, FetchError> {
        let mut builder = self.prepare(Method::GET, url.clone(), force);

        if let Some(attributes) = cached {
            if attributes.within_absolute_limit(now) {
                let modified = UNIX_EPOCH + Duration::from_millis(attributes.last_modification);
                builder = builder.header(IF_MODIFIED_SINCE, httpdate::fmt_http_date(modified));
            }
            if let Some(etag) = &attributes.etag {
                builder = builder.header(IF_NONE_MATCH, etag);
            }
        }

        let response = builder.send().await?;
        self.follow_redirects(response, Method::GET, force).await
    }

    /// Opens a GET without conditional headers, then resolves redirects.
    async fn open_plain_get(&self, url: &Url, force: bool) -> Result<Response, FetchError> {
        let response = self.prepare(Method::GET, url.clone(), force).send().await?;
        self.follow_redirects(response, Method::GET, force).await
    }

    /// Applies the default `Accept` header, configured extra headers, and the
    /// cache bypass for forced loads. Configured headers override the
    /// defaults.
    fn prepare(&self, method: Method, url: Url, force: bool) -> RequestBuilder {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes());
            let value = HeaderValue::from_str(value);
            if let (Ok(name), Ok(value)) = (name, value) {
                headers.insert(name, value);
            }
        }
        if force {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }
        self.client.request(method, url).headers(headers)
    }

    /// Follows up to [`MAX_REDIRECTS`] `302` responses by reopening against
    /// the `Location` target. The chain ends at the first other status.
    async fn follow_redirects(
        &self,
        mut response: Response,
        method: Method,
        force: bool,
    ) -> Result<Response, FetchError> {
        for _ in 0..MAX_REDIRECTS {
            if response.status() != StatusCode::FOUND {
                break;
            }
            let target = header_str(response.headers(), &LOCATION)
                .ok_or_else(|| FetchError::InvalidRedirect("missing Location header".into()))?;
            let target = response
                .url()
                .join(target)
                .map_err(|error| FetchError::InvalidRedirect(error.to_string()))?;
            tracing::debug!(%target, "following redirect");
            response = self.prepare(method.clone(), target, force).send().await?;
        }
        Ok(response)
    }

    /// Checks whether the cached entry is still valid without downloading the
    /// body. Valid when the origin reports the same entity tag, or a
    /// `Last-Modified` no newer than our copy.
    async fn cache_valid_using_head(
        &self,
        url: &Url,
        attributes: &CacheEntryAttributes,
        force: bool,
    ) -> Result<bool, FetchError> {
        let response = self.prepare(Method::HEAD, url.clone(), force).send().await?;
        let response = self.follow_redirects(response, Method::HEAD, force).await?;

        let etag_matches = attributes.etag.is_some()
            && attributes.etag.as_deref() == header_str(response.headers(), &ETAG);
        let last_modified = header_date_millis(response.headers().get(LAST_MODIFIED)).unwrap_or(0);

        Ok(etag_matches || (last_modified != 0 && last_modified <= attributes.last_modification))
    }

    /// The connection never produced a usable response.
    ///
    /// The attributes record the pseudo status `499` and the error text. A
    /// loadable cached entry must survive this, so with one present the fetch
    /// reports failure and leaves stale serving to the job; otherwise the
    /// failure is negatively cached when the request's predicates permit.
    fn transport_failure<R: LoaderRequest>(
        &self,
        request: &R,
        cached: Option<&CacheEntryAttributes>,
        error: FetchError,
    ) -> FetchOutcome {
        tracing::debug!(error = %error, "transport error during fetch");

        let mut attributes = cached.cloned().unwrap_or_default();
        attributes.response_code = TRANSPORT_ERROR_CODE;
        attributes.error_message = Some(error.to_string());

        if cached.is_some() {
            return FetchOutcome::Failed { attributes };
        }

        if request.is_response_loadable(None, TRANSPORT_ERROR_CODE, &[])
            || request.cache_as_empty(&attributes)
        {
            FetchOutcome::Store {
                body: Bytes::new(),
                attributes,
            }
        } else {
            FetchOutcome::Failed { attributes }
        }
    }

    fn backoff_delay(&self) -> Duration {
        let base = self.backoff_base.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..base.max(1));
        self.backoff_base + Duration::from_millis(jitter)
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &HeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test;

    #[derive(Clone)]
    struct PlainRequest {
        url: Url,
    }

    impl LoaderRequest for PlainRequest {
        type Key = String;
        type Object = crate::loader::ByteObject;

        fn url(&self) -> Option<Url> {
            Some(self.url.clone())
        }

        fn cache_key(&self) -> String {
            self.url.to_string()
        }

        fn create_object(&self, content: Bytes) -> Self::Object {
            crate::loader::ByteObject::new(content)
        }
    }

    fn fetcher() -> Fetcher {
        let mut fetcher = Fetcher::new(&Config::default());
        fetcher.backoff_base = Duration::from_millis(10);
        fetcher
    }

    #[tokio::test]
    async fn downloads_body_and_attributes() {
        test::setup();

        let server = test::Server::new();
        let url = server.url("/etag/v1/data/hello");
        let request = PlainRequest { url: url.clone() };

        let outcome = fetcher()
            .fetch(&request, &url, None, false, 1000, &OriginProfile::default())
            .await;

        match outcome {
            FetchOutcome::Store { body, attributes } => {
                assert_eq!(&body[..], b"hello");
                assert_eq!(attributes.response_code, 200);
                assert_eq!(attributes.etag.as_deref(), Some("\"v1\""));
                assert_eq!(attributes.last_modification, 1000);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn revalidates_with_matching_etag() {
        test::setup();

        let server = test::Server::new();
        let url = server.url("/etag/v1/data/hello");
        let request = PlainRequest { url: url.clone() };
        let cached = CacheEntryAttributes {
            etag: Some("\"v1\"".to_owned()),
            last_modification: 500,
            ..Default::default()
        };

        let outcome = fetcher()
            .fetch(
                &request,
                &url,
                Some(&cached),
                false,
                1000,
                &OriginProfile::default(),
            )
            .await;

        assert!(matches!(outcome, FetchOutcome::NotModified));
    }

    #[tokio::test]
    async fn follows_redirect_chain_to_payload() {
        test::setup();

        let server = test::Server::new();
        let url = server.url("/redirect/redirect/data/payload");
        let request = PlainRequest { url: url.clone() };

        let outcome = fetcher()
            .fetch(&request, &url, None, false, 1000, &OriginProfile::default())
            .await;

        match outcome {
            FetchOutcome::Store { body, .. } => assert_eq!(&body[..], b"payload"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(server.accesses(), 3);
    }

    #[tokio::test]
    async fn redirect_cycle_ends_at_the_last_response() {
        test::setup();

        let server = test::Server::new();
        let url = server.url("/loop/here");
        let request = PlainRequest { url: url.clone() };

        let outcome = fetcher()
            .fetch(&request, &url, None, false, 1000, &OriginProfile::default())
            .await;

        // The sixth 302 is treated as the final response: not loadable, but
        // below 500, so it is cached as an empty object.
        match outcome {
            FetchOutcome::Store { body, attributes } => {
                assert!(body.is_empty());
                assert_eq!(attributes.response_code, 302);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(server.accesses(), 6);
    }

    #[tokio::test]
    async fn recovers_after_intermittent_503() {
        test::setup();

        let server = test::Server::new();
        let url = server.url("/eventually/2/ok");
        let request = PlainRequest { url: url.clone() };

        let outcome = fetcher()
            .fetch(&request, &url, None, false, 1000, &OriginProfile::default())
            .await;

        match outcome {
            FetchOutcome::Store { body, attributes } => {
                assert_eq!(&body[..], b"ok");
                assert_eq!(attributes.response_code, 200);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(server.accesses(), 3);
    }
}
