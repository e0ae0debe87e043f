//! Job orchestration: submission, deduplication, cache checks and fan-out.
//!
//! A [`CachedLoaderJob`] handles one submission end to end: register the
//! listener, look the object up in the cache, decide between serving it
//! directly, revalidating it, or downloading it, and finally notify every
//! listener that attached while the job was in flight.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::Url;
use thiserror::Error;
use tracing::Instrument;

use crate::caching::{CacheBackend, CacheEntryAttributes};
use crate::config::Config;
use crate::download::{FetchOutcome, Fetcher};
use crate::utils::{now_millis, CallOnDrop};

pub mod pool;
pub mod registry;


pub use pool::{PoolJob, WorkerPool};
pub use registry::{InProgressRegistry, OriginProfile};

/// How a load ended, as reported to every listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadResult {
    /// An object is available: freshly downloaded, revalidated, negatively
    /// cached, or served stale after a failed refresh.
    Success,
    /// No usable object could be produced.
    Failure,
    /// The job was cancelled before a worker picked it up.
    Canceled,
}

/// The one error that escapes [`CachedLoaderJob::submit`].
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The request could not produce a URL, so there is nothing to load.
    #[error("no URL returned for this request")]
    MissingUrl,
}

/// A value stored in the cache.
///
/// An object with empty content is a negatively cached result (e.g. a
/// remembered 404) and is not loadable.
pub trait CacheObject: Clone + Send + Sync + 'static {
    fn content(&self) -> &[u8];

    fn is_loadable(&self) -> bool {
        !self.content().is_empty()
    }
}

/// A plain byte-blob [`CacheObject`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ByteObject {
    content: Bytes,
}

impl ByteObject {
    pub fn new(content: impl Into<Bytes>) -> Self {
        ByteObject {
            content: content.into(),
        }
    }
}

impl CacheObject for ByteObject {
    fn content(&self) -> &[u8] {
        &self.content
    }
}

/// What a concrete loader contributes to a job: where the object lives, how
/// it is keyed, and how response bytes become a cache object.
///
/// The provided methods tune which responses count as usable and which
/// failures are worth remembering; the defaults match plain tile sources.
pub trait LoaderRequest: Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Send + Sync + 'static;
    type Object: CacheObject;

    /// The URL to load from, or `None` when it cannot be derived yet (e.g.
    /// an attribution endpoint that is not configured).
    fn url(&self) -> Option<Url>;

    /// The backend key for this object.
    fn cache_key(&self) -> Self::Key;

    /// Wraps downloaded bytes into the cached object type.
    fn create_object(&self, content: Bytes) -> Self::Object;

    /// Whether a response body should be stored and reported as a success.
    fn is_response_loadable(
        &self,
        _headers: Option<&HeaderMap>,
        response_code: u16,
        content: &[u8],
    ) -> bool {
        !content.is_empty() && response_code < 400
    }

    /// Whether a non-loadable response should be remembered as an empty
    /// object. Server errors are not; they may resolve themselves.
    fn cache_as_empty(&self, attributes: &CacheEntryAttributes) -> bool {
        attributes.response_code < 500
    }

    /// The key under which discovered origin behavior is remembered.
    fn server_key(&self, url: &Url) -> String {
        url.host_str().unwrap_or_default().to_owned()
    }
}

/// Receives the outcome of a submission exactly once.
pub trait LoadListener<V>: Send + Sync {
    fn loading_finished(
        &self,
        object: Option<&V>,
        attributes: Option<&CacheEntryAttributes>,
        result: LoadResult,
    );
}

/// Shared infrastructure behind all jobs of one loader: the cache backend,
/// the in-progress registry, the origin profile, the fetcher and the worker
/// pool. Cheap to clone; jobs hold one.
pub struct LoaderContext<K, V> {
    inner: Arc<ContextInner<K, V>>,
}

impl<K, V> Clone for LoaderContext<K, V> {
    fn clone(&self) -> Self {
        LoaderContext {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ContextInner<K, V> {
    backend: Arc<dyn CacheBackend<K, V>>,
    in_progress: InProgressRegistry<V>,
    origins: OriginProfile,
    fetcher: Fetcher,
    pool: WorkerPool,
}

impl<K, V> LoaderContext<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: CacheObject,
{
    /// Creates a context on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(backend: Arc<dyn CacheBackend<K, V>>, config: &Config) -> Self {
        Self::with_fetcher(backend, Fetcher::new(config), config)
    }

    pub(crate) fn with_fetcher(
        backend: Arc<dyn CacheBackend<K, V>>,
        fetcher: Fetcher,
        config: &Config,
    ) -> Self {
        LoaderContext {
            inner: Arc::new(ContextInner {
                backend,
                in_progress: InProgressRegistry::default(),
                origins: OriginProfile::default(),
                fetcher,
                pool: WorkerPool::new(config.max_threads),
            }),
        }
    }

    /// Cancels every job still waiting in the queue. Running jobs finish and
    /// cache their result.
    pub fn cancel_outstanding_tasks(&self) {
        self.inner.pool.cancel_outstanding_tasks();
    }

    /// The per-origin record of conditional-request support.
    pub fn origins(&self) -> &OriginProfile {
        &self.inner.origins
    }
}

impl<K, V> std::fmt::Debug for LoaderContext<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderContext")
            .field("in_progress", &self.inner.in_progress)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

struct JobState<V> {
    looked_up: bool,
    object: Option<V>,
    attributes: Option<CacheEntryAttributes>,
}

impl<V> Default for JobState<V> {
    fn default() -> Self {
        JobState {
            looked_up: false,
            object: None,
            attributes: None,
        }
    }
}

/// One submission's worth of work.
///
/// The job owns the load for its URL when it is the first submitter;
/// otherwise it only contributes its listener to the in-flight job's
/// audience. `now` is captured at construction and used for every freshness
/// decision of this run.
pub struct CachedLoaderJob<R: LoaderRequest> {
    request: R,
    context: LoaderContext<R::Key, R::Object>,
    now: u64,
    force: AtomicBool,
    dedup_key: OnceLock<String>,
    state: Mutex<JobState<R::Object>>,
    finish_task: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<R: LoaderRequest> CachedLoaderJob<R> {
    pub fn new(request: R, context: LoaderContext<R::Key, R::Object>) -> Arc<Self> {
        Arc::new(CachedLoaderJob {
            request,
            context,
            now: now_millis(),
            force: AtomicBool::new(false),
            dedup_key: OnceLock::new(),
            state: Mutex::new(JobState::default()),
            finish_task: Mutex::new(None),
        })
    }

    /// Registers `listener` for this job's URL, and schedules the job when it
    /// is the first submission for that URL or `force` is set.
    ///
    /// `force` bypasses the freshness check and intermediary caches.
    pub fn submit(
        self: &Arc<Self>,
        listener: Arc<dyn LoadListener<R::Object>>,
        force: bool,
    ) -> Result<(), SubmitError> {
        let Some(url) = self.request.url() else {
            tracing::warn!("no URL returned, skipping submission");
            return Err(SubmitError::MissingUrl);
        };

        self.force.store(force, Ordering::SeqCst);
        let key = self.dedup_key.get_or_init(|| url.to_string()).clone();
        let first = self.context.inner.in_progress.register(&key, listener);

        if first || force {
            self.context.inner.pool.execute(self.clone());
        }
        Ok(())
    }

    /// Cache-only lookup. Never opens a connection.
    pub fn get(&self) -> Option<R::Object> {
        self.ensure_cache_element();
        self.state.lock().object.clone()
    }

    /// Registers a hook that runs when the job finishes executing, on every
    /// exit path including cancellation.
    pub fn set_finished_task(&self, task: impl FnOnce() + Send + 'static) {
        *self.finish_task.lock() = Some(Box::new(task));
    }

    /// Reports this job as cancelled to its listeners. The cache and the
    /// network are not touched.
    pub fn handle_job_cancellation(&self) {
        self.finish_loading(LoadResult::Canceled);
        self.execution_finished();
    }

    fn ensure_cache_element(&self) {
        let mut state = self.state.lock();
        if state.looked_up {
            return;
        }
        state.looked_up = true;
        if let Some((object, attributes)) = self.context.inner.backend.get(&self.request.cache_key())
        {
            state.object = Some(object);
            state.attributes = Some(attributes);
        }
    }

    async fn run_job(self: Arc<Self>) {
        let _finished = CallOnDrop::new({
            let job = self.clone();
            move || job.execution_finished()
        });

        self.ensure_cache_element();
        let force = self.force.load(Ordering::SeqCst);

        let fresh_hit = !force && {
            let state = self.state.lock();
            matches!(
                (&state.object, &state.attributes),
                (Some(object), Some(attributes))
                    if attributes.is_fresh(self.now) && object.is_loadable()
            )
        };
        if fresh_hit {
            tracing::debug!("returning fresh object from cache");
            self.finish_loading(LoadResult::Success);
            return;
        }

        let Some(url) = self.request.url() else {
            // submit() rejects these; only direct runs can end up here.
            self.finish_loading(LoadResult::Failure);
            return;
        };

        let (cached_attributes, stale_usable) = {
            let state = self.state.lock();
            match (&state.object, &state.attributes) {
                (Some(object), Some(attributes)) if object.is_loadable() => (
                    Some(attributes.clone()),
                    attributes.within_absolute_limit(self.now),
                ),
                _ => (None, false),
            }
        };

        let outcome = self
            .context
            .inner
            .fetcher
            .fetch(
                &self.request,
                &url,
                cached_attributes.as_ref(),
                force,
                self.now,
                &self.context.inner.origins,
            )
            .await;

        match outcome {
            FetchOutcome::NotModified => {
                tracing::debug!("cached object is up to date");
                self.finish_loading(LoadResult::Success);
            }
            FetchOutcome::Store { body, attributes } => {
                let object = self.request.create_object(body);
                {
                    let mut state = self.state.lock();
                    state.object = Some(object.clone());
                    state.attributes = Some(attributes.clone());
                }
                self.context
                    .inner
                    .backend
                    .put(self.request.cache_key(), object, attributes);
                self.finish_loading(LoadResult::Success);
            }
            FetchOutcome::Failed { attributes } => {
                {
                    let mut state = self.state.lock();
                    if !stale_usable {
                        // Too old to serve even stale, or not loadable at
                        // all; don't hand ancient bytes to listeners.
                        state.object = None;
                    }
                    state.attributes = Some(attributes);
                }
                if stale_usable {
                    tracing::debug!("fetch failed, serving stale object from cache");
                    self.finish_loading(LoadResult::Success);
                } else {
                    self.finish_loading(LoadResult::Failure);
                }
            }
        }
    }

    /// Drains the listener set registered under this job's URL and notifies
    /// each listener once with the shared outcome.
    fn finish_loading(&self, result: LoadResult) {
        let Some(key) = self.dedup_key.get() else {
            tracing::warn!("job finished without a registered URL, nobody to notify");
            return;
        };
        let Some(listeners) = self.context.inner.in_progress.drain(key) else {
            tracing::warn!(url = %key, "no listeners registered, nobody notified");
            return;
        };

        let (object, attributes) = {
            let state = self.state.lock();
            (state.object.clone(), state.attributes.clone())
        };
        for listener in listeners {
            listener.loading_finished(object.as_ref(), attributes.as_ref(), result);
        }
    }

    fn execution_finished(&self) {
        if let Some(task) = self.finish_task.lock().take() {
            task();
        }
    }
}

impl<R: LoaderRequest> PoolJob for CachedLoaderJob<R> {
    fn run(self: Arc<Self>) -> BoxFuture<'static, ()> {
        let url = self.dedup_key.get().cloned().unwrap_or_default();
        let span = tracing::info_span!("object_load", url = %url);
        Box::pin(self.run_job().instrument(span))
    }

    fn cancelled(self: Arc<Self>) {
        self.handle_job_cancellation();
    }
}
