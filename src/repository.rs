use crate::backoff::BackoffPolicy;
use crate::cache::{SnapshotSink, SnapshotSource};
use crate::change::diff_snapshots;
use crate::dispatcher::ChangeDispatcher;
use crate::error::{Error, Result};
use crate::httpx::client::Client;
use crate::httpx::request::{Auth, Request};
use crate::listener::{Listener, ListenerId};
use crate::namespace::Namespace;
use crate::protocol::{self, ConfigResponse};
use crate::rate_limiter::RateLimiter;
use crate::service_locator::ServiceLocator;
use crate::snapshot::{is_new_release, ReleaseKey, Snapshot};
use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    pub local_ip: Option<String>,
    pub data_center: Option<String>,
    pub auth_token: Option<String>,
    pub refresh_interval: Duration,
    pub request_timeout: Duration,
    /// Base for the fetch-retry backoff (spec.md §6's `onErrorRetryInterval`);
    /// the cap scales off of it, see [`BackoffPolicy::fetch_with_base`].
    pub on_error_retry_interval: Duration,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            local_ip: None,
            data_center: None,
            auth_token: None,
            refresh_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            on_error_retry_interval: Duration::from_secs(1),
        }
    }
}

struct MutableState {
    long_poll_endpoint_hint: Option<String>,
    last_remote_messages: Option<HashMap<String, i64>>,
    force_refresh: bool,
}

/// Holds and keeps fresh the current snapshot of a single namespace.
///
/// One instance is created per watched namespace on first use and lives
/// until [`RemoteRepository::stop`]. `sync()` is the only path that may
/// publish a new snapshot; it is serialized per repository via `sync_guard`
/// so that successive publications are observed in order by every reader,
/// while `get_config` never blocks behind a `sync()` in flight.
pub struct RemoteRepository<C: Client> {
    namespace: Namespace,
    client: Arc<C>,
    locator: Arc<ServiceLocator>,
    rate_limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
    dispatcher: Arc<ChangeDispatcher>,
    options: RepositoryOptions,
    cache_sink: Option<Arc<dyn SnapshotSink>>,
    cache_source: Option<Arc<dyn SnapshotSource>>,

    snapshot: ArcSwapOption<Snapshot>,
    state: AsyncMutex<MutableState>,
    sync_guard: AsyncMutex<()>,

    running: AtomicBool,
    stopped: AtomicBool,
    stop_notify: Notify,

    /// Self-reference used only to obtain an `Arc<Self>` for spawning async
    /// work from `&self` trait methods (e.g. [`crate::notifier::NotifyTarget`]).
    /// The Notifier holds the corresponding `Weak` the other way around
    /// (spec.md §9's design note: Notifier <-> Repository is a cyclic
    /// relationship resolved by a non-owning reference), so this field
    /// creates no cycle of its own.
    self_weak: Weak<Self>,
}

impl<C: Client + 'static> RemoteRepository<C> {
    pub fn new(
        namespace: Namespace,
        client: Arc<C>,
        locator: Arc<ServiceLocator>,
        rate_limiter: Arc<RateLimiter>,
        options: RepositoryOptions,
    ) -> Arc<Self> {
        Self::with_cache(namespace, client, locator, rate_limiter, options, None, None)
    }

    /// Like [`RemoteRepository::new`], additionally wiring a host-supplied
    /// disk cache: `cache_sink` receives every freshly loaded snapshot,
    /// `cache_source` is consulted as a fallback if the very first remote
    /// load fails.
    pub fn with_cache(
        namespace: Namespace,
        client: Arc<C>,
        locator: Arc<ServiceLocator>,
        rate_limiter: Arc<RateLimiter>,
        options: RepositoryOptions,
        cache_sink: Option<Arc<dyn SnapshotSink>>,
        cache_source: Option<Arc<dyn SnapshotSource>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            namespace,
            client,
            locator,
            rate_limiter,
            backoff: BackoffPolicy::fetch_with_base(options.on_error_retry_interval),
            dispatcher: ChangeDispatcher::new(),
            options,
            cache_sink,
            cache_source,
            snapshot: ArcSwapOption::from(None),
            state: AsyncMutex::new(MutableState {
                long_poll_endpoint_hint: None,
                last_remote_messages: None,
                force_refresh: false,
            }),
            sync_guard: AsyncMutex::new(()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
            self_weak: weak.clone(),
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Fetches once synchronously, then arms the periodic refresh timer.
    /// A failed first fetch is surfaced as `InitialLoadFailed`; the host
    /// decides whether to fall back to an on-disk cache.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.sync().await {
            if let Some(cached) = self.cache_source.as_ref().and_then(|s| s.load(&self.namespace)) {
                warn!(namespace = %self.namespace, error = %e, "initial remote load failed, falling back to disk cache");
                self.snapshot.store(Some(Arc::new(cached)));
            } else {
                return Err(Error::initial_load_failed(self.namespace.clone(), e.to_string()));
            }
        }

        self.running.store(true, Ordering::SeqCst);

        let repo = self.clone();
        tokio::spawn(async move {
            repo.periodic_refresh_loop().await;
        });

        Ok(())
    }

    async fn periodic_refresh_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.options.refresh_interval) => {
                    if !self.running.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Err(e) = self.sync().await {
                        warn!(namespace = %self.namespace, error = %e, "periodic refresh failed");
                    }
                }
                _ = self.stop_notify.notified() => {
                    return;
                }
            }
        }
    }

    /// Non-blocking read of the current snapshot, if one has been loaded.
    pub fn get_config(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.load_full()
    }

    pub async fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.dispatcher.add_listener(listener).await
    }

    pub async fn remove_listener(&self, id: ListenerId) {
        self.dispatcher.remove_listener(id).await
    }

    /// Invoked by the Notifier when a long-poll indicates this namespace may
    /// have changed. Stores the endpoint hint and the copied message bundle,
    /// marks the repository for a forced refresh, and kicks off an
    /// asynchronous `sync()` without waiting for it.
    pub fn on_long_poll_notified(
        &self,
        endpoint_hint: Option<String>,
        remote_messages: Option<HashMap<String, i64>>,
    ) {
        let Some(repo) = self.self_weak.upgrade() else {
            return;
        };
        if repo.stopped.load(Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            {
                let mut state = repo.state.lock().await;
                state.long_poll_endpoint_hint = endpoint_hint;
                state.last_remote_messages = remote_messages;
                state.force_refresh = true;
            }
            if let Err(e) = repo.sync().await {
                warn!(namespace = %repo.namespace, error = %e, "long-poll-triggered sync failed");
            }
        });
    }

    /// Stops the periodic refresh timer and marks the repository as torn
    /// down: any `sync()` call racing against this (the periodic loop
    /// waking just as `stop_notify` fires, or a long-poll-triggered sync
    /// already spawned) observes `ErrorKind::Shutdown` instead of issuing a
    /// fetch against a repository its owner is discarding.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if self.running.swap(false, Ordering::SeqCst) {
            self.stop_notify.notify_waiters();
        }
    }

    /// The core fetch algorithm: attempts to load a fresh snapshot, publishes
    /// it if it differs from the one currently held, and dispatches a change
    /// event to listeners. Serialized per repository via `sync_guard`.
    pub async fn sync(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::shutdown());
        }

        let _guard = self.sync_guard.lock().await;

        let previous = self.snapshot.load_full();

        let (force_refresh, mut hint, last_messages) = {
            let mut state = self.state.lock().await;
            let hint = state.long_poll_endpoint_hint.take();
            (state.force_refresh, hint, state.last_remote_messages.clone())
        };

        let attempts = if force_refresh { 2 } else { 1 };
        let mut last_error: Option<Error> = None;
        let mut loaded: Option<Snapshot> = None;

        'attempts: for attempt in 0..attempts {
            let order = self.locator.attempt_order(hint.as_deref())?;
            hint = None;

            for (i, endpoint) in order.iter().enumerate() {
                self.rate_limiter.acquire(Duration::from_secs(2)).await;

                match self.fetch_from(endpoint, previous.as_deref(), last_messages.as_ref()).await {
                    Ok(snapshot) => {
                        let is_new = is_new_release(previous.as_ref(), &snapshot);
                        loaded = Some(snapshot);
                        // A force_refresh retry exists specifically so a long-poll
                        // "changed" hint that resolves to a repeated 304 gets one
                        // more attempt within this invocation; a genuine new
                        // release (or a non-forced call) is done immediately.
                        if is_new || !force_refresh {
                            break 'attempts;
                        }
                        debug!(namespace = %self.namespace, endpoint, "force_refresh fetch returned no new release, retrying");
                    }
                    Err(e) => {
                        debug!(namespace = %self.namespace, endpoint, error = %e, "fetch attempt failed");
                        last_error = Some(e);
                        if i + 1 < order.len() {
                            let sleep_for = if force_refresh {
                                self.options.on_error_retry_interval
                            } else {
                                self.backoff.fail()
                            };
                            tokio::time::sleep(sleep_for).await;
                        }
                    }
                }
            }

            if attempt + 1 < attempts {
                let sleep_for = if force_refresh {
                    self.options.on_error_retry_interval
                } else {
                    self.backoff.fail()
                };
                tokio::time::sleep(sleep_for).await;
            }
        }

        let mut state = self.state.lock().await;
        state.force_refresh = false;
        drop(state);

        let loaded = match loaded {
            Some(s) => s,
            None => {
                return Err(last_error.unwrap_or_else(|| {
                    Error::load_failed(self.namespace.clone(), "no endpoint succeeded")
                }));
            }
        };

        self.backoff.success();

        if is_new_release(previous.as_ref(), &loaded) {
            if let Some(event) = diff_snapshots(previous.as_deref(), &loaded) {
                self.dispatcher.dispatch(event);
            }
            if let Some(sink) = &self.cache_sink {
                sink.store(&loaded);
            }
            self.snapshot.store(Some(Arc::new(loaded)));
        }

        Ok(())
    }

    async fn fetch_from(
        &self,
        endpoint: &str,
        previous: Option<&Snapshot>,
        last_messages: Option<&HashMap<String, i64>>,
    ) -> Result<Snapshot> {
        let release_key = previous.map(|s| s.release_key.0.as_str());
        let messages_json = last_messages
            .map(serde_json::to_string)
            .transpose()?;
        let url = protocol::config_url(
            endpoint,
            &self.namespace,
            &protocol::ConfigRequestParams {
                release_key,
                local_ip: self.options.local_ip.as_deref(),
                data_center: self.options.data_center.as_deref(),
                messages_json: messages_json.as_deref(),
            },
        );

        let mut req = Request::get(url).timeout(self.options.request_timeout);
        if let Some(token) = &self.options.auth_token {
            req = req.auth(Some(Auth::BearerAuth(token.clone())));
        }

        let response = self.client.execute(req).await?;

        match response.status().as_u16() {
            200 => {
                let body: ConfigResponse = response.json().await?;
                Ok(Snapshot::new(
                    self.namespace.clone(),
                    ReleaseKey(body.release_key),
                    body.configurations,
                )
                .with_notification_messages(last_messages.cloned()))
            }
            304 => previous.cloned().ok_or_else(|| {
                Error::load_failed(
                    self.namespace.clone(),
                    "server returned 304 but no prior snapshot is held",
                )
            }),
            404 => Err(Error::namespace_not_found(self.namespace.clone())),
            status => Err(Error::load_failed(
                self.namespace.clone(),
                format!("unexpected status {status}"),
            )),
        }
    }
}
