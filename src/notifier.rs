use crate::backoff::BackoffPolicy;
use crate::httpx::client::Client;
use crate::httpx::request::Request;
use crate::namespace::{namespace_variants, Namespace};
use crate::protocol::{self, NotificationMessage};
use crate::rate_limiter::RateLimiter;
use crate::repository::RemoteRepository;
use crate::service_locator::ServiceLocator;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Client-socket read timeout for the long-poll request. Must strictly
/// exceed [`SERVER_HOLD_TIMEOUT`] so that a server-side 304 (hold expired,
/// nothing changed) is always observed by the client rather than severed by
/// the client's own timeout first.
pub const LONG_POLL_READ_TIMEOUT: Duration = Duration::from_secs(90);

/// The notification hub's hold timeout, documented here only so the two
/// constants can be compared; the authoritative value lives with the
/// server-side counterpart in [`crate::notification_hub`].
const SERVER_HOLD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, serde::Deserialize)]
struct LongPollNotificationEntry {
    #[serde(rename = "namespaceName")]
    namespace_name: String,
    #[serde(rename = "notificationId")]
    notification_id: i64,
    #[serde(default)]
    messages: Option<RemoteMessages>,
}

#[derive(Debug, serde::Deserialize)]
struct RemoteMessages {
    #[serde(default)]
    details: HashMap<String, i64>,
}

/// Fan-out target the Notifier calls back through, rather than depending on
/// `RemoteRepository<C>`'s concrete client type parameter directly.
///
/// Per spec.md §9's design note resolving the Notifier <-> Repository
/// cyclic ownership, the Notifier only ever holds a [`Weak`] reference to
/// its targets (see [`Registration`]): a repository's lifecycle is owned
/// entirely by its [`crate::client::ConfigSyncClient`], and `unregister`
/// (or simply letting the repository drop) is what removes it from the
/// fan-out, not the Notifier deciding to release it.
pub trait NotifyTarget: Send + Sync {
    fn on_long_poll_notified(
        &self,
        endpoint_hint: Option<String>,
        remote_messages: Option<HashMap<String, i64>>,
    );
}

impl<C: Client + 'static> NotifyTarget for RemoteRepository<C> {
    fn on_long_poll_notified(
        &self,
        endpoint_hint: Option<String>,
        remote_messages: Option<HashMap<String, i64>>,
    ) {
        RemoteRepository::on_long_poll_notified(self, endpoint_hint, remote_messages);
    }
}

struct Registration {
    id: usize,
    target: Weak<dyn NotifyTarget>,
}

#[derive(Default)]
struct WatchState {
    /// namespace (normalized) -> registered repositories for that namespace.
    watchers: HashMap<String, Vec<Registration>>,
    /// namespace (normalized) -> last-acknowledged notification id, -1 initially.
    notification_ids: HashMap<String, i64>,
    /// namespace (normalized) -> latest message bundle delivered by the server.
    remote_messages: HashMap<String, HashMap<String, i64>>,
}

#[derive(Debug, Clone)]
pub struct NotifierOptions {
    pub app_id: String,
    pub cluster: String,
    pub data_center: Option<String>,
    pub local_ip: Option<String>,
    pub long_poll_qps: u32,
    /// Delay before the worker loop issues its first long-poll request
    /// (spec.md §6's `longPollingInitialDelayMillis`), so a process that
    /// registers many namespaces at startup does not immediately open a
    /// long-poll before its initial synchronous fetches have even settled.
    pub long_polling_initial_delay: Duration,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            cluster: "default".to_string(),
            data_center: None,
            local_ip: None,
            long_poll_qps: 2,
            long_polling_initial_delay: Duration::from_millis(2000),
        }
    }
}

/// Process-global singleton (one instance per [`crate::client::ConfigSyncClient`],
/// not a hidden ambient global — see the design notes on avoiding static
/// singletons) that multiplexes every watched namespace into a single
/// outstanding long-poll request.
///
/// The worker loop's state machine is `{Idle -> Running -> Stopping ->
/// Stopped}`: the first call to [`LongPollNotifier::register`] drives
/// Idle -> Running via an atomic compare-and-swap, so repeated registrations
/// (including the very first from several namespaces racing at startup)
/// start at most one worker task.
pub struct LongPollNotifier<C: Client> {
    client: Arc<C>,
    locator: Arc<ServiceLocator>,
    rate_limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
    options: NotifierOptions,

    state: RwLock<WatchState>,
    last_endpoint_hint: Mutex<Option<String>>,
    next_registration_id: Mutex<usize>,

    started: AtomicBool,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl<C: Client + 'static> LongPollNotifier<C> {
    pub fn new(
        client: Arc<C>,
        locator: Arc<ServiceLocator>,
        rate_limiter: Arc<RateLimiter>,
        options: NotifierOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            locator,
            rate_limiter,
            backoff: BackoffPolicy::long_poll_defaults(),
            options,
            state: RwLock::new(WatchState::default()),
            last_endpoint_hint: Mutex::new(None),
            next_registration_id: Mutex::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    /// Adds `target` to the fan-out for `namespace`, starting the worker
    /// loop on the first-ever registration. Idempotent for a duplicate
    /// `(namespace, target)` pair is approximated here by registration
    /// identity: callers are expected to register a given repository at
    /// most once, which is how [`crate::client::ConfigSyncClient`] drives it.
    pub fn register(self: &Arc<Self>, namespace: &Namespace, target: Weak<dyn NotifyTarget>) {
        let key = namespace.normalized_name().to_string();

        {
            let mut state = self.state.write().unwrap();
            state.notification_ids.entry(key.clone()).or_insert(-1);
            let mut next_id = self.next_registration_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            state
                .watchers
                .entry(key)
                .or_default()
                .push(Registration { id, target });
        }

        if !self.started.swap(true, Ordering::SeqCst) {
            let notifier = self.clone();
            tokio::spawn(async move {
                notifier.worker_loop().await;
            });
        }
    }

    pub fn unregister(&self, namespace: &Namespace, target: &Weak<dyn NotifyTarget>) {
        let key = namespace.normalized_name().to_string();
        let mut state = self.state.write().unwrap();
        if let Some(list) = state.watchers.get_mut(&key) {
            list.retain(|r| !Weak::ptr_eq(&r.target, target));
        }
    }

    /// Sets the stop flag; the worker observes it at the loop head and
    /// immediately after every suspension point (rate-limit wait, the
    /// long-poll itself via its bounded read timeout, and backoff sleeps).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn worker_loop(self: Arc<Self>) {
        debug_assert!(
            LONG_POLL_READ_TIMEOUT > SERVER_HOLD_TIMEOUT,
            "client read timeout must exceed the server hold timeout"
        );

        if !self.options.long_polling_initial_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.options.long_polling_initial_delay) => {}
                _ = self.stop_notify.notified() => {
                    self.started.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }

        while !self.is_stopped() {
            self.rate_limiter.acquire(Duration::from_secs(5)).await;
            if self.is_stopped() {
                break;
            }

            match self.poll_once().await {
                Ok(changed) => {
                    self.backoff.success();
                    if !changed {
                        // 304: nothing changed. Opportunistically drop the
                        // sticky endpoint hint half the time, so a
                        // previously-unlucky endpoint gets revisited instead
                        // of being pinned forever by a run of quiet polls.
                        if rand::rng().random_bool(0.5) {
                            *self.last_endpoint_hint.lock().unwrap() = None;
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "long-poll attempt failed");
                    *self.last_endpoint_hint.lock().unwrap() = None;
                    let delay = self.backoff.fail();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop_notify.notified() => break,
                    }
                }
            }
        }

        self.started.store(false, Ordering::SeqCst);
    }

    /// Issues one long-poll round trip. Returns `Ok(true)` if the server
    /// reported a change (200), `Ok(false)` for an empty 304.
    async fn poll_once(&self) -> crate::error::Result<bool> {
        let hint = self.last_endpoint_hint.lock().unwrap().clone();
        let order = self.locator.attempt_order(hint.as_deref())?;
        let endpoint = order
            .first()
            .ok_or_else(|| crate::error::Error::no_available_service("locator returned no endpoints"))?
            .clone();

        let notifications: Vec<NotificationMessage> = {
            let state = self.state.read().unwrap();
            state
                .notification_ids
                .iter()
                .map(|(ns, id)| NotificationMessage {
                    namespace_name: ns.clone(),
                    notification_id: *id,
                })
                .collect()
        };

        let url = protocol::long_poll_url(
            &endpoint,
            &self.options.app_id,
            &self.options.cluster,
            self.options.data_center.as_deref(),
            self.options.local_ip.as_deref(),
            &notifications,
        )?;

        let req = Request::get(url).timeout(LONG_POLL_READ_TIMEOUT);
        let response = self.client.execute(req).await?;

        match response.status().as_u16() {
            200 => {
                let body: Vec<LongPollNotificationEntry> = response.json().await?;
                self.apply_changes(&body);
                self.fan_out(&body, &endpoint);
                *self.last_endpoint_hint.lock().unwrap() = Some(endpoint);
                Ok(true)
            }
            304 => Ok(false),
            status => Err(crate::error::Error::long_poll_failed(format!(
                "long-poll returned unexpected status {status}"
            ))),
        }
    }

    /// Updates `notification_ids`/`remote_messages`, but only ever upward:
    /// a response entry whose id does not exceed the currently recorded one
    /// is ignored, preserving the invariant that `notification_ids[N]` is
    /// monotonic non-decreasing for the lifetime of the process.
    fn apply_changes(&self, entries: &[LongPollNotificationEntry]) {
        let mut state = self.state.write().unwrap();
        for entry in entries {
            let current = state
                .notification_ids
                .get(&entry.namespace_name)
                .copied()
                .unwrap_or(-1);
            if entry.notification_id > current {
                state
                    .notification_ids
                    .insert(entry.namespace_name.clone(), entry.notification_id);
            }
            if let Some(messages) = &entry.messages {
                state
                    .remote_messages
                    .insert(entry.namespace_name.clone(), messages.details.clone());
            }
        }
    }

    /// For each changed namespace, wakes every repository registered under
    /// either spelling (`N` and `N.properties`) to accommodate format-suffix
    /// stripping performed upstream. A listener/target callback that panics
    /// is caught and logged rather than aborting the remaining fan-out. Any
    /// registration whose repository has since been dropped (its `Weak`
    /// fails to upgrade) is pruned from the watch list instead of invoked.
    fn fan_out(&self, entries: &[LongPollNotificationEntry], endpoint: &str) {
        // Collect what to call under a read lock, then release it before
        // invoking targets: a target's callback may itself call back into
        // `register`/`unregister`, which need the write lock.
        let mut to_invoke: Vec<(String, usize, Option<Arc<dyn NotifyTarget>>, Option<HashMap<String, i64>>)> =
            Vec::new();
        {
            let state = self.state.read().unwrap();
            for entry in entries {
                let messages = state.remote_messages.get(&entry.namespace_name).cloned();
                for variant in namespace_variants(&entry.namespace_name) {
                    let Some(targets) = state.watchers.get(&variant) else {
                        continue;
                    };
                    for reg in targets {
                        to_invoke.push((variant.clone(), reg.id, reg.target.upgrade(), messages.clone()));
                    }
                }
            }
        }

        let mut dead_ids: Vec<(String, usize)> = Vec::new();
        for (variant, id, target, messages) in to_invoke {
            let Some(target) = target else {
                dead_ids.push((variant, id));
                continue;
            };
            let endpoint = endpoint.to_string();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                target.on_long_poll_notified(Some(endpoint), messages);
            }));
            if result.is_err() {
                warn!(namespace = %variant, "notifier target panicked while handling a wake; isolated and continuing");
            }
        }

        if !dead_ids.is_empty() {
            let mut state = self.state.write().unwrap();
            for (variant, id) in dead_ids {
                if let Some(list) = state.watchers.get_mut(&variant) {
                    list.retain(|r| r.id != id);
                }
            }
        }

        trace!(count = entries.len(), "fanned out long-poll changes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpx::error::Result as HttpxResult;
    use crate::httpx::response::Response;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct NeverCalledClient;

    #[async_trait]
    impl Client for NeverCalledClient {
        async fn execute(&self, _req: Request) -> HttpxResult<Response> {
            panic!("test does not exercise the network path")
        }
    }

    struct RecordingTarget {
        calls: AtomicUsize,
    }

    impl NotifyTarget for RecordingTarget {
        fn on_long_poll_notified(
            &self,
            _endpoint_hint: Option<String>,
            _remote_messages: Option<HashMap<String, i64>>,
        ) {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn test_notifier() -> Arc<LongPollNotifier<NeverCalledClient>> {
        LongPollNotifier::new(
            Arc::new(NeverCalledClient),
            Arc::new(ServiceLocator::new(vec!["http://127.0.0.1:1".into()])),
            Arc::new(RateLimiter::new(100)),
            NotifierOptions {
                app_id: "app".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn read_timeout_exceeds_server_hold_timeout() {
        assert!(LONG_POLL_READ_TIMEOUT > SERVER_HOLD_TIMEOUT);
    }

    #[test]
    fn notifier_options_default_long_poll_qps_matches_spec() {
        assert_eq!(NotifierOptions::default().long_poll_qps, 2);
    }

    #[test]
    fn register_seeds_notification_id_at_negative_one() {
        let notifier = test_notifier();
        let ns = Namespace::new("app", "default", "application");
        let target: Arc<dyn NotifyTarget> = Arc::new(RecordingTarget {
            calls: AtomicUsize::new(0),
        });
        notifier.register(&ns, Arc::downgrade(&target));

        let state = notifier.state.read().unwrap();
        assert_eq!(state.notification_ids.get("application"), Some(&-1));
    }

    #[test]
    fn duplicate_registration_leaves_watcher_count_per_target_but_id_map_stable() {
        let notifier = test_notifier();
        let ns = Namespace::new("app", "default", "application");
        let target: Arc<dyn NotifyTarget> = Arc::new(RecordingTarget {
            calls: AtomicUsize::new(0),
        });
        notifier.register(&ns, Arc::downgrade(&target));
        notifier.register(&ns, Arc::downgrade(&target));

        let state = notifier.state.read().unwrap();
        // The id map has exactly one entry regardless of how many times the
        // namespace is (re-)registered.
        assert_eq!(state.notification_ids.len(), 1);
    }

    #[test]
    fn unregister_removes_the_target_from_fan_out() {
        let notifier = test_notifier();
        let ns = Namespace::new("app", "default", "application");
        let target: Arc<dyn NotifyTarget> = Arc::new(RecordingTarget {
            calls: AtomicUsize::new(0),
        });
        let weak = Arc::downgrade(&target);
        notifier.register(&ns, weak.clone());
        notifier.unregister(&ns, &weak);

        let state = notifier.state.read().unwrap();
        assert_eq!(state.watchers.get("application").unwrap().len(), 0);
    }

    #[test]
    fn apply_changes_only_moves_ids_forward() {
        let notifier = test_notifier();
        notifier.apply_changes(&[LongPollNotificationEntry {
            namespace_name: "application".into(),
            notification_id: 7,
            messages: None,
        }]);
        notifier.apply_changes(&[LongPollNotificationEntry {
            namespace_name: "application".into(),
            notification_id: 3,
            messages: None,
        }]);

        let state = notifier.state.read().unwrap();
        assert_eq!(state.notification_ids.get("application"), Some(&7));
    }

    #[test]
    fn fan_out_wakes_both_bare_and_suffixed_registrations() {
        let notifier = test_notifier();
        let ns = Namespace::new("app", "default", "application");
        let calls = Arc::new(AtomicUsize::new(0));
        struct Counting(Arc<AtomicUsize>);
        impl NotifyTarget for Counting {
            fn on_long_poll_notified(&self, _: Option<String>, _: Option<HashMap<String, i64>>) {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }
        let target: Arc<dyn NotifyTarget> = Arc::new(Counting(calls.clone()));
        notifier.register(&ns, Arc::downgrade(&target));

        notifier.apply_changes(&[LongPollNotificationEntry {
            namespace_name: "application".into(),
            notification_id: 1,
            messages: None,
        }]);
        notifier.fan_out(
            &[LongPollNotificationEntry {
                namespace_name: "application".into(),
                notification_id: 1,
                messages: None,
            }],
            "http://endpoint",
        );

        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn panicking_target_does_not_block_fan_out() {
        let notifier = test_notifier();
        let ns = Namespace::new("app", "default", "application");
        struct Panics;
        impl NotifyTarget for Panics {
            fn on_long_poll_notified(&self, _: Option<String>, _: Option<HashMap<String, i64>>) {
                panic!("boom");
            }
        }
        let target: Arc<dyn NotifyTarget> = Arc::new(Panics);
        notifier.register(&ns, Arc::downgrade(&target));

        notifier.fan_out(
            &[LongPollNotificationEntry {
                namespace_name: "application".into(),
                notification_id: 1,
                messages: None,
            }],
            "http://endpoint",
        );
        // Reaching this point means the panic inside fan_out was caught.
    }
}
