use crate::error::Result;
use crate::facade::ConfigFacade;
use crate::httpx::client::{Client, ClientConfig, ReqwestClient};
use crate::namespace::Namespace;
use crate::notifier::{LongPollNotifier, NotifierOptions};
use crate::rate_limiter::RateLimiter;
use crate::repository::{RemoteRepository, RepositoryOptions};
use crate::service_locator::ServiceLocator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Builder for [`ConfigSyncClient`]. Carries every knob in spec.md §6's
/// configuration table plus the identity fields (`app_id`, `cluster`) and
/// seed endpoint list a Rust embedding needs that the distilled spec left
/// implicit, modeled on the teacher's `AgentOptions`/`SeedConfig` builder
/// pair.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ClientOptions {
    pub(crate) app_id: String,
    pub(crate) cluster: String,
    pub(crate) meta_server_addrs: Vec<String>,
    pub(crate) local_ip: Option<String>,
    pub(crate) data_center: Option<String>,
    pub(crate) auth_token: Option<String>,

    pub(crate) refresh_interval: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) load_config_qps: u32,
    pub(crate) long_poll_qps: u32,
    pub(crate) on_error_retry_interval: Duration,
    pub(crate) long_polling_initial_delay: Duration,
}

impl ClientOptions {
    pub fn new(app_id: impl Into<String>, meta_server_addrs: Vec<String>) -> Self {
        Self {
            app_id: app_id.into(),
            cluster: "default".to_string(),
            meta_server_addrs,
            local_ip: None,
            data_center: None,
            auth_token: None,
            refresh_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            load_config_qps: 2,
            long_poll_qps: 2,
            on_error_retry_interval: Duration::from_secs(1),
            long_polling_initial_delay: Duration::from_millis(2000),
        }
    }

    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn local_ip(mut self, local_ip: impl Into<Option<String>>) -> Self {
        self.local_ip = local_ip.into();
        self
    }

    pub fn data_center(mut self, data_center: impl Into<Option<String>>) -> Self {
        self.data_center = data_center.into();
        self
    }

    pub fn auth_token(mut self, auth_token: impl Into<Option<String>>) -> Self {
        self.auth_token = auth_token.into();
        self
    }

    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn load_config_qps(mut self, qps: u32) -> Self {
        self.load_config_qps = qps;
        self
    }

    pub fn long_poll_qps(mut self, qps: u32) -> Self {
        self.long_poll_qps = qps;
        self
    }

    pub fn on_error_retry_interval(mut self, interval: Duration) -> Self {
        self.on_error_retry_interval = interval;
        self
    }

    pub fn long_polling_initial_delay(mut self, delay: Duration) -> Self {
        self.long_polling_initial_delay = delay;
        self
    }
}

/// Root context owning the process-global singletons (Service Locator,
/// fetch rate limiter, shared HTTP client, Long-Poll Notifier) and handing
/// out per-namespace [`RemoteRepository`]/[`ConfigFacade`] pairs.
///
/// Per spec.md §9's design note, these are explicitly constructed and
/// owned here rather than living behind ambient statics, so a test can
/// build as many independent `ConfigSyncClient`s as it needs.
pub struct ConfigSyncClient<C: Client = ReqwestClient> {
    options: ClientOptions,
    client: Arc<C>,
    locator: Arc<ServiceLocator>,
    fetch_rate_limiter: Arc<RateLimiter>,
    notifier: Arc<LongPollNotifier<C>>,
    facades: AsyncMutex<HashMap<Namespace, Arc<ConfigFacade<C>>>>,
}

impl ConfigSyncClient<ReqwestClient> {
    /// Builds a client using the default `reqwest`-backed transport.
    pub async fn new(options: ClientOptions) -> Result<Arc<Self>> {
        let client = Arc::new(ReqwestClient::new(ClientConfig::new().default_timeout(options.request_timeout))?);
        Self::with_client(options, client).await
    }
}

impl<C: Client + 'static> ConfigSyncClient<C> {
    /// Builds a client over a caller-supplied transport, the seam tests use
    /// to substitute a fake `Client`.
    ///
    /// Resolves the real config-service endpoint list from the meta server
    /// synchronously before returning, so the very first [`ConfigSyncClient::namespace`]
    /// call's `sync()` always runs against a resolved config-service
    /// endpoint rather than the unresolved meta-server address (per C1's
    /// contract in spec.md §4.1: a non-empty list or `NoAvailableService`).
    pub async fn with_client(options: ClientOptions, client: Arc<C>) -> Result<Arc<Self>> {
        if options.app_id.is_empty() {
            return Err(crate::error::Error::new_invalid_argument("app_id must not be empty"));
        }
        if options.meta_server_addrs.is_empty() {
            return Err(crate::error::Error::new_invalid_argument(
                "at least one meta server address is required",
            ));
        }

        let locator = Arc::new(ServiceLocator::new(Vec::new()));
        locator
            .refresh_from_meta_server(client.as_ref(), &options.meta_server_addrs)
            .await?;

        let fetch_rate_limiter = Arc::new(RateLimiter::new(options.load_config_qps));
        let long_poll_rate_limiter = Arc::new(RateLimiter::new(options.long_poll_qps));

        let notifier = LongPollNotifier::new(
            client.clone(),
            locator.clone(),
            long_poll_rate_limiter,
            NotifierOptions {
                app_id: options.app_id.clone(),
                cluster: options.cluster.clone(),
                data_center: options.data_center.clone(),
                local_ip: options.local_ip.clone(),
                long_poll_qps: options.long_poll_qps,
                long_polling_initial_delay: options.long_polling_initial_delay,
            },
        );

        locator.spawn_background_refresh(
            client.clone(),
            options.meta_server_addrs.clone(),
            options.refresh_interval,
        );

        Ok(Arc::new(Self {
            options,
            client,
            locator,
            fetch_rate_limiter,
            notifier,
            facades: AsyncMutex::new(HashMap::new()),
        }))
    }

    /// Returns the facade for `namespace`, lazily constructing and starting
    /// its [`RemoteRepository`] on first use: synchronous initial fetch,
    /// then registration with the Long-Poll Notifier and the periodic
    /// refresh timer, matching spec.md §2's control-flow description.
    pub async fn namespace(self: &Arc<Self>, namespace: &str) -> Result<Arc<ConfigFacade<C>>> {
        let ns = Namespace::new(self.options.app_id.clone(), self.options.cluster.clone(), namespace);

        let mut facades = self.facades.lock().await;
        if let Some(existing) = facades.get(&ns) {
            return Ok(existing.clone());
        }

        let repo_options = RepositoryOptions {
            local_ip: self.options.local_ip.clone(),
            data_center: self.options.data_center.clone(),
            auth_token: self.options.auth_token.clone(),
            refresh_interval: self.options.refresh_interval,
            request_timeout: self.options.request_timeout,
            on_error_retry_interval: self.options.on_error_retry_interval,
        };
        let repository = RemoteRepository::new(
            ns.clone(),
            self.client.clone(),
            self.locator.clone(),
            self.fetch_rate_limiter.clone(),
            repo_options,
        );

        repository.start().await?;
        let as_target: Arc<dyn crate::notifier::NotifyTarget> = repository.clone();
        self.notifier.register(&ns, Arc::downgrade(&as_target));

        let facade = ConfigFacade::new(repository);
        facades.insert(ns, facade.clone());
        Ok(facade)
    }

    pub fn locator(&self) -> &Arc<ServiceLocator> {
        &self.locator
    }

    /// Stops the Long-Poll Notifier worker and every repository's periodic
    /// refresh timer. In-flight HTTP requests are not forcibly aborted; they
    /// complete or time out naturally, per spec.md §5's cancellation model.
    pub async fn shutdown(&self) {
        self.notifier.stop();
        self.locator.stop_background_refresh();
        for facade in self.facades.lock().await.values() {
            facade.stop();
        }
    }
}
