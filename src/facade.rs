use crate::change::{ChangeEvent, PropertyChange};
use crate::dispatcher::ChangeDispatcher;
use crate::error::{Error, Result};
use crate::httpx::client::Client;
use crate::listener::{Listener, ListenerId};
use crate::namespace::Namespace;
use crate::repository::RemoteRepository;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// One layer in the facade's priority-ordered read path. Spec.md names
/// "process-level overrides", "environment variables", and "built-in
/// resource defaults" as sources without prescribing a Rust shape for the
/// first and last (there is no JVM system-properties equivalent); this
/// trait is the seam a host binary uses to supply its own, e.g. one backed
/// by parsed CLI flags.
pub trait PropertySource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads from `std::env`, matching spec.md's "environment variables" source.
pub struct EnvSource;

impl PropertySource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// A fixed map, used for both "process-level overrides" and "built-in
/// resource defaults" — the two ends of the priority order that a plain
/// key/value map suffices for.
pub struct MapSource(HashMap<String, String>);

impl MapSource {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self(values)
    }

    pub fn empty() -> Self {
        Self(HashMap::new())
    }
}

impl PropertySource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Merges a [`RemoteRepository`] snapshot with higher/lower-priority
/// property sources and exposes typed, read-through access. Lookup order,
/// highest to lowest priority, per spec.md §4.7:
///
/// 1. `overrides` (process-level overrides, e.g. command-line)
/// 2. the repository's current [`crate::snapshot::Snapshot`]
/// 3. `env` (environment variables)
/// 4. `defaults` (built-in resource defaults)
/// 5. the caller-supplied default passed to [`ConfigFacade::get_property`]
///
/// `get_property` never fails; an added key that is shadowed by a
/// higher-priority source is filtered out of the change events this facade
/// re-publishes, so listeners never see a change they could not have
/// observed through `get_property` itself.
pub struct ConfigFacade<C: Client> {
    repository: Arc<RemoteRepository<C>>,
    overrides: Box<dyn PropertySource>,
    env: Box<dyn PropertySource>,
    defaults: Box<dyn PropertySource>,
    dispatcher: Arc<ChangeDispatcher>,
}

impl<C: Client + 'static> ConfigFacade<C> {
    pub fn new(repository: Arc<RemoteRepository<C>>) -> Arc<Self> {
        Self::with_sources(repository, Box::new(MapSource::empty()), Box::new(EnvSource), Box::new(MapSource::empty()))
    }

    pub fn with_sources(
        repository: Arc<RemoteRepository<C>>,
        overrides: Box<dyn PropertySource>,
        env: Box<dyn PropertySource>,
        defaults: Box<dyn PropertySource>,
    ) -> Arc<Self> {
        let facade = Arc::new(Self {
            repository,
            overrides,
            env,
            defaults,
            dispatcher: ChangeDispatcher::new(),
        });
        facade.clone().install_repository_listener();
        facade
    }

    pub fn namespace(&self) -> &Namespace {
        self.repository.namespace()
    }

    /// Stops the underlying repository's periodic refresh timer and
    /// unregisters its listener; idempotent.
    pub fn stop(&self) {
        self.repository.stop();
    }

    /// Read-through lookup honoring the priority order. Never fails: an
    /// absent key at every priority falls through to `default`.
    pub fn get_property(&self, key: &str, default: &str) -> String {
        if let Some(v) = self.overrides.get(key) {
            return v;
        }
        if let Some(v) = self.repository.get_config().as_ref().and_then(|s| s.get(key).map(str::to_string)) {
            return v;
        }
        if let Some(v) = self.env.get(key) {
            return v;
        }
        if let Some(v) = self.defaults.get(key) {
            return v;
        }
        default.to_string()
    }

    /// Typed accessor. Fails with `TypeMismatch` only when the resolved
    /// string value (from whichever source won) cannot be parsed as `T`;
    /// an absent key never fails, since `default` is returned as-is.
    pub fn get_property_as<T: FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T: ToString,
    {
        let raw = self.get_property(key, &default.to_string());
        raw.parse::<T>()
            .map_err(|_| Error::type_mismatch(key, raw))
    }

    pub async fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.dispatcher.add_listener(listener).await
    }

    pub async fn remove_listener(&self, id: ListenerId) {
        self.dispatcher.remove_listener(id).await
    }

    /// Registers a listener on the underlying repository that re-publishes
    /// events through this facade's own dispatcher after priority
    /// filtering, so a facade listener never observes a change to a key
    /// that a higher-priority source already shadows.
    fn install_repository_listener(self: Arc<Self>) {
        let facade = self;
        struct Relay<C: Client> {
            facade: Arc<ConfigFacade<C>>,
        }
        impl<C: Client + 'static> Listener for Relay<C> {
            fn on_change(&self, event: &ChangeEvent) {
                if let Some(filtered) = self.facade.filter_shadowed(event) {
                    self.facade.dispatcher.dispatch(filtered);
                }
            }
        }
        let relay = Arc::new(Relay {
            facade: facade.clone(),
        });
        let repository = facade.repository.clone();
        tokio::spawn(async move {
            repository.add_listener(relay).await;
        });
    }

    /// Drops any `ChangeType::Added` entry whose key is shadowed by
    /// `overrides`: from the facade's point of view nothing actually
    /// changed for that key, since `get_property` would have returned the
    /// override's value before and after. Modified/Deleted entries for
    /// override-shadowed keys are dropped for the same reason.
    fn filter_shadowed(&self, event: &ChangeEvent) -> Option<ChangeEvent> {
        let changes: Vec<PropertyChange> = event
            .changes
            .iter()
            .filter(|c| self.overrides.get(&c.key).is_none())
            .cloned()
            .collect();

        if changes.is_empty() {
            None
        } else {
            Some(ChangeEvent {
                namespace: event.namespace.clone(),
                changes,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpx::error::Result as HttpxResult;
    use crate::httpx::request::Request;
    use crate::httpx::response::Response;
    use crate::rate_limiter::RateLimiter;
    use crate::repository::RepositoryOptions;
    use crate::service_locator::ServiceLocator;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    struct AlwaysFailsClient;

    #[async_trait]
    impl Client for AlwaysFailsClient {
        async fn execute(&self, _req: Request) -> HttpxResult<Response> {
            Err(crate::httpx::error::Error::new_connection_error("refused"))
        }
    }

    fn facade() -> Arc<ConfigFacade<AlwaysFailsClient>> {
        let repo = RemoteRepository::new(
            Namespace::new("app", "default", "application"),
            Arc::new(AlwaysFailsClient),
            Arc::new(ServiceLocator::new(vec!["http://127.0.0.1:1".into()])),
            Arc::new(RateLimiter::new(100)),
            RepositoryOptions::default(),
        );
        ConfigFacade::new(repo)
    }

    #[test]
    fn falls_back_to_caller_default_when_nothing_else_resolves() {
        let facade = facade();
        assert_eq!(facade.get_property("missing-key", "fallback"), "fallback");
    }

    #[test]
    fn overrides_win_over_everything_else() {
        let repo = RemoteRepository::new(
            Namespace::new("app", "default", "application"),
            Arc::new(AlwaysFailsClient),
            Arc::new(ServiceLocator::new(vec!["http://127.0.0.1:1".into()])),
            Arc::new(RateLimiter::new(100)),
            RepositoryOptions::default(),
        );
        let mut overrides = StdHashMap::new();
        overrides.insert("k".to_string(), "override-value".to_string());
        let facade = ConfigFacade::with_sources(
            repo,
            Box::new(MapSource::new(overrides)),
            Box::new(EnvSource),
            Box::new(MapSource::empty()),
        );
        assert_eq!(facade.get_property("k", "default"), "override-value");
    }

    #[test]
    fn typed_accessor_parses_successfully() {
        let repo = RemoteRepository::new(
            Namespace::new("app", "default", "application"),
            Arc::new(AlwaysFailsClient),
            Arc::new(ServiceLocator::new(vec!["http://127.0.0.1:1".into()])),
            Arc::new(RateLimiter::new(100)),
            RepositoryOptions::default(),
        );
        let mut overrides = StdHashMap::new();
        overrides.insert("port".to_string(), "8080".to_string());
        let facade = ConfigFacade::with_sources(
            repo,
            Box::new(MapSource::new(overrides)),
            Box::new(EnvSource),
            Box::new(MapSource::empty()),
        );
        let port: u16 = facade.get_property_as("port", 0u16).unwrap();
        assert_eq!(port, 8080);
    }

    #[test]
    #[serial_test::serial]
    fn env_source_is_consulted_below_overrides_and_the_repository_snapshot() {
        std::env::set_var("CONFIG_SYNC_CORE_TEST_KEY", "from-env");
        let facade = facade();
        assert_eq!(facade.get_property("CONFIG_SYNC_CORE_TEST_KEY", "fallback"), "from-env");
        std::env::remove_var("CONFIG_SYNC_CORE_TEST_KEY");
    }

    #[test]
    fn typed_accessor_reports_type_mismatch() {
        let repo = RemoteRepository::new(
            Namespace::new("app", "default", "application"),
            Arc::new(AlwaysFailsClient),
            Arc::new(ServiceLocator::new(vec!["http://127.0.0.1:1".into()])),
            Arc::new(RateLimiter::new(100)),
            RepositoryOptions::default(),
        );
        let mut overrides = StdHashMap::new();
        overrides.insert("port".to_string(), "not-a-number".to_string());
        let facade = ConfigFacade::with_sources(
            repo,
            Box::new(MapSource::new(overrides)),
            Box::new(EnvSource),
            Box::new(MapSource::empty()),
        );
        let result = facade.get_property_as::<u16>("port", 0);
        assert!(matches!(
            result.unwrap_err().kind(),
            crate::error::ErrorKind::TypeMismatch { .. }
        ));
    }
}
