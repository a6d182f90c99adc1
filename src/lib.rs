mod backoff;
mod cache;
mod change;
mod client;
mod dispatcher;
mod error;
mod facade;
pub mod httpx;
mod listener;
mod namespace;
mod notification_hub;
mod notifier;
mod protocol;
mod rate_limiter;
mod repository;
mod service_locator;
mod snapshot;
mod util;

pub use cache::{SnapshotSink, SnapshotSource};
pub use change::{ChangeEvent, ChangeType, PropertyChange};
pub use client::{ClientOptions, ConfigSyncClient};
pub use error::{Error, ErrorKind, Result};
pub use facade::{ConfigFacade, EnvSource, MapSource, PropertySource};
pub use httpx::client::{Client, ReqwestClient};
pub use listener::{Listener, ListenerId};
pub use namespace::Namespace;
pub use notification_hub::{LongPollOutcome, NamespaceNotification, NotificationHub};
pub use notifier::NotifyTarget;
pub use repository::{RemoteRepository, RepositoryOptions};
pub use service_locator::ServiceLocator;
pub use snapshot::Snapshot;
