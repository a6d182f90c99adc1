use crate::httpx::error::Error as HttpError;
use crate::namespace::Namespace;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub(crate) fn no_available_service(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoAvailableService { msg: msg.into() })
    }

    pub(crate) fn namespace_not_found(namespace: Namespace) -> Self {
        Self::new(ErrorKind::NamespaceNotFound { namespace })
    }

    pub(crate) fn initial_load_failed(namespace: Namespace, msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InitialLoadFailed {
            namespace,
            msg: msg.into(),
        })
    }

    pub(crate) fn load_failed(namespace: Namespace, msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::LoadFailed {
            namespace,
            msg: msg.into(),
        })
    }

    pub(crate) fn long_poll_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::LongPollFailed { msg: msg.into() })
    }

    pub(crate) fn type_mismatch(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch {
            key: key.into(),
            value: value.into(),
        })
    }

    pub(crate) fn new_invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument { msg: msg.into() })
    }

    pub(crate) fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown)
    }
}

/// Error kinds, matching the taxonomy in the fetch/notify error design:
/// transient per-endpoint failures are folded into `LoadFailed` once the
/// retry budget for a `sync()` attempt is exhausted; `ListenerFault` has no
/// variant here because it is logged and swallowed at the dispatch boundary
/// rather than surfaced to callers.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("no available config service endpoints: {msg}")]
    #[non_exhaustive]
    NoAvailableService { msg: String },

    #[error("namespace {namespace} is not yet released")]
    #[non_exhaustive]
    NamespaceNotFound { namespace: Namespace },

    #[error("initial load for namespace {namespace} failed: {msg}")]
    #[non_exhaustive]
    InitialLoadFailed { namespace: Namespace, msg: String },

    #[error("load for namespace {namespace} failed: {msg}")]
    #[non_exhaustive]
    LoadFailed { namespace: Namespace, msg: String },

    #[error("long-poll notifier request failed: {msg}")]
    #[non_exhaustive]
    LongPollFailed { msg: String },

    #[error("property {key} = '{value}' could not be parsed as the requested type")]
    #[non_exhaustive]
    TypeMismatch { key: String, value: String },

    #[error("{0}")]
    Http(HttpError),

    #[error("an error occurred during serialization/deserialization: {msg}")]
    #[non_exhaustive]
    Json { msg: String },

    #[error("invalid argument: {msg}")]
    #[non_exhaustive]
    InvalidArgument { msg: String },

    #[error("shutdown")]
    Shutdown,
}

impl From<HttpError> for Error {
    fn from(value: HttpError) -> Self {
        Self::new(ErrorKind::Http(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::new(ErrorKind::Json {
            msg: value.to_string(),
        })
    }
}
