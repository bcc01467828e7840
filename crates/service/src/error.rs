//! Error type reported through the `failed` callback.

use thiserror::Error;

/// Classification of a service error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The process was not spawned by the system service manager.
    NotSystemService,
    /// The service metadata could not be read from the service manager.
    FailedToRetrieveConfiguration,
    /// The service cannot run at all.
    FailedToRun,
}

/// An error surfaced to the embedder through the `failed` callback.
///
/// Recoverable errors may be dismissed from inside the callback with
/// [`ignore_error`](crate::ServiceHandle::ignore_error); fatal errors always
/// drive the lifecycle to a stop.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    kind: ServiceErrorKind,
    message: String,
}

impl ServiceError {
    /// Creates an error of the given kind with a human-readable message.
    #[must_use]
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The error classification.
    #[must_use]
    pub fn kind(&self) -> ServiceErrorKind {
        self.kind
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the embedder may dismiss this error and keep serving.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        match self.kind {
            ServiceErrorKind::NotSystemService
            | ServiceErrorKind::FailedToRetrieveConfiguration => true,
            ServiceErrorKind::FailedToRun => false,
        }
    }
}
