//! The observable serving state of a service.

/// Phase of the service lifecycle as observed by the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServicePhase {
    /// Nothing has happened yet.
    None,
    /// The `start` callback has been dispatched and its completion is awaited.
    Starting,
    /// The service performs its work.
    Serving,
    /// The `stop` callback has been dispatched and its completion is awaited.
    Stopping,
    /// Shutdown has finished.
    Stopped,
}

/// Phase the lifecycle engine is currently driving towards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPhase {
    /// No transition in progress.
    None,
    /// Startup requested via [`run`](crate::Service::run).
    Serving,
    /// Shutdown requested.
    Stopped,
}

/// The pair of current phase and target phase exposed to embedders.
///
/// Only the lifecycle engine mutates this pair; embedders observe it through
/// [`state`](crate::ServiceHandle::state) and the `state_changed` callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServingState {
    /// Where the lifecycle currently is.
    pub phase: ServicePhase,
    /// Where the lifecycle is heading.
    pub target: TargetPhase,
}

impl ServingState {
    /// The state before [`run`](crate::Service::run) was called.
    #[must_use]
    pub const fn initial() -> Self {
        Self {
            phase: ServicePhase::None,
            target: TargetPhase::None,
        }
    }

    /// True before startup was requested and after nothing else happened.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.phase == ServicePhase::None && self.target == TargetPhase::None
    }

    /// True while the service is settled into serving.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.phase == ServicePhase::Serving && self.target == TargetPhase::None
    }

    /// True once shutdown has completed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.phase == ServicePhase::Stopped && self.target == TargetPhase::None
    }
}

impl Default for ServingState {
    fn default() -> Self {
        Self::initial()
    }
}
