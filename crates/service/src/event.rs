//! System events relayed by platform backends.

/// Action requested by a system event.
// Kept open for actions such as configuration reload or pause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SystemAction {
    /// The system asks the service to stop.
    Stop,
}

/// A system event relayed by a platform backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemEvent {
    /// The requested action.
    pub action: SystemAction,
    /// Name of the originating signal or control event, e.g. "interrupt".
    pub origin: String,
}

impl SystemEvent {
    /// A stop event with the given origin name.
    #[must_use]
    pub fn stop(origin: impl Into<String>) -> Self {
        Self {
            action: SystemAction::Stop,
            origin: origin.into(),
        }
    }
}
