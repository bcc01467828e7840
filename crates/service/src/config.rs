//! Service metadata retrieved from the system service manager.

/// Metadata describing the installed service, as known to the service
/// manager.
///
/// Retrieved once during startup; absent when retrieval was skipped via
/// [`set_no_retrieving_configuration`](crate::Service::set_no_retrieving_configuration)
/// or failed recoverably.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceConfiguration {
    /// The service name.
    pub name: String,

    /// The service description.
    pub description: String,

    /// Path of the executable the service manager launched.
    pub executable: String,

    /// The user identity the service runs as.
    pub user: String,
}
