//! systemd service-manager backend.
//!
//! Expresses the service-manager handshake in systemd's `Type=notify`
//! protocol: readiness and stop progress go out as `sd_notify` datagrams,
//! the manager's stop request comes in as SIGTERM, watched on a dedicated
//! thread and relayed to the engine as a queued stop event.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod notify;
mod unit;

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use once_cell::sync::Lazy;
use signal_hook::consts::signal::SIGTERM;
use signal_hook::iterator::backend::Handle;
use signal_hook::iterator::Signals;
use tracing::warn;
use vigil_service::platform::{ServicePlatform, ServicePlatformSink};
use vigil_service::registry::{Registry, ServicePlatformFactory};
use vigil_service::{ServiceError, ServiceErrorKind, SystemEvent};

use crate::notify::NotifySocket;

const LOG_TARGET: &str = "vigil::systemd";

/// Default selection priority; embedder-registered backends with a lower
/// order win.
pub const DEFAULT_ORDER: u32 = 99;

// Only one platform instance may own the process-wide signal subscription.
static SUBSCRIBED: Lazy<Mutex<bool>> = Lazy::new(Mutex::default);

/// Registers the systemd backend in the process-wide registry.
pub fn register() {
    register_in(&Registry::global());
}

/// Registers the systemd backend in the given registry.
pub fn register_in(registry: &Registry) {
    registry.register_service_platform(Arc::new(SystemdServicePlatformFactory));
}

/// Factory producing [`SystemdServicePlatform`] instances.
pub struct SystemdServicePlatformFactory;

impl ServicePlatformFactory for SystemdServicePlatformFactory {
    fn order(&self) -> u32 {
        DEFAULT_ORDER
    }

    fn detect(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn create(&self, sink: ServicePlatformSink) -> Option<Box<dyn ServicePlatform>> {
        Some(Box::new(SystemdServicePlatform::new(sink)))
    }
}

struct SignalWatcher {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    /// Watches for the manager's stop request on a dedicated thread. The
    /// thread lives until [`close`](Self::close); every SIGTERM is relayed
    /// as a queued stop event.
    fn spawn(sink: ServicePlatformSink) -> io::Result<Self> {
        let mut signals = Signals::new([SIGTERM])?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("vigil-systemd-signals".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    if signal == SIGTERM {
                        sink.event_received(SystemEvent::stop("shutdown"));
                    }
                }
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    fn close(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// The systemd rendition of the service platform.
pub struct SystemdServicePlatform {
    sink: ServicePlatformSink,
    socket: Option<NotifySocket>,
    watcher: Option<SignalWatcher>,
    exit_code: i32,
}

impl SystemdServicePlatform {
    fn new(sink: ServicePlatformSink) -> Self {
        Self {
            sink,
            socket: None,
            watcher: None,
            exit_code: 0,
        }
    }

    fn teardown(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.close();
            *SUBSCRIBED.lock().unwrap() = false;
        }
        self.socket = None;
    }
}

impl ServicePlatform for SystemdServicePlatform {
    fn check(&mut self) -> bool {
        // The notification socket is only handed to processes the manager
        // spawned itself.
        std::env::var_os(notify::NOTIFY_SOCKET).is_some()
    }

    fn start(&mut self) {
        let socket = match NotifySocket::from_env() {
            Ok(Some(socket)) => socket,
            Ok(None) => {
                self.sink.failed_to_start(ServiceError::new(
                    ServiceErrorKind::NotSystemService,
                    "Failed to run as a service. \
                     This process is not a service spawned by the system.",
                ));
                return;
            }
            Err(error) => {
                self.sink.failed_to_start(ServiceError::new(
                    ServiceErrorKind::FailedToRun,
                    format!(
                        "Failed to run as a service. \
                         Failed to connect to the service manager: {error}."
                    ),
                ));
                return;
            }
        };

        {
            let mut subscribed = SUBSCRIBED.lock().unwrap();
            if *subscribed {
                self.sink.failed_to_start(ServiceError::new(
                    ServiceErrorKind::FailedToRun,
                    "Failed to run as a service. \
                     Another instance is already subscribed to service events.",
                ));
                return;
            }
            *subscribed = true;
        }
        let watcher = match SignalWatcher::spawn(self.sink.clone()) {
            Ok(watcher) => watcher,
            Err(error) => {
                *SUBSCRIBED.lock().unwrap() = false;
                self.sink.failed_to_start(ServiceError::new(
                    ServiceErrorKind::FailedToRun,
                    format!(
                        "Failed to run as a service. \
                         Failed to subscribe to service events: {error}."
                    ),
                ));
                return;
            }
        };

        if let Err(error) = socket.send("STATUS=Starting...") {
            self.watcher = Some(watcher);
            self.teardown();
            self.sink.failed_to_start(ServiceError::new(
                ServiceErrorKind::FailedToRun,
                format!(
                    "Failed to run as a service. \
                     Failed to report the service state: {error}."
                ),
            ));
            return;
        }

        self.socket = Some(socket);
        self.watcher = Some(watcher);
        self.sink.started();
    }

    fn stop(&mut self) {
        if let Some(socket) = &self.socket {
            if let Err(error) = socket.send(&notify::stopped_status(self.exit_code)) {
                warn!(target: LOG_TARGET, "Failed to report the stopped state: {error}");
            }
        }
        self.teardown();
        self.sink.stopped();
    }

    fn set_state_serving(&mut self) {
        let Some(socket) = &self.socket else {
            self.sink.state_serving_set();
            return;
        };
        if let Err(error) = socket.send("READY=1\nSTATUS=Serving...") {
            self.sink.failed_to_set_state_serving(ServiceError::new(
                ServiceErrorKind::FailedToRun,
                format!(
                    "Failed to run as a service. \
                     Failed to set service state: {error}."
                ),
            ));
            return;
        }
        self.sink.state_serving_set();
    }

    fn set_state_stopping(&mut self) {
        if let Some(socket) = &self.socket {
            if let Err(error) = socket.send("STOPPING=1\nSTATUS=Stopping...") {
                warn!(target: LOG_TARGET, "Failed to set service state: {error}");
            }
        }
        self.sink.state_stopping_set();
    }

    fn set_state_stopped(&mut self, exit_code: i32) {
        // Reported to the manager with the final status once the platform
        // stops.
        self.exit_code = exit_code;
        self.sink.state_stopped_set();
    }

    fn retrieve_configuration(&mut self) {
        match unit::retrieve() {
            Ok(configuration) => self.sink.configuration_retrieved(configuration),
            Err(error) => self.sink.failed_to_retrieve_configuration(error),
        }
    }
}

impl Drop for SystemdServicePlatform {
    fn drop(&mut self) {
        self.teardown();
    }
}
