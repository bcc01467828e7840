//! Backend interfaces: service platform, console platform, and event-loop
//! controller.
//!
//! Commands flow from the lifecycle engine into a backend as plain method
//! calls; results and out-of-band events flow back through the sink the
//! backend received at creation. Sinks marshal every notification as a
//! queued task onto the engine's host loop, so backends may report from any
//! thread, in any callstack, without re-entering the engine directly.

use std::sync::{Arc, Weak};

use crate::config::ServiceConfiguration;
use crate::engine::Engine;
use crate::error::ServiceError;
use crate::event::SystemEvent;
use crate::event_loop::LoopHandle;

/// A backend implementing the system service-manager protocol.
///
/// All commands are asynchronous: the engine issues them and waits for the
/// corresponding notification on the [`ServicePlatformSink`]. Only
/// [`check`](Self::check) answers synchronously.
pub trait ServicePlatform: Send {
    /// Whether this process appears to have been spawned by the system
    /// service manager.
    fn check(&mut self) -> bool;

    /// Performs the service-manager handshake. Reports `started` or
    /// `failed_to_start`.
    fn start(&mut self);

    /// Disengages from the service manager. Reports `stopped`.
    fn stop(&mut self);

    /// Tells the service manager the service is live. Reports
    /// `state_serving_set` or `failed_to_set_state_serving`.
    fn set_state_serving(&mut self);

    /// Tells the service manager a stop is pending. Failures are logged by
    /// the implementation, never reported. Reports `state_stopping_set`.
    fn set_state_stopping(&mut self);

    /// Tells the service manager the service has stopped with the given
    /// exit code. Reports `state_stopped_set`.
    fn set_state_stopped(&mut self, exit_code: i32);

    /// Reads the service metadata from the service manager. Reports
    /// `configuration_retrieved` or `failed_to_retrieve_configuration`.
    fn retrieve_configuration(&mut self);
}

/// A backend treating the process as a foreground console application.
pub trait ConsolePlatform: Send {
    /// Subscribes to terminal and session events. Reports `started` or
    /// `failed_to_start`.
    fn start(&mut self);

    /// Unsubscribes. Reports `stopped`.
    fn stop(&mut self);
}

/// A thin adapter over the host event loop.
pub trait EventLoopController: Send {
    /// Requests the host process to exit with the given code.
    fn exit(&mut self, exit_code: i32);
}

struct SinkInner {
    engine: Weak<Engine>,
    queue: LoopHandle,
}

impl SinkInner {
    fn dispatch(&self, notification: impl FnOnce(&Arc<Engine>) + Send + 'static) {
        let engine = self.engine.clone();
        self.queue.post(move || {
            if let Some(engine) = engine.upgrade() {
                notification(&engine);
            }
        });
    }
}

/// Notification channel from a [`ServicePlatform`] back to the engine.
#[derive(Clone)]
pub struct ServicePlatformSink {
    inner: Arc<SinkInner>,
}

impl ServicePlatformSink {
    pub(crate) fn new(engine: Weak<Engine>, queue: LoopHandle) -> Self {
        Self {
            inner: Arc::new(SinkInner { engine, queue }),
        }
    }

    /// The handshake with the service manager succeeded.
    pub fn started(&self) {
        self.inner.dispatch(|engine| engine.service_platform_started());
    }

    /// The handshake with the service manager failed.
    pub fn failed_to_start(&self, error: ServiceError) {
        self.inner
            .dispatch(move |engine| engine.service_platform_failed_to_start(error));
    }

    /// The platform has disengaged from the service manager.
    pub fn stopped(&self) {
        self.inner.dispatch(|engine| engine.service_platform_stopped());
    }

    /// The service manager now considers the service live.
    pub fn state_serving_set(&self) {
        self.inner.dispatch(|engine| engine.service_state_serving_set());
    }

    /// The service manager rejected the transition to live.
    pub fn failed_to_set_state_serving(&self, error: ServiceError) {
        self.inner
            .dispatch(move |engine| engine.failed_to_set_service_state_serving(error));
    }

    /// The service manager was told a stop is pending.
    pub fn state_stopping_set(&self) {
        self.inner.dispatch(|engine| engine.service_state_stopping_set());
    }

    /// The service manager was told the service has stopped.
    pub fn state_stopped_set(&self) {
        self.inner.dispatch(|engine| engine.service_state_stopped_set());
    }

    /// The service metadata was read successfully.
    pub fn configuration_retrieved(&self, configuration: ServiceConfiguration) {
        self.inner
            .dispatch(move |engine| engine.service_configuration_retrieved(configuration));
    }

    /// The service metadata could not be read.
    pub fn failed_to_retrieve_configuration(&self, error: ServiceError) {
        self.inner
            .dispatch(move |engine| engine.failed_to_retrieve_service_configuration(error));
    }

    /// The service manager relayed a system event.
    pub fn event_received(&self, event: SystemEvent) {
        self.inner
            .dispatch(move |engine| engine.system_event_received(event));
    }
}

/// Notification channel from a [`ConsolePlatform`] back to the engine.
#[derive(Clone)]
pub struct ConsolePlatformSink {
    inner: Arc<SinkInner>,
}

impl ConsolePlatformSink {
    pub(crate) fn new(engine: Weak<Engine>, queue: LoopHandle) -> Self {
        Self {
            inner: Arc::new(SinkInner { engine, queue }),
        }
    }

    /// The platform has subscribed to terminal and session events.
    pub fn started(&self) {
        self.inner.dispatch(|engine| engine.console_platform_started());
    }

    /// The platform could not subscribe to terminal and session events.
    pub fn failed_to_start(&self, error: ServiceError) {
        self.inner
            .dispatch(move |engine| engine.console_platform_failed_to_start(error));
    }

    /// The platform has unsubscribed.
    pub fn stopped(&self) {
        self.inner.dispatch(|engine| engine.console_platform_stopped());
    }

    /// A terminal or session event was received.
    pub fn event_received(&self, event: SystemEvent) {
        self.inner
            .dispatch(move |engine| engine.system_event_received(event));
    }
}

/// Notification channel from an [`EventLoopController`] back to the engine.
#[derive(Clone)]
pub struct ControllerSink {
    inner: Arc<SinkInner>,
}

impl ControllerSink {
    pub(crate) fn new(engine: Weak<Engine>, queue: LoopHandle) -> Self {
        Self {
            inner: Arc::new(SinkInner { engine, queue }),
        }
    }

    /// The host is about to exit on its own.
    pub fn exiting(&self) {
        self.inner.dispatch(|engine| engine.controller_exiting());
    }
}
