//! Scriptable mock platform backends for testing service lifecycles.
//!
//! Each `install` helper registers a factory with priority 1, so the mocks
//! win over any real platform registered alongside them. By default every
//! command is acknowledged successfully right away; individual commands can
//! be scripted to fail with a given error or to wait for a manual
//! acknowledgement from the test.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::sync::{Arc, Mutex};

use vigil_service::platform::{
    ConsolePlatform, ConsolePlatformSink, ControllerSink, EventLoopController, ServicePlatform,
    ServicePlatformSink,
};
use vigil_service::registry::{
    ConsolePlatformFactory, ControllerFactory, Registry, ServicePlatformFactory,
};
use vigil_service::{ServiceConfiguration, ServiceError, SystemEvent};

const MOCK_ORDER: u32 = 1;

/// How a mock replies to a command expecting success or failure.
#[derive(Clone, Default)]
enum Reply {
    /// Acknowledge success immediately.
    #[default]
    Auto,
    /// Report the given failure.
    Fail(ServiceError),
    /// Do nothing; the test acknowledges explicitly.
    Manual,
}

/// How a mock replies to a command that can only succeed.
#[derive(Clone, Copy, Default)]
enum Ack {
    /// Acknowledge immediately.
    #[default]
    Auto,
    /// Do nothing; the test acknowledges explicitly.
    Manual,
}

/// A command received by a [`MockServicePlatform`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceCommand {
    /// `check()` was consulted.
    Check,
    /// `start()` was commanded.
    Start,
    /// `stop()` was commanded.
    Stop,
    /// `set_state_serving()` was commanded.
    SetStateServing,
    /// `set_state_stopping()` was commanded.
    SetStateStopping,
    /// `set_state_stopped(exit_code)` was commanded.
    SetStateStopped(i32),
    /// `retrieve_configuration()` was commanded.
    RetrieveConfiguration,
}

/// A command received by a [`MockConsolePlatform`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `start()` was commanded.
    Start,
    /// `stop()` was commanded.
    Stop,
}

struct ServiceShared {
    sink: Option<ServicePlatformSink>,
    check_result: bool,
    start: Reply,
    set_state_serving: Reply,
    retrieve_configuration: Reply,
    stop: Ack,
    configuration: ServiceConfiguration,
    commands: Vec<ServiceCommand>,
}

impl Default for ServiceShared {
    fn default() -> Self {
        Self {
            sink: None,
            check_result: true,
            start: Reply::Auto,
            set_state_serving: Reply::Auto,
            retrieve_configuration: Reply::Auto,
            stop: Ack::Auto,
            configuration: ServiceConfiguration {
                name: "mock-service".into(),
                description: "Mock service.".into(),
                executable: "mock-service".into(),
                user: "mock".into(),
            },
            commands: Vec::new(),
        }
    }
}

/// Test-side handle scripting a [`MockServicePlatform`] and observing the
/// commands it receives.
#[derive(Clone, Default)]
pub struct MockServicePlatformHandle {
    shared: Arc<Mutex<ServiceShared>>,
}

impl MockServicePlatformHandle {
    /// Registers a mock service platform factory and returns its handle.
    pub fn install(registry: &Registry) -> Self {
        let handle = Self::default();
        registry.register_service_platform(Arc::new(MockServicePlatformFactory {
            shared: Arc::clone(&handle.shared),
        }));
        handle
    }

    /// Scripts the answer of `check()`.
    pub fn set_check(&self, looks_like_service: bool) {
        self.shared.lock().unwrap().check_result = looks_like_service;
    }

    /// Scripts `start()` to report the given failure.
    pub fn fail_start(&self, error: ServiceError) {
        self.shared.lock().unwrap().start = Reply::Fail(error);
    }

    /// Scripts `set_state_serving()` to report the given failure.
    pub fn fail_set_state_serving(&self, error: ServiceError) {
        self.shared.lock().unwrap().set_state_serving = Reply::Fail(error);
    }

    /// Scripts `retrieve_configuration()` to report the given failure.
    pub fn fail_retrieve_configuration(&self, error: ServiceError) {
        self.shared.lock().unwrap().retrieve_configuration = Reply::Fail(error);
    }

    /// Overrides the configuration reported on successful retrieval.
    pub fn set_configuration(&self, configuration: ServiceConfiguration) {
        self.shared.lock().unwrap().configuration = configuration;
    }

    /// Makes `stop()` wait for [`complete_stop`](Self::complete_stop).
    pub fn defer_stop(&self) {
        self.shared.lock().unwrap().stop = Ack::Manual;
    }

    /// Acknowledges a deferred `stop()`.
    pub fn complete_stop(&self) {
        let sink = self.shared.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            sink.stopped();
        }
    }

    /// Relays a stop system event, as the service manager would.
    pub fn send_stop(&self) {
        self.send_event(SystemEvent::stop("test"));
    }

    /// Relays an arbitrary system event.
    pub fn send_event(&self, event: SystemEvent) {
        let sink = self.shared.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            sink.event_received(event);
        }
    }

    /// The commands received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<ServiceCommand> {
        self.shared.lock().unwrap().commands.clone()
    }

    /// Whether the platform was ever created and commanded.
    #[must_use]
    pub fn touched(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.sink.is_some() || !shared.commands.is_empty()
    }
}

struct MockServicePlatformFactory {
    shared: Arc<Mutex<ServiceShared>>,
}

impl ServicePlatformFactory for MockServicePlatformFactory {
    fn order(&self) -> u32 {
        MOCK_ORDER
    }

    fn detect(&self) -> bool {
        true
    }

    fn create(&self, sink: ServicePlatformSink) -> Option<Box<dyn ServicePlatform>> {
        self.shared.lock().unwrap().sink = Some(sink.clone());
        Some(Box::new(MockServicePlatform {
            shared: Arc::clone(&self.shared),
            sink,
        }))
    }
}

/// A service platform driven by a [`MockServicePlatformHandle`].
pub struct MockServicePlatform {
    shared: Arc<Mutex<ServiceShared>>,
    sink: ServicePlatformSink,
}

impl MockServicePlatform {
    fn record(&self, command: ServiceCommand) {
        self.shared.lock().unwrap().commands.push(command);
    }
}

impl ServicePlatform for MockServicePlatform {
    fn check(&mut self) -> bool {
        self.record(ServiceCommand::Check);
        self.shared.lock().unwrap().check_result
    }

    fn start(&mut self) {
        self.record(ServiceCommand::Start);
        let reply = self.shared.lock().unwrap().start.clone();
        match reply {
            Reply::Auto => self.sink.started(),
            Reply::Fail(error) => self.sink.failed_to_start(error),
            Reply::Manual => {}
        }
    }

    fn stop(&mut self) {
        self.record(ServiceCommand::Stop);
        match self.shared.lock().unwrap().stop {
            Ack::Auto => self.sink.stopped(),
            Ack::Manual => {}
        }
    }

    fn set_state_serving(&mut self) {
        self.record(ServiceCommand::SetStateServing);
        let reply = self.shared.lock().unwrap().set_state_serving.clone();
        match reply {
            Reply::Auto => self.sink.state_serving_set(),
            Reply::Fail(error) => self.sink.failed_to_set_state_serving(error),
            Reply::Manual => {}
        }
    }

    fn set_state_stopping(&mut self) {
        self.record(ServiceCommand::SetStateStopping);
        self.sink.state_stopping_set();
    }

    fn set_state_stopped(&mut self, exit_code: i32) {
        self.record(ServiceCommand::SetStateStopped(exit_code));
        self.sink.state_stopped_set();
    }

    fn retrieve_configuration(&mut self) {
        self.record(ServiceCommand::RetrieveConfiguration);
        let (reply, configuration) = {
            let shared = self.shared.lock().unwrap();
            (
                shared.retrieve_configuration.clone(),
                shared.configuration.clone(),
            )
        };
        match reply {
            Reply::Auto => self.sink.configuration_retrieved(configuration),
            Reply::Fail(error) => self.sink.failed_to_retrieve_configuration(error),
            Reply::Manual => {}
        }
    }
}

struct ConsoleShared {
    sink: Option<ConsolePlatformSink>,
    start: Reply,
    stop: Ack,
    commands: Vec<ConsoleCommand>,
}

impl Default for ConsoleShared {
    fn default() -> Self {
        Self {
            sink: None,
            start: Reply::Auto,
            stop: Ack::Auto,
            commands: Vec::new(),
        }
    }
}

/// Test-side handle scripting a [`MockConsolePlatform`].
#[derive(Clone, Default)]
pub struct MockConsolePlatformHandle {
    shared: Arc<Mutex<ConsoleShared>>,
}

impl MockConsolePlatformHandle {
    /// Registers a mock console platform factory and returns its handle.
    pub fn install(registry: &Registry) -> Self {
        let handle = Self::default();
        registry.register_console_platform(Arc::new(MockConsolePlatformFactory {
            shared: Arc::clone(&handle.shared),
        }));
        handle
    }

    /// Scripts `start()` to report the given failure.
    pub fn fail_start(&self, error: ServiceError) {
        self.shared.lock().unwrap().start = Reply::Fail(error);
    }

    /// Makes `stop()` wait for [`complete_stop`](Self::complete_stop).
    pub fn defer_stop(&self) {
        self.shared.lock().unwrap().stop = Ack::Manual;
    }

    /// Acknowledges a deferred `stop()`.
    pub fn complete_stop(&self) {
        let sink = self.shared.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            sink.stopped();
        }
    }

    /// Relays a stop system event, as a terminal signal would.
    pub fn send_stop(&self) {
        self.send_event(SystemEvent::stop("test"));
    }

    /// Relays an arbitrary system event.
    pub fn send_event(&self, event: SystemEvent) {
        let sink = self.shared.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            sink.event_received(event);
        }
    }

    /// The commands received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<ConsoleCommand> {
        self.shared.lock().unwrap().commands.clone()
    }

    /// Whether the platform was ever created and commanded.
    #[must_use]
    pub fn touched(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.sink.is_some() || !shared.commands.is_empty()
    }
}

struct MockConsolePlatformFactory {
    shared: Arc<Mutex<ConsoleShared>>,
}

impl ConsolePlatformFactory for MockConsolePlatformFactory {
    fn order(&self) -> u32 {
        MOCK_ORDER
    }

    fn create(&self, sink: ConsolePlatformSink) -> Option<Box<dyn ConsolePlatform>> {
        self.shared.lock().unwrap().sink = Some(sink.clone());
        Some(Box::new(MockConsolePlatform {
            shared: Arc::clone(&self.shared),
            sink,
        }))
    }
}

/// A console platform driven by a [`MockConsolePlatformHandle`].
pub struct MockConsolePlatform {
    shared: Arc<Mutex<ConsoleShared>>,
    sink: ConsolePlatformSink,
}

impl ConsolePlatform for MockConsolePlatform {
    fn start(&mut self) {
        self.shared
            .lock()
            .unwrap()
            .commands
            .push(ConsoleCommand::Start);
        let reply = self.shared.lock().unwrap().start.clone();
        match reply {
            Reply::Auto => self.sink.started(),
            Reply::Fail(error) => self.sink.failed_to_start(error),
            Reply::Manual => {}
        }
    }

    fn stop(&mut self) {
        self.shared
            .lock()
            .unwrap()
            .commands
            .push(ConsoleCommand::Stop);
        match self.shared.lock().unwrap().stop {
            Ack::Auto => self.sink.stopped(),
            Ack::Manual => {}
        }
    }
}

#[derive(Default)]
struct ControllerShared {
    sink: Option<ControllerSink>,
    exits: Vec<i32>,
}

/// Test-side handle observing a mock event-loop controller and driving its
/// `exiting` notification.
#[derive(Clone, Default)]
pub struct MockControllerHandle {
    shared: Arc<Mutex<ControllerShared>>,
}

impl MockControllerHandle {
    /// Registers a mock controller factory and returns its handle.
    pub fn install(registry: &Registry) -> Self {
        let handle = Self::default();
        registry.register_controller(Arc::new(MockControllerFactory {
            shared: Arc::clone(&handle.shared),
        }));
        handle
    }

    /// The exit codes requested so far, in order.
    #[must_use]
    pub fn exits(&self) -> Vec<i32> {
        self.shared.lock().unwrap().exits.clone()
    }

    /// Announces that the host is about to exit on its own.
    pub fn raise_exiting(&self) {
        let sink = self.shared.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            sink.exiting();
        }
    }
}

struct MockControllerFactory {
    shared: Arc<Mutex<ControllerShared>>,
}

impl ControllerFactory for MockControllerFactory {
    fn order(&self) -> u32 {
        MOCK_ORDER
    }

    fn create(&self, sink: ControllerSink) -> Option<Box<dyn EventLoopController>> {
        self.shared.lock().unwrap().sink = Some(sink);
        Some(Box::new(MockController {
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// An event-loop controller recording exit requests instead of ending the
/// host.
pub struct MockController {
    shared: Arc<Mutex<ControllerShared>>,
}

impl EventLoopController for MockController {
    fn exit(&mut self, exit_code: i32) {
        self.shared.lock().unwrap().exits.push(exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_service::{EventLoop, Service};

    #[test]
    fn default_mocks_drive_a_full_service_lifecycle() {
        let event_loop = EventLoop::new();
        let registry = Registry::default();
        let controller = MockControllerHandle::install(&registry);
        let platform = MockServicePlatformHandle::install(&registry);

        let service = Service::with_registry(event_loop.handle(), registry);
        let handle = service.handle();
        service.on_start(move || handle.set_started());
        let handle = service.handle();
        service.on_stop(move || handle.set_stopped());

        service.run();
        assert!(event_loop.process_until(|| service.state().is_serving()));
        assert_eq!(service.configuration().unwrap().name, "mock-service");

        platform.send_stop();
        assert!(event_loop.process_until(|| service.state().is_stopped()));
        assert_eq!(controller.exits(), vec![0]);
        assert!(platform.commands().contains(&ServiceCommand::Check));
        assert!(platform.commands().contains(&ServiceCommand::Stop));
    }
}
