//! Shared fixture driving a service against the mock backends.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use vigil_platform_mock::{
    MockConsolePlatformHandle, MockControllerHandle, MockServicePlatformHandle,
};
use vigil_service::{EventLoop, Registry, Service, ServicePhase, ServingState, TargetPhase};

/// A service wired to an isolated registry holding one mock backend per
/// capability, with recording callbacks pre-registered for every signal.
pub struct Fixture {
    pub event_loop: EventLoop,
    pub controller: MockControllerHandle,
    pub service_platform: MockServicePlatformHandle,
    pub console_platform: MockConsolePlatformHandle,
    pub service: Service,
    starts: Arc<Mutex<usize>>,
    stops: Arc<Mutex<usize>>,
    fails: Arc<Mutex<usize>>,
    changes: Arc<Mutex<Vec<ServingState>>>,
}

impl Fixture {
    pub fn new() -> Self {
        let event_loop = EventLoop::new();
        let registry = Registry::default();
        let controller = MockControllerHandle::install(&registry);
        let service_platform = MockServicePlatformHandle::install(&registry);
        let console_platform = MockConsolePlatformHandle::install(&registry);
        let service = Service::with_registry(event_loop.handle(), registry);

        let fixture = Self {
            event_loop,
            controller,
            service_platform,
            console_platform,
            service,
            starts: Arc::default(),
            stops: Arc::default(),
            fails: Arc::default(),
            changes: Arc::default(),
        };
        fixture.on_start(|| {});
        fixture.on_stop(|| {});
        fixture.on_failed(|| {});
        fixture.on_state_changed(|| {});
        fixture
    }

    /// Replaces the `start` callback, keeping the emission count.
    pub fn on_start(&self, callback: impl Fn() + Send + Sync + 'static) {
        let starts = Arc::clone(&self.starts);
        self.service.on_start(move || {
            *starts.lock().unwrap() += 1;
            callback();
        });
    }

    /// Replaces the `stop` callback, keeping the emission count.
    pub fn on_stop(&self, callback: impl Fn() + Send + Sync + 'static) {
        let stops = Arc::clone(&self.stops);
        self.service.on_stop(move || {
            *stops.lock().unwrap() += 1;
            callback();
        });
    }

    /// Replaces the `failed` callback, keeping the emission count.
    pub fn on_failed(&self, callback: impl Fn() + Send + Sync + 'static) {
        let fails = Arc::clone(&self.fails);
        self.service.on_failed(move || {
            *fails.lock().unwrap() += 1;
            callback();
        });
    }

    /// Replaces the `state_changed` callback, keeping the change record.
    pub fn on_state_changed(&self, callback: impl Fn() + Send + Sync + 'static) {
        let changes = Arc::clone(&self.changes);
        let handle = self.service.handle();
        self.service.on_state_changed(move || {
            changes.lock().unwrap().push(handle.state());
            callback();
        });
    }

    /// Completes `start` as soon as it is emitted.
    pub fn auto_start(&self) {
        let handle = self.service.handle();
        self.on_start(move || handle.set_started());
    }

    /// Completes `stop` as soon as it is emitted.
    pub fn auto_stop(&self) {
        let handle = self.service.handle();
        self.on_stop(move || handle.set_stopped());
    }

    pub fn starts(&self) -> usize {
        *self.starts.lock().unwrap()
    }

    pub fn stops(&self) -> usize {
        *self.stops.lock().unwrap()
    }

    pub fn fails(&self) -> usize {
        *self.fails.lock().unwrap()
    }

    pub fn changes(&self) -> Vec<ServingState> {
        self.changes.lock().unwrap().clone()
    }

    /// Runs queued work until the service reports serving.
    pub fn drive_until_serving(&self) -> bool {
        self.event_loop
            .process_until(|| self.service.state().is_serving())
    }

    /// Runs queued work until the service reports stopped.
    pub fn drive_until_stopped(&self) -> bool {
        self.event_loop
            .process_until(|| self.service.state().is_stopped())
    }

    /// Runs queued work until the `start` callback has been emitted.
    pub fn drive_until_started(&self) -> bool {
        self.event_loop.process_until(|| self.starts() > 0)
    }

    /// Runs all queued work, including work queued while draining.
    pub fn drain(&self) {
        while self.event_loop.process_pending() > 0 {}
    }
}

/// The change record of a lifecycle that stopped without ever serving.
pub fn straight_to_stopped() -> Vec<ServingState> {
    vec![ServingState {
        phase: ServicePhase::Stopped,
        target: TargetPhase::None,
    }]
}

/// The change record of a lifecycle that served and then stopped.
pub fn serving_then_stopped() -> Vec<ServingState> {
    vec![
        ServingState {
            phase: ServicePhase::Serving,
            target: TargetPhase::None,
        },
        ServingState {
            phase: ServicePhase::Stopped,
            target: TargetPhase::None,
        },
    ]
}
