//! The public façade an embedder holds for the lifetime of the service.

use std::sync::Arc;

use crate::config::ServiceConfiguration;
use crate::engine::Engine;
use crate::error::ServiceError;
use crate::event_loop::LoopHandle;
use crate::registry::Registry;
use crate::state::ServingState;

/// The service façade.
///
/// Created in the initial state, driven once through serving and stopping,
/// and dropped once the state is settled again. Dropping it mid-run is a
/// usage error and aborts in debug builds.
///
/// Configuration happens up front: option setters are chainable and only
/// effective while the state is still the initial one. Callbacks registered
/// with the `on_*` methods are invoked on the host loop thread; from inside
/// them (or from any other thread) the service is driven through cloned
/// [`ServiceHandle`]s.
///
/// ```no_run
/// use vigil_service::{EventLoop, Service};
///
/// let event_loop = EventLoop::new();
/// let service = Service::new(event_loop.handle());
/// let handle = service.handle();
/// service
///     .set_with_stop_starting()
///     .on_start(move || {
///         // Bring the workload up, then:
///         handle.set_started();
///     });
/// let handle = service.handle();
/// service.on_stop(move || {
///     // Tear the workload down, then:
///     handle.set_stopped();
/// });
/// service.run();
/// std::process::exit(event_loop.run());
/// ```
pub struct Service {
    handle: ServiceHandle,
    // Held, never read: dropping it is what the engine's emission guard
    // observes through its weak reference.
    _liveness: Arc<()>,
}

/// A cloneable, thread-safe view of a [`Service`].
///
/// Exposes the operations and accessors; configuration and callback
/// registration stay on the façade itself.
#[derive(Clone)]
pub struct ServiceHandle {
    engine: Arc<Engine>,
}

impl Service {
    /// Creates a service scheduled onto the given host loop, selecting
    /// backends from the process-wide registry.
    #[must_use]
    pub fn new(loop_handle: LoopHandle) -> Self {
        Self::with_registry(loop_handle, Registry::global())
    }

    /// Creates a service selecting backends from the given registry instead
    /// of the process-wide one.
    #[must_use]
    pub fn with_registry(loop_handle: LoopHandle, registry: Registry) -> Self {
        let engine = Engine::new(loop_handle, registry);
        let liveness = Arc::new(());
        engine.set_liveness(Arc::downgrade(&liveness));
        Self {
            handle: ServiceHandle { engine },
            _liveness: liveness,
        }
    }

    /// Returns a handle usable from callbacks and other threads.
    #[must_use]
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    // Options. Each setter is a no-op once the lifecycle has started.

    /// Allows [`shut_down`](ServiceHandle::shut_down) to preempt the `start`
    /// callback instead of waiting for its completion.
    pub fn set_with_stop_starting(&self) -> &Self {
        self.handle.engine.set_with_stop_starting();
        self
    }

    /// Whether shutdown may preempt the `start` callback.
    #[must_use]
    pub fn with_stop_starting(&self) -> bool {
        self.handle.engine.with_stop_starting()
    }

    /// Absorbs "not a system service" errors and degrades to console mode
    /// silently.
    pub fn set_with_running_as_console_application(&self) -> &Self {
        self.handle.engine.set_with_running_as_console_application();
        self
    }

    /// Whether "not a system service" errors are absorbed.
    #[must_use]
    pub fn with_running_as_console_application(&self) -> bool {
        self.handle.engine.with_running_as_console_application()
    }

    /// Skips the service platform entirely and runs as a console application
    /// from the start.
    pub fn set_no_running_as_service(&self) -> &Self {
        self.handle.engine.set_no_running_as_service();
        self
    }

    /// Whether the service platform is skipped.
    #[must_use]
    pub fn no_running_as_service(&self) -> bool {
        self.handle.engine.no_running_as_service()
    }

    /// Skips the configuration-retrieval step.
    pub fn set_no_retrieving_configuration(&self) -> &Self {
        self.handle.engine.set_no_retrieving_configuration();
        self
    }

    /// Whether configuration retrieval is skipped.
    #[must_use]
    pub fn no_retrieving_configuration(&self) -> bool {
        self.handle.engine.no_retrieving_configuration()
    }

    /// Never falls back to console mode; failing to run as a service becomes
    /// fatal.
    pub fn set_no_running_as_console_application(&self) -> &Self {
        self.handle.engine.set_no_running_as_console_application();
        self
    }

    /// Whether console fallback is disabled.
    #[must_use]
    pub fn no_running_as_console_application(&self) -> bool {
        self.handle.engine.no_running_as_console_application()
    }

    // Callbacks.

    // Callbacks are `Fn`: an emission may re-enter the host loop and reach
    // the same callback again before the outer call returns. Keep mutable
    // state behind the usual interior-mutability types.

    /// Registers the `start` callback: perform the startup work, then call
    /// [`set_started`](ServiceHandle::set_started) or
    /// [`set_failed_to_start`](ServiceHandle::set_failed_to_start).
    pub fn on_start(&self, callback: impl Fn() + Send + Sync + 'static) -> &Self {
        self.handle.engine.on_start(Arc::new(callback));
        self
    }

    /// Registers the `stop` callback: perform the shutdown work, then call
    /// [`set_stopped`](ServiceHandle::set_stopped).
    pub fn on_stop(&self, callback: impl Fn() + Send + Sync + 'static) -> &Self {
        self.handle.engine.on_stop(Arc::new(callback));
        self
    }

    /// Registers the callback raised whenever the observable
    /// [`ServingState`] changes.
    pub fn on_state_changed(&self, callback: impl Fn() + Send + Sync + 'static) -> &Self {
        self.handle.engine.on_state_changed(Arc::new(callback));
        self
    }

    /// Registers the callback raised once per surfaced error. While it runs,
    /// a recoverable error may be dismissed with
    /// [`ignore_error`](ServiceHandle::ignore_error).
    pub fn on_failed(&self, callback: impl Fn() + Send + Sync + 'static) -> &Self {
        self.handle.engine.on_failed(Arc::new(callback));
        self
    }

    // Operations, delegated to the handle.

    /// Starts the lifecycle. Only valid in the initial state.
    pub fn run(&self) {
        self.handle.run();
    }

    /// Requests shutdown from any state.
    pub fn shut_down(&self) {
        self.handle.shut_down();
    }

    /// Completes the `start` callback's work.
    pub fn set_started(&self) {
        self.handle.set_started();
    }

    /// Fails the `start` callback's work; shutdown follows.
    pub fn set_failed_to_start(&self) {
        self.handle.set_failed_to_start();
    }

    /// Completes the `stop` callback's work.
    pub fn set_stopped(&self) {
        self.handle.set_stopped();
    }

    /// Dismisses the recoverable error currently being reported.
    pub fn ignore_error(&self) {
        self.handle.ignore_error();
    }

    /// The observable serving state.
    #[must_use]
    pub fn state(&self) -> ServingState {
        self.handle.state()
    }

    /// Whether the service runs under the system service manager. Absent
    /// until the lifecycle has settled on a mode.
    #[must_use]
    pub fn running_as_service(&self) -> Option<bool> {
        self.handle.running_as_service()
    }

    /// The retrieved service metadata, if any.
    #[must_use]
    pub fn configuration(&self) -> Option<ServiceConfiguration> {
        self.handle.configuration()
    }

    /// The last surfaced error, if any.
    #[must_use]
    pub fn error(&self) -> Option<ServiceError> {
        self.handle.error()
    }

    /// The exit code passed to the event-loop controller at exit.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.handle.exit_code()
    }

    /// Sets the exit code passed to the event-loop controller at exit.
    pub fn set_exit_code(&self, exit_code: i32) {
        self.handle.set_exit_code(exit_code);
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let state = self.handle.state();
        debug_assert!(
            state.is_stopped() || state.is_none(),
            "service destroyed while running"
        );
        self.handle.engine.facade_dropped();
    }
}

impl ServiceHandle {
    /// Starts the lifecycle. Only valid in the initial state.
    pub fn run(&self) {
        self.engine.run();
    }

    /// Requests shutdown from any state.
    pub fn shut_down(&self) {
        self.engine.shut_down();
    }

    /// Completes the `start` callback's work. A no-op unless the engine is
    /// waiting for it.
    pub fn set_started(&self) {
        self.engine.set_started();
    }

    /// Fails the `start` callback's work. A no-op unless the engine is
    /// waiting for the start completion.
    pub fn set_failed_to_start(&self) {
        self.engine.set_failed_to_start();
    }

    /// Completes the `stop` callback's work. A no-op unless the engine is
    /// waiting for it.
    pub fn set_stopped(&self) {
        self.engine.set_stopped();
    }

    /// Dismisses the recoverable error currently being reported. A no-op
    /// outside the `failed` callback or for fatal errors.
    pub fn ignore_error(&self) {
        self.engine.ignore_error();
    }

    /// The observable serving state.
    #[must_use]
    pub fn state(&self) -> ServingState {
        self.engine.state()
    }

    /// Whether the service runs under the system service manager.
    #[must_use]
    pub fn running_as_service(&self) -> Option<bool> {
        self.engine.running_as_service()
    }

    /// The retrieved service metadata, if any.
    #[must_use]
    pub fn configuration(&self) -> Option<ServiceConfiguration> {
        self.engine.configuration()
    }

    /// The last surfaced error, if any.
    #[must_use]
    pub fn error(&self) -> Option<ServiceError> {
        self.engine.error()
    }

    /// The exit code passed to the event-loop controller at exit.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.engine.exit_code()
    }

    /// Sets the exit code passed to the event-loop controller at exit.
    pub fn set_exit_code(&self, exit_code: i32) {
        self.engine.set_exit_code(exit_code);
    }
}
