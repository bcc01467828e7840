//! The lifecycle engine: a reentrancy-safe state machine sequencing startup
//! and shutdown across the service and console backends.
//!
//! The engine is single-threaded cooperative. Every observable transition
//! happens inside an activation of [`Engine::advance`], which is only ever
//! entered through a task queued on the host loop. Backend notifications and
//! façade calls mutate the guarded flags and request an advance; the
//! control/regain-control token guarantees at most one activation exists no
//! matter how deeply callbacks re-enter the host loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tracing::{info, warn};

use crate::config::ServiceConfiguration;
use crate::error::{ServiceError, ServiceErrorKind};
use crate::event::{SystemAction, SystemEvent};
use crate::event_loop::{LoopController, LoopHandle};
use crate::platform::{
    ConsolePlatform, ConsolePlatformSink, ControllerSink, EventLoopController, ServicePlatform,
    ServicePlatformSink,
};
use crate::registry::Registry;
use crate::state::{ServicePhase, ServingState, TargetPhase};

const LOG_TARGET: &str = "vigil::service";

/// Steps of the startup sequence, in execution order, with the console
/// branch declared after the service branch it forks from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartingStep {
    None,
    SetUpController,
    SetUpServicePlatform,
    StartServicePlatform,
    RetrieveConfiguration,
    StartServingService,
    SetServiceStateServing,
    SetUpConsolePlatform,
    StartConsolePlatform,
    StartServingConsole,
    SetStateServing,
    Done,
}

/// Steps of the shutdown sequence. The declaration order backs the
/// `stopping >= ExitApplication` comparisons, so it must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum StoppingStep {
    None,
    SetUpController,
    SetServiceStateStopping,
    StopServing,
    SetServiceStateStopped,
    StopServicePlatform,
    StopConsolePlatform,
    ExitApplication,
    SetStateStopped,
    Done,
}

/// Status of the step currently in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Proceeding {
    None,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
}

/// The reentrancy token guarding [`Engine::advance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    None,
    Queueing,
    Processing,
}

/// What an advance iteration decided to do next. Emissions and backend
/// calls are performed by the activation with the state lock released.
enum Directive {
    Continue,
    Idle,
    SetUpController,
    SetUpServicePlatform,
    SetUpConsolePlatform,
    CallService(ServiceCall),
    CallConsole(ConsoleCall),
    ControllerExit(i32),
    EmitStart,
    EmitStop,
    EmitStateChangedServing,
    EmitStateChangedStopped,
    EmitFailed,
}

enum ServiceCall {
    Start,
    Stop,
    SetStateServing,
    SetStateStopping,
    SetStateStopped(i32),
    RetrieveConfiguration,
}

enum ConsoleCall {
    Start,
    Stop,
}

#[derive(Clone, Copy)]
pub(crate) enum CallbackKind {
    Start,
    Stop,
    StateChanged,
    Failed,
}

// Shared `Fn` closures: an emission may re-enter the host loop and reach
// another emission of the same callback while the outer call is still on
// the stack.
pub(crate) type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    start: Option<Callback>,
    stop: Option<Callback>,
    state_changed: Option<Callback>,
    failed: Option<Callback>,
}

impl Callbacks {
    fn slot(&mut self, kind: CallbackKind) -> &mut Option<Callback> {
        match kind {
            CallbackKind::Start => &mut self.start,
            CallbackKind::Stop => &mut self.stop,
            CallbackKind::StateChanged => &mut self.state_changed,
            CallbackKind::Failed => &mut self.failed,
        }
    }
}

struct EngineState {
    state: ServingState,
    running_as_service: Option<bool>,
    configuration: Option<ServiceConfiguration>,
    /// The surfaced error, as observed through the façade.
    error: Option<ServiceError>,
    /// A raw backend error latched for classification.
    raw_error: Option<ServiceError>,
    exit_code: i32,

    with_stop_starting: bool,
    with_running_as_console_application: bool,
    no_running_as_service: bool,
    no_retrieving_configuration: bool,
    no_running_as_console_application: bool,

    starting: StartingStep,
    stopping: StoppingStep,
    proceeding: Proceeding,
    control: Control,
    regain_control: bool,
    processing_recoverable_error: bool,
    error_ignored: bool,
    exiting_abruptly: bool,
    system_events: VecDeque<SystemEvent>,
    // The backend boxes live outside this lock; these flags mirror their
    // presence for the step dispatch.
    has_service_platform: bool,
    has_console_platform: bool,
    has_controller: bool,
}

impl EngineState {
    fn new() -> Self {
        Self {
            state: ServingState::initial(),
            running_as_service: None,
            configuration: None,
            error: None,
            raw_error: None,
            exit_code: 0,
            with_stop_starting: false,
            with_running_as_console_application: false,
            no_running_as_service: false,
            no_retrieving_configuration: false,
            no_running_as_console_application: false,
            starting: StartingStep::None,
            stopping: StoppingStep::None,
            proceeding: Proceeding::None,
            control: Control::None,
            regain_control: false,
            processing_recoverable_error: false,
            error_ignored: false,
            exiting_abruptly: false,
            system_events: VecDeque::new(),
            has_service_platform: false,
            has_console_platform: false,
            has_controller: false,
        }
    }
}

/// Shared engine state behind the façade and the backend sinks.
pub(crate) struct Engine {
    state: Mutex<EngineState>,
    callbacks: Mutex<Callbacks>,
    controller: Mutex<Option<Box<dyn EventLoopController>>>,
    service_platform: Mutex<Option<Box<dyn ServicePlatform>>>,
    console_platform: Mutex<Option<Box<dyn ConsolePlatform>>>,
    liveness: Mutex<Weak<()>>,
    weak_self: Weak<Engine>,
    registry: Registry,
    loop_handle: LoopHandle,
}

impl Engine {
    pub(crate) fn new(loop_handle: LoopHandle, registry: Registry) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: Mutex::new(EngineState::new()),
            callbacks: Mutex::new(Callbacks::default()),
            controller: Mutex::new(None),
            service_platform: Mutex::new(None),
            console_platform: Mutex::new(None),
            liveness: Mutex::new(Weak::new()),
            weak_self: weak_self.clone(),
            registry,
            loop_handle,
        })
    }

    pub(crate) fn set_liveness(&self, liveness: Weak<()>) {
        *self.liveness.lock().unwrap() = liveness;
    }

    pub(crate) fn facade_dropped(&self) {
        *self.callbacks.lock().unwrap() = Callbacks::default();
    }

    // Façade operations.

    pub(crate) fn run(&self) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.state.is_none(), "run() requires the initial state");
        if !st.state.is_none() {
            return;
        }
        st.state.target = TargetPhase::Serving;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn shut_down(&self) {
        let mut st = self.state.lock().unwrap();
        if st.state.is_stopped() {
            return;
        }
        if st.state.target == TargetPhase::Stopped {
            return;
        }
        st.state.target = TargetPhase::Stopped;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn set_started(&self) {
        let mut st = self.state.lock().unwrap();
        if !matches!(
            st.starting,
            StartingStep::StartServingService | StartingStep::StartServingConsole
        ) || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.proceeding = Proceeding::Started;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn set_failed_to_start(&self) {
        let mut st = self.state.lock().unwrap();
        if !matches!(
            st.starting,
            StartingStep::StartServingService | StartingStep::StartServingConsole
        ) || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.state.target = TargetPhase::Stopped;
        st.proceeding = Proceeding::Failed;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn set_stopped(&self) {
        let mut st = self.state.lock().unwrap();
        if st.stopping != StoppingStep::StopServing || st.proceeding != Proceeding::Stopping {
            return;
        }
        st.proceeding = Proceeding::Stopped;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn ignore_error(&self) {
        let mut st = self.state.lock().unwrap();
        if !st.processing_recoverable_error {
            return;
        }
        st.error_ignored = true;
    }

    pub(crate) fn state(&self) -> ServingState {
        self.state.lock().unwrap().state
    }

    pub(crate) fn running_as_service(&self) -> Option<bool> {
        self.state.lock().unwrap().running_as_service
    }

    pub(crate) fn configuration(&self) -> Option<ServiceConfiguration> {
        self.state.lock().unwrap().configuration.clone()
    }

    pub(crate) fn error(&self) -> Option<ServiceError> {
        self.state.lock().unwrap().error.clone()
    }

    pub(crate) fn exit_code(&self) -> i32 {
        self.state.lock().unwrap().exit_code
    }

    pub(crate) fn set_exit_code(&self, exit_code: i32) {
        self.state.lock().unwrap().exit_code = exit_code;
    }

    // Option flags. Fixed once the state leaves its initial value.

    pub(crate) fn set_with_stop_starting(&self) {
        self.set_option(|st| st.with_stop_starting = true);
    }

    pub(crate) fn set_with_running_as_console_application(&self) {
        self.set_option(|st| st.with_running_as_console_application = true);
    }

    pub(crate) fn set_no_running_as_service(&self) {
        self.set_option(|st| st.no_running_as_service = true);
    }

    pub(crate) fn set_no_retrieving_configuration(&self) {
        self.set_option(|st| st.no_retrieving_configuration = true);
    }

    pub(crate) fn set_no_running_as_console_application(&self) {
        self.set_option(|st| st.no_running_as_console_application = true);
    }

    fn set_option(&self, set: impl FnOnce(&mut EngineState)) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.state.is_none(), "options are fixed once the service runs");
        if st.state.is_none() {
            set(&mut st);
        }
    }

    pub(crate) fn with_stop_starting(&self) -> bool {
        self.state.lock().unwrap().with_stop_starting
    }

    pub(crate) fn with_running_as_console_application(&self) -> bool {
        self.state.lock().unwrap().with_running_as_console_application
    }

    pub(crate) fn no_running_as_service(&self) -> bool {
        self.state.lock().unwrap().no_running_as_service
    }

    pub(crate) fn no_retrieving_configuration(&self) -> bool {
        self.state.lock().unwrap().no_retrieving_configuration
    }

    pub(crate) fn no_running_as_console_application(&self) -> bool {
        self.state.lock().unwrap().no_running_as_console_application
    }

    // Callback registration.

    fn set_callback(&self, kind: CallbackKind, callback: Callback) {
        *self.callbacks.lock().unwrap().slot(kind) = Some(callback);
    }

    pub(crate) fn on_start(&self, callback: Callback) {
        self.set_callback(CallbackKind::Start, callback);
    }

    pub(crate) fn on_stop(&self, callback: Callback) {
        self.set_callback(CallbackKind::Stop, callback);
    }

    pub(crate) fn on_state_changed(&self, callback: Callback) {
        self.set_callback(CallbackKind::StateChanged, callback);
    }

    pub(crate) fn on_failed(&self, callback: Callback) {
        self.set_callback(CallbackKind::Failed, callback);
    }

    fn has_callback(&self, kind: CallbackKind) -> bool {
        self.callbacks.lock().unwrap().slot(kind).is_some()
    }

    // Backend notifications. Each one validates that the engine is actually
    // waiting for it; stray notifications are dropped without effect.

    pub(crate) fn service_platform_started(&self) {
        let mut st = self.state.lock().unwrap();
        if st.starting != StartingStep::StartServicePlatform
            || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.proceeding = Proceeding::Started;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn service_platform_failed_to_start(&self, error: ServiceError) {
        let mut st = self.state.lock().unwrap();
        if st.starting != StartingStep::StartServicePlatform
            || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.proceeding = Proceeding::Failed;
        st.raw_error = Some(error);
        self.schedule_advance(&mut st);
    }

    pub(crate) fn service_platform_stopped(&self) {
        let mut st = self.state.lock().unwrap();
        if st.stopping != StoppingStep::StopServicePlatform
            || st.proceeding != Proceeding::Stopping
        {
            return;
        }
        st.proceeding = Proceeding::Stopped;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn service_state_serving_set(&self) {
        let mut st = self.state.lock().unwrap();
        if st.starting != StartingStep::SetServiceStateServing
            || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.proceeding = Proceeding::Started;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn failed_to_set_service_state_serving(&self, error: ServiceError) {
        let mut st = self.state.lock().unwrap();
        if st.starting != StartingStep::SetServiceStateServing
            || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.proceeding = Proceeding::Failed;
        st.raw_error = Some(error);
        self.schedule_advance(&mut st);
    }

    pub(crate) fn service_state_stopping_set(&self) {
        let mut st = self.state.lock().unwrap();
        if st.stopping != StoppingStep::SetServiceStateStopping
            || st.proceeding != Proceeding::Stopping
        {
            return;
        }
        st.proceeding = Proceeding::Stopped;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn service_state_stopped_set(&self) {
        let mut st = self.state.lock().unwrap();
        if st.stopping != StoppingStep::SetServiceStateStopped
            || st.proceeding != Proceeding::Stopping
        {
            return;
        }
        st.proceeding = Proceeding::Stopped;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn service_configuration_retrieved(
        &self,
        configuration: ServiceConfiguration,
    ) {
        let mut st = self.state.lock().unwrap();
        if st.starting != StartingStep::RetrieveConfiguration
            || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.proceeding = Proceeding::Started;
        st.configuration = Some(configuration);
        self.schedule_advance(&mut st);
    }

    pub(crate) fn failed_to_retrieve_service_configuration(
        &self,
        error: ServiceError,
    ) {
        let mut st = self.state.lock().unwrap();
        if st.starting != StartingStep::RetrieveConfiguration
            || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.proceeding = Proceeding::Failed;
        st.raw_error = Some(error);
        self.schedule_advance(&mut st);
    }

    pub(crate) fn console_platform_started(&self) {
        let mut st = self.state.lock().unwrap();
        if st.starting != StartingStep::StartConsolePlatform
            || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.proceeding = Proceeding::Started;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn console_platform_failed_to_start(&self, error: ServiceError) {
        let mut st = self.state.lock().unwrap();
        if st.starting != StartingStep::StartConsolePlatform
            || st.proceeding != Proceeding::Starting
        {
            return;
        }
        st.proceeding = Proceeding::Failed;
        st.raw_error = Some(error);
        self.schedule_advance(&mut st);
    }

    pub(crate) fn console_platform_stopped(&self) {
        let mut st = self.state.lock().unwrap();
        if st.stopping != StoppingStep::StopConsolePlatform
            || st.proceeding != Proceeding::Stopping
        {
            return;
        }
        st.proceeding = Proceeding::Stopped;
        self.schedule_advance(&mut st);
    }

    pub(crate) fn system_event_received(&self, event: SystemEvent) {
        let mut st = self.state.lock().unwrap();
        if st.state.phase == ServicePhase::Stopped || st.stopping >= StoppingStep::ExitApplication
        {
            return;
        }
        st.system_events.push_back(event);
        self.schedule_advance(&mut st);
    }

    pub(crate) fn controller_exiting(&self) {
        let mut st = self.state.lock().unwrap();
        if st.state.phase == ServicePhase::Stopped || st.stopping >= StoppingStep::ExitApplication
        {
            return;
        }
        if st.exiting_abruptly {
            return;
        }
        st.exiting_abruptly = true;
        if st.state.target != TargetPhase::Stopped {
            st.state.target = TargetPhase::Stopped;
            self.schedule_advance(&mut st);
        }
        info!(target: LOG_TARGET, "The application exits unexpectedly.");
    }

    // The reentrancy protocol.

    /// The only way to kick the engine. Queues an advance when none is
    /// queued; asks a processing activation to re-check otherwise.
    fn schedule_advance(&self, st: &mut EngineState) {
        match st.control {
            Control::None => {}
            Control::Queueing => return,
            Control::Processing => {
                st.regain_control = true;
                return;
            }
        }
        st.control = Control::Queueing;
        let engine = self.weak_self.clone();
        self.loop_handle.post(move || {
            if let Some(engine) = engine.upgrade() {
                engine.advance();
            }
        });
    }

    /// Gives up the critical section before a callback emission, re-queueing
    /// if re-entry was requested meanwhile.
    fn lose_control(&self) {
        let mut st = self.state.lock().unwrap();
        st.control = Control::None;
        if st.regain_control {
            st.regain_control = false;
            self.schedule_advance(&mut st);
        }
    }

    /// One activation of the advance routine. Loops until there is nothing
    /// left to do or control was handed to a callback.
    fn advance(&self) {
        if self.liveness.lock().unwrap().upgrade().is_none() {
            let mut st = self.state.lock().unwrap();
            st.control = Control::None;
            return;
        }
        {
            let mut st = self.state.lock().unwrap();
            st.control = Control::Processing;
        }
        loop {
            let directive = {
                let mut st = self.state.lock().unwrap();
                st.regain_control = false;
                self.step(&mut st)
            };
            match directive {
                Directive::Continue => {}
                Directive::Idle => {
                    let mut st = self.state.lock().unwrap();
                    st.control = Control::None;
                    st.regain_control = false;
                    return;
                }
                Directive::SetUpController => self.set_up_controller(),
                Directive::SetUpServicePlatform => self.set_up_service_platform(),
                Directive::SetUpConsolePlatform => self.set_up_console_platform(),
                Directive::CallService(call) => self.call_service_platform(&call),
                Directive::CallConsole(call) => self.call_console_platform(&call),
                Directive::ControllerExit(exit_code) => self.call_controller_exit(exit_code),
                Directive::EmitStart => {
                    // Control is handed to the callback; the sequence resumes
                    // through set_started()/set_failed_to_start().
                    self.lose_control();
                    self.emit(CallbackKind::Start);
                    return;
                }
                Directive::EmitStop => {
                    self.lose_control();
                    self.emit(CallbackKind::Stop);
                    return;
                }
                Directive::EmitStateChangedServing => {
                    self.lose_control();
                    self.emit(CallbackKind::StateChanged);
                    return;
                }
                Directive::EmitStateChangedStopped => {
                    // The lifecycle is finished; the critical section is kept
                    // and released on the way out.
                    self.emit(CallbackKind::StateChanged);
                    let mut st = self.state.lock().unwrap();
                    st.control = Control::None;
                    st.regain_control = false;
                    return;
                }
                Directive::EmitFailed => {
                    let destroyed = self.emit(CallbackKind::Failed);
                    if destroyed {
                        return;
                    }
                    let mut st = self.state.lock().unwrap();
                    st.processing_recoverable_error = false;
                    if st.error_ignored {
                        st.error_ignored = false;
                        st.error = None;
                        info!(target: LOG_TARGET, "Ignoring the error.");
                    } else {
                        st.state.target = TargetPhase::Stopped;
                    }
                }
            }
        }
    }

    /// Consumes the current state and decides the next action. The handling
    /// priority is hardcoded: system events, then the latched error, then
    /// the target dispatch.
    fn step(&self, st: &mut EngineState) -> Directive {
        if !st.system_events.is_empty() && st.stopping < StoppingStep::ExitApplication {
            return Self::process_system_event(st);
        }
        if st.raw_error.is_some() {
            return self.process_error(st);
        }
        match st.state.target {
            TargetPhase::Serving => self.step_starting(st),
            TargetPhase::Stopped => self.step_stopping(st),
            TargetPhase::None => Directive::Idle,
        }
    }

    fn process_system_event(st: &mut EngineState) -> Directive {
        let event = st.system_events.pop_front().expect("checked non-empty");
        match event.action {
            SystemAction::Stop => {
                st.state.target = TargetPhase::Stopped;
                info!(target: LOG_TARGET, "Stop on signal: '{}'.", event.origin);
            }
        }
        Directive::Continue
    }

    fn process_error(&self, st: &mut EngineState) -> Directive {
        let error = st.raw_error.take().expect("checked latched");
        warn!(target: LOG_TARGET, "{}", error.message());

        // An error is only of interest while the engine still drives towards
        // serving.
        if st.state.target != TargetPhase::Serving {
            return Directive::Continue;
        }
        let (filtered, recoverable) = classify(
            error.kind(),
            st.starting,
            st.with_running_as_console_application,
        );
        if recoverable && filtered {
            return Directive::Continue;
        }
        if !filtered {
            st.error = Some(error);
            if self.has_callback(CallbackKind::Failed) {
                st.error_ignored = false;
                st.processing_recoverable_error = recoverable;
                return Directive::EmitFailed;
            }
        }
        st.state.target = TargetPhase::Stopped;
        Directive::Continue
    }

    fn step_starting(&self, st: &mut EngineState) -> Directive {
        match st.starting {
            StartingStep::None => {
                info!(target: LOG_TARGET, "Starting...");
                st.starting = StartingStep::SetUpController;
                Directive::Continue
            }

            StartingStep::SetUpController => {
                st.starting = if st.no_running_as_service {
                    StartingStep::SetUpConsolePlatform
                } else {
                    StartingStep::SetUpServicePlatform
                };
                Directive::SetUpController
            }

            StartingStep::SetUpServicePlatform => match st.proceeding {
                Proceeding::None => Directive::SetUpServicePlatform,
                Proceeding::Started => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::StartServicePlatform;
                    Directive::Continue
                }
                Proceeding::Failed => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::SetUpConsolePlatform;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StartingStep::StartServicePlatform => match st.proceeding {
                Proceeding::None => {
                    st.proceeding = Proceeding::Starting;
                    Directive::CallService(ServiceCall::Start)
                }
                Proceeding::Starting => Directive::Idle,
                Proceeding::Started => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::RetrieveConfiguration;
                    Directive::Continue
                }
                Proceeding::Failed => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::SetUpConsolePlatform;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StartingStep::RetrieveConfiguration => match st.proceeding {
                Proceeding::None => {
                    if st.no_retrieving_configuration {
                        st.starting = StartingStep::StartServingService;
                        return Directive::Continue;
                    }
                    st.proceeding = Proceeding::Starting;
                    Directive::CallService(ServiceCall::RetrieveConfiguration)
                }
                Proceeding::Starting => Directive::Idle,
                // Retrieval failures are recoverable and never gate startup.
                Proceeding::Started | Proceeding::Failed => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::StartServingService;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StartingStep::StartServingService => match st.proceeding {
                Proceeding::None => {
                    st.state.phase = ServicePhase::Starting;
                    st.running_as_service = Some(true);
                    info!(target: LOG_TARGET, "Start serving.");
                    st.proceeding = Proceeding::Starting;
                    if !self.has_callback(CallbackKind::Start) {
                        // Nobody to wait for.
                        st.proceeding = Proceeding::Started;
                        return Directive::Continue;
                    }
                    Directive::EmitStart
                }
                Proceeding::Starting => Directive::Idle,
                Proceeding::Started => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::SetServiceStateServing;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            // Notifying the system of successful initialisation is one of the
            // key responsibilities of a service; failing to do so would get
            // the process killed by the manager after a timeout, so the
            // failure is handled explicitly instead of being ignored.
            StartingStep::SetServiceStateServing => match st.proceeding {
                Proceeding::None => {
                    st.proceeding = Proceeding::Starting;
                    Directive::CallService(ServiceCall::SetStateServing)
                }
                Proceeding::Starting => Directive::Idle,
                Proceeding::Started => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::SetStateServing;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StartingStep::SetUpConsolePlatform => match st.proceeding {
                Proceeding::None => {
                    if st.no_running_as_console_application {
                        st.proceeding = Proceeding::Failed;
                        st.raw_error = Some(ServiceError::new(
                            ServiceErrorKind::FailedToRun,
                            "Failed to run as a console application. \
                             Running as a console application is disabled.",
                        ));
                        return Directive::Continue;
                    }
                    Directive::SetUpConsolePlatform
                }
                Proceeding::Started => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::StartConsolePlatform;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StartingStep::StartConsolePlatform => match st.proceeding {
                Proceeding::None => {
                    st.proceeding = Proceeding::Starting;
                    Directive::CallConsole(ConsoleCall::Start)
                }
                Proceeding::Starting => Directive::Idle,
                Proceeding::Started => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::StartServingConsole;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StartingStep::StartServingConsole => match st.proceeding {
                Proceeding::None => {
                    st.state.phase = ServicePhase::Starting;
                    st.running_as_service = Some(false);
                    info!(target: LOG_TARGET, "Start serving as a console application.");
                    st.proceeding = Proceeding::Starting;
                    if !self.has_callback(CallbackKind::Start) {
                        st.proceeding = Proceeding::Started;
                        return Directive::Continue;
                    }
                    Directive::EmitStart
                }
                Proceeding::Starting => Directive::Idle,
                Proceeding::Started => {
                    st.proceeding = Proceeding::None;
                    st.starting = StartingStep::SetStateServing;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StartingStep::SetStateServing => {
                st.state.phase = ServicePhase::Serving;
                st.state.target = TargetPhase::None;
                info!(target: LOG_TARGET, "Serving...");
                st.starting = StartingStep::Done;
                if !self.has_callback(CallbackKind::StateChanged) {
                    return Directive::Continue;
                }
                Directive::EmitStateChangedServing
            }

            StartingStep::Done => Directive::Idle,
        }
    }

    fn step_stopping(&self, st: &mut EngineState) -> Directive {
        match st.stopping {
            // Map the point startup has reached to the matching entry of the
            // stopping sequence.
            StoppingStep::None => {
                match st.starting {
                    StartingStep::Done => {
                        st.state.phase = ServicePhase::Stopping;
                        st.stopping = StoppingStep::StopServing;
                    }

                    StartingStep::StartServingService | StartingStep::StartServingConsole => {
                        match st.proceeding {
                            Proceeding::Starting => {
                                // Daemons must not be interrupted while they
                                // initialise unless explicitly allowed.
                                if !st.with_stop_starting {
                                    return Directive::Idle;
                                }
                            }
                            Proceeding::Started => {}
                            Proceeding::Failed => {
                                st.state.phase = ServicePhase::Stopping;
                                info!(
                                    target: LOG_TARGET,
                                    "Failed to start serving. Stopping..."
                                );
                                st.proceeding = Proceeding::None;
                                st.stopping = StoppingStep::StopServing;
                                return Directive::Continue;
                            }
                            _ => return Directive::Idle,
                        }
                        st.state.phase = ServicePhase::Stopping;
                        st.proceeding = Proceeding::None;
                        st.stopping = if st.has_service_platform {
                            StoppingStep::SetServiceStateStopping
                        } else {
                            StoppingStep::StopServing
                        };
                    }

                    StartingStep::SetServiceStateServing => {
                        match st.proceeding {
                            Proceeding::Starting => return Directive::Idle,
                            Proceeding::Started | Proceeding::Failed => {}
                            _ => return Directive::Idle,
                        }
                        st.state.phase = ServicePhase::Stopping;
                        st.proceeding = Proceeding::None;
                        st.stopping = StoppingStep::SetServiceStateStopping;
                    }

                    StartingStep::RetrieveConfiguration => {
                        match st.proceeding {
                            Proceeding::Starting => return Directive::Idle,
                            Proceeding::Started | Proceeding::Failed => {}
                            _ => return Directive::Idle,
                        }
                        st.state.phase = ServicePhase::Stopped;
                        st.proceeding = Proceeding::None;
                        st.stopping = StoppingStep::SetServiceStateStopped;
                    }

                    StartingStep::StartServicePlatform => match st.proceeding {
                        Proceeding::Starting => return Directive::Idle,
                        Proceeding::Started => {
                            st.state.phase = ServicePhase::Stopped;
                            st.proceeding = Proceeding::None;
                            st.stopping = StoppingStep::SetServiceStateStopped;
                        }
                        Proceeding::Failed => {
                            st.state.phase = ServicePhase::Stopped;
                            st.proceeding = Proceeding::None;
                            st.stopping = StoppingStep::ExitApplication;
                        }
                        _ => return Directive::Idle,
                    },

                    StartingStep::StartConsolePlatform => match st.proceeding {
                        Proceeding::Starting => return Directive::Idle,
                        Proceeding::Started => {
                            st.state.phase = ServicePhase::Stopped;
                            st.proceeding = Proceeding::None;
                            st.stopping = StoppingStep::StopConsolePlatform;
                        }
                        Proceeding::Failed => {
                            st.state.phase = ServicePhase::Stopped;
                            st.proceeding = Proceeding::None;
                            st.stopping = StoppingStep::ExitApplication;
                        }
                        _ => return Directive::Idle,
                    },

                    StartingStep::SetUpServicePlatform | StartingStep::SetUpConsolePlatform => {
                        st.state.phase = ServicePhase::Stopped;
                        st.proceeding = Proceeding::None;
                        st.stopping = StoppingStep::ExitApplication;
                    }

                    StartingStep::None => {
                        st.state.phase = ServicePhase::Stopped;
                        st.stopping = StoppingStep::SetUpController;
                    }

                    // Transient steps; an external request cannot observe
                    // them.
                    StartingStep::SetUpController | StartingStep::SetStateServing => {
                        return Directive::Idle
                    }
                }
                info!(target: LOG_TARGET, "Stopping...");
                Directive::Continue
            }

            StoppingStep::SetUpController => {
                st.stopping = StoppingStep::ExitApplication;
                Directive::SetUpController
            }

            StoppingStep::SetServiceStateStopping => match st.proceeding {
                Proceeding::None if !st.has_service_platform => {
                    st.stopping = StoppingStep::StopServing;
                    Directive::Continue
                }
                Proceeding::None => {
                    st.proceeding = Proceeding::Stopping;
                    // A failure to report the pending stop is of no interest;
                    // the platform logs it and acknowledges anyway.
                    Directive::CallService(ServiceCall::SetStateStopping)
                }
                Proceeding::Stopping => Directive::Idle,
                Proceeding::Stopped => {
                    st.proceeding = Proceeding::None;
                    st.stopping = StoppingStep::StopServing;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StoppingStep::StopServing => match st.proceeding {
                Proceeding::None => {
                    st.state.phase = ServicePhase::Stopping;
                    info!(target: LOG_TARGET, "Stop serving.");
                    st.proceeding = Proceeding::Stopping;
                    if !self.has_callback(CallbackKind::Stop) {
                        st.proceeding = Proceeding::Stopped;
                        return Directive::Continue;
                    }
                    Directive::EmitStop
                }
                Proceeding::Stopping => Directive::Idle,
                Proceeding::Stopped => {
                    st.proceeding = Proceeding::None;
                    st.stopping = if st.has_service_platform {
                        StoppingStep::SetServiceStateStopped
                    } else {
                        StoppingStep::StopConsolePlatform
                    };
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StoppingStep::SetServiceStateStopped => match st.proceeding {
                Proceeding::None if !st.has_service_platform => {
                    st.stopping = StoppingStep::StopServicePlatform;
                    Directive::Continue
                }
                Proceeding::None => {
                    st.proceeding = Proceeding::Stopping;
                    Directive::CallService(ServiceCall::SetStateStopped(st.exit_code))
                }
                Proceeding::Stopping => Directive::Idle,
                Proceeding::Stopped => {
                    st.proceeding = Proceeding::None;
                    st.stopping = StoppingStep::StopServicePlatform;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StoppingStep::StopServicePlatform => match st.proceeding {
                Proceeding::None if !st.has_service_platform => {
                    st.stopping = StoppingStep::ExitApplication;
                    Directive::Continue
                }
                Proceeding::None => {
                    st.proceeding = Proceeding::Stopping;
                    Directive::CallService(ServiceCall::Stop)
                }
                Proceeding::Stopping => Directive::Idle,
                Proceeding::Stopped => {
                    st.proceeding = Proceeding::None;
                    st.stopping = StoppingStep::ExitApplication;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StoppingStep::StopConsolePlatform => match st.proceeding {
                Proceeding::None if !st.has_console_platform => {
                    st.stopping = StoppingStep::ExitApplication;
                    Directive::Continue
                }
                Proceeding::None => {
                    st.proceeding = Proceeding::Stopping;
                    Directive::CallConsole(ConsoleCall::Stop)
                }
                Proceeding::Stopping => Directive::Idle,
                Proceeding::Stopped => {
                    st.proceeding = Proceeding::None;
                    st.stopping = StoppingStep::ExitApplication;
                    Directive::Continue
                }
                _ => Directive::Idle,
            },

            StoppingStep::ExitApplication => {
                st.system_events.clear();
                st.stopping = StoppingStep::SetStateStopped;
                if st.exiting_abruptly {
                    // The host exits on its own; requesting it again would be
                    // redundant.
                    return Directive::Continue;
                }
                let exit_code = st.exit_code;
                if exit_code == 0 {
                    info!(target: LOG_TARGET, "Exit.");
                } else {
                    info!(target: LOG_TARGET, "Exit with the result: '{exit_code}'.");
                }
                Directive::ControllerExit(exit_code)
            }

            StoppingStep::SetStateStopped => {
                st.state.phase = ServicePhase::Stopped;
                st.state.target = TargetPhase::None;
                info!(target: LOG_TARGET, "Stopped.");
                st.stopping = StoppingStep::Done;
                if !self.has_callback(CallbackKind::StateChanged) {
                    return Directive::Idle;
                }
                Directive::EmitStateChangedStopped
            }

            StoppingStep::Done => Directive::Idle,
        }
    }

    // Backend setup and invocation. All of it runs with the state lock
    // released; the state transitions it causes come back through the
    // notification guards.

    fn set_up_controller(&self) {
        if self.state.lock().unwrap().has_controller {
            return;
        }
        let sink = ControllerSink::new(self.weak_self.clone(), self.loop_handle.clone());
        let controller = self
            .registry
            .create_controller(sink.clone())
            .unwrap_or_else(|| Box::new(LoopController::new(self.loop_handle.clone(), sink)));
        *self.controller.lock().unwrap() = Some(controller);
        self.state.lock().unwrap().has_controller = true;
    }

    fn set_up_service_platform(&self) {
        let sink = ServicePlatformSink::new(self.weak_self.clone(), self.loop_handle.clone());
        let Some(mut platform) = self.registry.create_service_platform(sink) else {
            let mut st = self.state.lock().unwrap();
            st.proceeding = Proceeding::Failed;
            st.raw_error = Some(ServiceError::new(
                ServiceErrorKind::FailedToRun,
                "Failed to run as a service. \
                 There is no implementation suitable for the platform.",
            ));
            return;
        };
        let looks_like_service = platform.check();
        *self.service_platform.lock().unwrap() = Some(platform);
        let mut st = self.state.lock().unwrap();
        st.has_service_platform = true;
        if looks_like_service {
            st.proceeding = Proceeding::Started;
        } else {
            st.proceeding = Proceeding::Failed;
            st.raw_error = Some(ServiceError::new(
                ServiceErrorKind::NotSystemService,
                "Failed to run as a service. \
                 This process is not a service spawned by the system.",
            ));
        }
    }

    fn set_up_console_platform(&self) {
        // The service platform, if any, lost to the console fallback.
        *self.service_platform.lock().unwrap() = None;
        self.state.lock().unwrap().has_service_platform = false;

        let sink = ConsolePlatformSink::new(self.weak_self.clone(), self.loop_handle.clone());
        match self.registry.create_console_platform(sink) {
            Some(platform) => {
                *self.console_platform.lock().unwrap() = Some(platform);
                let mut st = self.state.lock().unwrap();
                st.has_console_platform = true;
                st.proceeding = Proceeding::Started;
            }
            None => {
                let mut st = self.state.lock().unwrap();
                st.proceeding = Proceeding::Failed;
                st.raw_error = Some(ServiceError::new(
                    ServiceErrorKind::FailedToRun,
                    "Failed to run as a console application. \
                     There is no implementation suitable for the platform.",
                ));
            }
        }
    }

    fn call_service_platform(&self, call: &ServiceCall) {
        let mut platform = self.service_platform.lock().unwrap();
        let Some(platform) = platform.as_mut() else {
            return;
        };
        match call {
            ServiceCall::Start => platform.start(),
            ServiceCall::Stop => platform.stop(),
            ServiceCall::SetStateServing => platform.set_state_serving(),
            ServiceCall::SetStateStopping => platform.set_state_stopping(),
            ServiceCall::SetStateStopped(exit_code) => platform.set_state_stopped(*exit_code),
            ServiceCall::RetrieveConfiguration => platform.retrieve_configuration(),
        }
    }

    fn call_console_platform(&self, call: &ConsoleCall) {
        let mut platform = self.console_platform.lock().unwrap();
        let Some(platform) = platform.as_mut() else {
            return;
        };
        match call {
            ConsoleCall::Start => platform.start(),
            ConsoleCall::Stop => platform.stop(),
        }
    }

    fn call_controller_exit(&self, exit_code: i32) {
        let mut controller = self.controller.lock().unwrap();
        if let Some(controller) = controller.as_mut() {
            controller.exit(exit_code);
        }
    }

    /// Invokes a user callback with no engine lock held and reports whether
    /// the façade was destroyed inside it.
    fn emit(&self, kind: CallbackKind) -> bool {
        let callback = self.callbacks.lock().unwrap().slot(kind).clone();
        let Some(callback) = callback else {
            return false;
        };
        let liveness = self.liveness.lock().unwrap().clone();
        let was_alive = liveness.upgrade().is_some();
        (*callback)();
        was_alive && liveness.upgrade().is_none()
    }
}

/// The two-axis error filter keyed on the error kind and the startup step it
/// was raised at.
fn classify(
    kind: ServiceErrorKind,
    starting: StartingStep,
    with_running_as_console_application: bool,
) -> (bool, bool) {
    match kind {
        ServiceErrorKind::NotSystemService => match starting {
            StartingStep::SetUpServicePlatform | StartingStep::StartServicePlatform => {
                (with_running_as_console_application, true)
            }
            _ => (true, false),
        },
        ServiceErrorKind::FailedToRetrieveConfiguration => match starting {
            StartingStep::RetrieveConfiguration => (false, true),
            _ => (true, false),
        },
        ServiceErrorKind::FailedToRun => match starting {
            StartingStep::SetUpServicePlatform
            | StartingStep::StartServicePlatform
            | StartingStep::RetrieveConfiguration
            | StartingStep::SetServiceStateServing
            | StartingStep::SetUpConsolePlatform
            | StartingStep::StartConsolePlatform => (false, false),
            _ => (true, false),
        },
    }
}
