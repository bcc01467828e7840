//! Console fallback and error classification paths.

mod common;

use common::{serving_then_stopped, straight_to_stopped, Fixture};
use vigil_platform_mock::{MockConsolePlatformHandle, MockControllerHandle};
use vigil_service::{
    EventLoop, Registry, Service, ServiceError, ServiceErrorKind,
};

fn not_system_service() -> ServiceError {
    ServiceError::new(
        ServiceErrorKind::NotSystemService,
        "Failed to start. Emulating not a service error.",
    )
}

fn failed_to_run() -> ServiceError {
    ServiceError::new(
        ServiceErrorKind::FailedToRun,
        "Failed to start. Emulating failed to start error.",
    )
}

/// Arranges the common console-fallback choreography: auto-complete both
/// callbacks and stop through the console once serving.
fn stop_from_console_once_serving(fixture: &Fixture) {
    fixture.auto_start();
    fixture.auto_stop();
    let console = fixture.console_platform.clone();
    let handle = fixture.service.handle();
    fixture.on_state_changed(move || {
        if handle.state().is_serving() {
            console.send_stop();
        }
    });
}

#[test]
fn console_application_flag_absorbs_failed_check() {
    let fixture = Fixture::new();
    stop_from_console_once_serving(&fixture);
    fixture.service_platform.set_check(false);
    fixture.service.set_with_running_as_console_application();

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert!(fixture.starts() > 0);
    assert_eq!(fixture.service.running_as_service(), Some(false));
    assert!(fixture.service.configuration().is_none());
    assert_eq!(fixture.changes(), serving_then_stopped());
    assert_eq!(fixture.fails(), 0);
}

#[test]
fn console_application_flag_absorbs_failed_platform_start() {
    let fixture = Fixture::new();
    stop_from_console_once_serving(&fixture);
    fixture.service_platform.fail_start(not_system_service());
    fixture.service.set_with_running_as_console_application();

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert!(fixture.starts() > 0);
    assert_eq!(fixture.service.running_as_service(), Some(false));
    assert!(fixture.service.configuration().is_none());
    assert_eq!(fixture.changes(), serving_then_stopped());
    assert_eq!(fixture.fails(), 0);
}

#[test]
fn ignoring_not_system_service_falls_back_to_console() {
    let fixture = Fixture::new();
    stop_from_console_once_serving(&fixture);
    fixture.service_platform.set_check(false);
    {
        let handle = fixture.service.handle();
        fixture.on_failed(move || handle.ignore_error());
    }

    fixture.service.run();

    assert!(fixture.drive_until_started());
    assert_eq!(fixture.service.running_as_service(), Some(false));
    assert!(fixture.service.configuration().is_none());
    assert!(fixture.service.error().is_none());
    assert_eq!(fixture.fails(), 1);

    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.changes(), serving_then_stopped());
}

#[test]
fn ignoring_not_system_service_from_platform_start_falls_back_to_console() {
    let fixture = Fixture::new();
    stop_from_console_once_serving(&fixture);
    fixture.service_platform.fail_start(not_system_service());
    {
        let handle = fixture.service.handle();
        fixture.on_failed(move || handle.ignore_error());
    }

    fixture.service.run();

    assert!(fixture.drive_until_started());
    assert_eq!(fixture.service.running_as_service(), Some(false));
    assert!(fixture.service.error().is_none());
    assert_eq!(fixture.fails(), 1);

    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.changes(), serving_then_stopped());
}

#[test]
fn unignored_not_system_service_stops_the_lifecycle() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();
    fixture.service_platform.set_check(false);

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.starts(), 0);
    assert_eq!(fixture.fails(), 1);
    let error = fixture.service.error().unwrap();
    assert_eq!(error.kind(), ServiceErrorKind::NotSystemService);
    assert!(error.recoverable());
    assert_eq!(fixture.changes(), straight_to_stopped());
    assert!(!fixture.console_platform.touched());
}

#[test]
fn skipping_the_service_platform_runs_as_console_application() {
    let fixture = Fixture::new();
    {
        let handle = fixture.service.handle();
        fixture.on_start(move || {
            handle.set_started();
            handle.shut_down();
        });
    }
    fixture.auto_stop();
    fixture.service.set_no_running_as_service();

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert!(fixture.starts() > 0);
    assert_eq!(fixture.service.running_as_service(), Some(false));
    assert!(fixture.service.configuration().is_none());
    assert!(fixture.service.error().is_none());
    assert_eq!(fixture.fails(), 0);
    assert_eq!(fixture.changes(), straight_to_stopped());

    // The service platform was never consulted.
    assert!(!fixture.service_platform.touched());
}

#[test]
fn ignoring_configuration_retrieval_failure_keeps_serving() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();
    {
        let platform = fixture.service_platform.clone();
        let handle = fixture.service.handle();
        fixture.on_state_changed(move || {
            if handle.state().is_serving() {
                platform.send_stop();
            }
        });
    }
    fixture.service_platform.fail_retrieve_configuration(ServiceError::new(
        ServiceErrorKind::FailedToRetrieveConfiguration,
        "Failed to retrieve service configuration. Emulating the failure.",
    ));
    {
        let handle = fixture.service.handle();
        fixture.on_failed(move || handle.ignore_error());
    }

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert!(fixture.starts() > 0);
    assert_eq!(fixture.service.running_as_service(), Some(true));
    assert!(fixture.service.configuration().is_none());
    assert_eq!(fixture.fails(), 1);
    assert_eq!(fixture.changes(), serving_then_stopped());
}

#[test]
fn unignored_configuration_retrieval_failure_stops_the_lifecycle() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();
    fixture.service_platform.fail_retrieve_configuration(ServiceError::new(
        ServiceErrorKind::FailedToRetrieveConfiguration,
        "Failed to retrieve service configuration. Emulating the failure.",
    ));

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.starts(), 0);
    assert_eq!(fixture.fails(), 1);
    let error = fixture.service.error().unwrap();
    assert_eq!(error.kind(), ServiceErrorKind::FailedToRetrieveConfiguration);
    assert_eq!(fixture.changes(), straight_to_stopped());
}

#[test]
fn fatal_platform_start_failure_shuts_down() {
    let fixture = Fixture::new();
    fixture.service_platform.fail_start(failed_to_run());

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.starts(), 0);
    assert_eq!(fixture.fails(), 1);
    assert_eq!(fixture.changes(), straight_to_stopped());
}

#[test]
fn fatal_console_start_failure_shuts_down() {
    let fixture = Fixture::new();
    fixture.console_platform.fail_start(failed_to_run());
    fixture.service.set_no_running_as_service();

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.starts(), 0);
    assert_eq!(fixture.fails(), 1);
    assert_eq!(fixture.changes(), straight_to_stopped());
}

#[test]
fn failing_to_report_serving_shuts_down_with_stop() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();
    fixture.service_platform.fail_set_state_serving(ServiceError::new(
        ServiceErrorKind::FailedToRun,
        "Failed to start. Emulating failed to set state serving error.",
    ));

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert!(fixture.starts() > 0);
    // The user already performed startup work; the full stopping sequence,
    // including `stop`, lets it be released.
    assert!(fixture.stops() > 0);
    assert_eq!(fixture.fails(), 1);
    assert_eq!(fixture.changes(), straight_to_stopped());
}

#[test]
fn disabled_console_fallback_is_fatal() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();
    fixture
        .service
        .set_no_running_as_service()
        .set_no_running_as_console_application();

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.starts(), 0);
    assert_eq!(fixture.fails(), 1);
    let error = fixture.service.error().unwrap();
    assert_eq!(error.kind(), ServiceErrorKind::FailedToRun);
    assert!(!fixture.console_platform.touched());
    assert_eq!(fixture.changes(), straight_to_stopped());
}

#[test]
fn disabled_console_fallback_turns_absorbed_errors_fatal() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();
    fixture.service_platform.set_check(false);
    fixture
        .service
        .set_with_running_as_console_application()
        .set_no_running_as_console_application();

    fixture.service.run();

    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.starts(), 0);
    assert_eq!(fixture.fails(), 1);
    assert_eq!(
        fixture.service.error().unwrap().kind(),
        ServiceErrorKind::FailedToRun
    );
    assert!(!fixture.console_platform.touched());
}

#[test]
fn missing_service_platform_implementation_is_fatal() {
    let event_loop = EventLoop::new();
    let registry = Registry::default();
    let controller = MockControllerHandle::install(&registry);
    let console = MockConsolePlatformHandle::install(&registry);
    let service = Service::with_registry(event_loop.handle(), registry);
    service.set_no_running_as_console_application();

    service.run();

    assert!(event_loop.process_until(|| service.state().is_stopped()));
    let error = service.error().unwrap();
    assert_eq!(error.kind(), ServiceErrorKind::FailedToRun);
    assert!(!console.touched());
    assert_eq!(controller.exits(), vec![0]);
}
