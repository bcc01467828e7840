//! Shutdown ordering, external exits, and late system events.

mod common;

use common::{serving_then_stopped, Fixture};
use vigil_platform_mock::ConsoleCommand;
use vigil_service::{ServicePhase, SystemEvent};

#[test]
fn controller_exit_preempts_without_a_second_exit_request() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();

    fixture.service.run();
    assert!(fixture.drive_until_serving());

    fixture.controller.raise_exiting();

    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.changes(), serving_then_stopped());
    // The host is already exiting; the engine must not ask it to again.
    assert!(fixture.controller.exits().is_empty());
}

#[test]
fn system_events_are_still_processed_while_stopping() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();
    fixture.service.set_no_running_as_service();
    fixture.console_platform.defer_stop();
    {
        let console = fixture.console_platform.clone();
        let handle = fixture.service.handle();
        fixture.on_state_changed(move || {
            if handle.state().is_serving() {
                console.send_stop();
            }
        });
    }

    fixture.service.run();
    fixture.drain();

    // The console platform holds its stop acknowledgement back, so the
    // engine sits in the stopping sequence.
    assert_eq!(fixture.service.state().phase, ServicePhase::Stopping);
    assert!(fixture
        .console_platform
        .commands()
        .contains(&ConsoleCommand::Stop));

    // A stop event arriving now is consumed without disturbing the
    // sequence.
    fixture
        .console_platform
        .send_event(SystemEvent::stop("second"));
    fixture.drain();
    assert_eq!(fixture.service.state().phase, ServicePhase::Stopping);

    fixture.console_platform.complete_stop();
    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.changes(), serving_then_stopped());
}

#[test]
fn system_events_after_shutdown_are_dropped() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();

    fixture.service.run();
    assert!(fixture.drive_until_serving());
    fixture.service.shut_down();
    assert!(fixture.drive_until_stopped());

    let changes = fixture.changes();
    fixture.service_platform.send_stop();
    fixture.drain();

    assert!(fixture.service.state().is_stopped());
    assert_eq!(fixture.changes(), changes);
    assert_eq!(fixture.controller.exits(), vec![0]);
}

#[test]
fn shut_down_after_serving_runs_the_full_stopping_sequence() {
    let fixture = Fixture::new();
    fixture.auto_start();
    fixture.auto_stop();

    fixture.service.run();
    assert!(fixture.drive_until_serving());
    assert_eq!(fixture.stops(), 0);

    fixture.service.shut_down();
    assert!(fixture.drive_until_stopped());
    assert_eq!(fixture.stops(), 1);
    assert_eq!(fixture.changes(), serving_then_stopped());
    assert_eq!(fixture.controller.exits(), vec![0]);
}
