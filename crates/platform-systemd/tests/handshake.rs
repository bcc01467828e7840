//! End-to-end handshake against a stand-in notification socket.

use std::os::unix::net::UnixDatagram;

use vigil_service::{EventLoop, Registry, Service};

#[test]
fn speaks_the_notify_protocol_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notify.sock");
    let manager = UnixDatagram::bind(&path).unwrap();
    manager.set_nonblocking(true).unwrap();
    std::env::set_var("NOTIFY_SOCKET", &path);

    let event_loop = EventLoop::new();
    let registry = Registry::default();
    vigil_platform_systemd::register_in(&registry);

    let service = Service::with_registry(event_loop.handle(), registry);
    service.set_no_retrieving_configuration();
    let handle = service.handle();
    service.on_start(move || handle.set_started());
    let handle = service.handle();
    service.on_stop(move || handle.set_stopped());

    service.run();
    assert!(event_loop.process_until(|| service.state().is_serving()));
    assert_eq!(service.running_as_service(), Some(true));

    // The manager asks the service to stop.
    signal_hook::low_level::raise(signal_hook::consts::signal::SIGTERM).unwrap();

    // The default controller ends the loop once the lifecycle is done.
    let exit_code = event_loop.run();
    assert_eq!(exit_code, 0);
    assert!(service.state().is_stopped());

    let mut states = String::new();
    let mut buffer = [0_u8; 256];
    while let Ok(size) = manager.recv(&mut buffer) {
        states.push_str(&String::from_utf8_lossy(&buffer[..size]));
        states.push('\n');
    }
    assert!(states.contains("STATUS=Starting..."), "in:\n{states}");
    assert!(states.contains("READY=1"), "in:\n{states}");
    assert!(states.contains("STOPPING=1"), "in:\n{states}");
    assert!(states.contains("STATUS=Stopped."), "in:\n{states}");

    std::env::remove_var("NOTIFY_SOCKET");
}
