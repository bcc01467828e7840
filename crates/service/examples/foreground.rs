//! A foreground service that serves until a terminal signal arrives.
//!
//! Run with `cargo run -p vigil-service --example foreground`, then stop it
//! with Ctrl-C.

use vigil_service::{EventLoop, Service};

fn main() {
    tracing_subscriber::fmt().init();

    vigil_platform_console::register();

    let event_loop = EventLoop::new();
    let service = Service::new(event_loop.handle());
    service.set_no_running_as_service();

    let handle = service.handle();
    service.on_start(move || {
        println!("serving; press Ctrl-C to stop");
        handle.set_started();
    });
    let handle = service.handle();
    service.on_stop(move || handle.set_stopped());

    service.run();
    let exit_code = event_loop.run();
    drop(service);
    std::process::exit(exit_code);
}
