//! Unix console backend.
//!
//! Treats the process as a foreground application: terminal and session
//! signals are watched on a dedicated thread and relayed to the engine as
//! queued stop events. A session-end signal additionally parks the watcher
//! until the engine has driven the platform's `stop()`, so a session-end
//! burst cannot race the embedder's shutdown work.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use once_cell::sync::Lazy;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::backend::Handle;
use signal_hook::iterator::Signals;
use tracing::debug;
use vigil_service::platform::{ConsolePlatform, ConsolePlatformSink};
use vigil_service::registry::{ConsolePlatformFactory, Registry};
use vigil_service::{ServiceError, ServiceErrorKind, SystemEvent};

/// Default selection priority; embedder-registered backends with a lower
/// order win.
pub const DEFAULT_ORDER: u32 = 99;

// Only one platform instance may own the process-wide signal subscription.
static SUBSCRIBED: Lazy<Mutex<bool>> = Lazy::new(Mutex::default);

/// Registers the console backend in the process-wide registry.
pub fn register() {
    register_in(&Registry::global());
}

/// Registers the console backend in the given registry.
pub fn register_in(registry: &Registry) {
    registry.register_console_platform(Arc::new(ConsoleSignalPlatformFactory));
}

/// Factory producing [`ConsoleSignalPlatform`] instances.
pub struct ConsoleSignalPlatformFactory;

impl ConsolePlatformFactory for ConsoleSignalPlatformFactory {
    fn order(&self) -> u32 {
        DEFAULT_ORDER
    }

    fn detect(&self) -> bool {
        cfg!(unix)
    }

    fn create(&self, sink: ConsolePlatformSink) -> Option<Box<dyn ConsolePlatform>> {
        Some(Box::new(ConsoleSignalPlatform::new(sink)))
    }
}

fn origin(signal: i32) -> &'static str {
    match signal {
        SIGINT => "interrupt",
        SIGTERM => "terminate",
        SIGQUIT => "quit",
        SIGHUP => "hangup",
        _ => "unknown",
    }
}

#[derive(Default)]
struct SessionLatch {
    released: Mutex<bool>,
    condvar: Condvar,
}

impl SessionLatch {
    fn wait(&self) {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.condvar.wait(released).unwrap();
        }
    }

    fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.condvar.notify_all();
    }
}

struct SignalWatcher {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
    latch: Arc<SessionLatch>,
}

impl SignalWatcher {
    fn spawn(sink: ConsolePlatformSink) -> io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGHUP])?;
        let handle = signals.handle();
        let latch = Arc::new(SessionLatch::default());
        let watcher_latch = Arc::clone(&latch);
        let thread = thread::Builder::new()
            .name("vigil-console-signals".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    debug!(target: "vigil::console", "Relaying signal: '{}'.", origin(signal));
                    sink.event_received(SystemEvent::stop(origin(signal)));
                    // The session is ending; hold this thread until the
                    // engine has wound the platform down.
                    if signal == SIGHUP {
                        watcher_latch.wait();
                    }
                }
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
            latch,
        })
    }

    fn close(&mut self) {
        self.latch.release();
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

/// The Unix rendition of the console platform.
pub struct ConsoleSignalPlatform {
    sink: ConsolePlatformSink,
    watcher: Option<SignalWatcher>,
}

impl ConsoleSignalPlatform {
    fn new(sink: ConsolePlatformSink) -> Self {
        Self {
            sink,
            watcher: None,
        }
    }

    fn teardown(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.close();
            *SUBSCRIBED.lock().unwrap() = false;
        }
    }
}

impl ConsolePlatform for ConsoleSignalPlatform {
    fn start(&mut self) {
        {
            let mut subscribed = SUBSCRIBED.lock().unwrap();
            if *subscribed {
                self.sink.failed_to_start(ServiceError::new(
                    ServiceErrorKind::FailedToRun,
                    "Failed to run as a console application. \
                     Another instance is already subscribed to console events.",
                ));
                return;
            }
            *subscribed = true;
        }
        match SignalWatcher::spawn(self.sink.clone()) {
            Ok(watcher) => {
                self.watcher = Some(watcher);
                self.sink.started();
            }
            Err(error) => {
                *SUBSCRIBED.lock().unwrap() = false;
                self.sink.failed_to_start(ServiceError::new(
                    ServiceErrorKind::FailedToRun,
                    format!(
                        "Failed to run as a console application. \
                         Failed to subscribe to console events: {error}."
                    ),
                ));
            }
        }
    }

    fn stop(&mut self) {
        self.teardown();
        self.sink.stopped();
    }
}

impl Drop for ConsoleSignalPlatform {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_map_to_event_origins() {
        assert_eq!(origin(SIGINT), "interrupt");
        assert_eq!(origin(SIGTERM), "terminate");
        assert_eq!(origin(SIGQUIT), "quit");
        assert_eq!(origin(SIGHUP), "hangup");
    }

    #[test]
    fn a_released_latch_does_not_block() {
        let latch = SessionLatch::default();
        latch.release();
        latch.wait();
    }
}
