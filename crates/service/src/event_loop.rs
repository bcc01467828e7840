//! A minimal host event queue the lifecycle engine schedules itself onto.
//!
//! The engine never runs a loop of its own; it only posts tasks. Hosts
//! without an event loop of their own run [`EventLoop::run`]; hosts with one
//! drain the queue from it via [`EventLoop::process_pending`]. All processing
//! methods are reentrant: a task, or a service callback running inside one,
//! may pump the queue again.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::platform::{ControllerSink, EventLoopController};

type Task = Box<dyn FnOnce() + Send + 'static>;
type ExitSubscriber = Box<dyn FnMut() + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    exit: Option<i32>,
}

struct LoopShared {
    state: Mutex<QueueState>,
    available: Condvar,
    exiting: Mutex<Vec<ExitSubscriber>>,
}

/// The host event queue.
///
/// Cheap to clone; all clones share the same queue.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

/// A cloneable, thread-safe handle for posting tasks to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    /// Creates an empty event queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LoopShared {
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    exit: None,
                }),
                available: Condvar::new(),
                exiting: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns a handle for posting tasks from any thread.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Processes tasks, blocking while the queue is empty, until
    /// [`LoopHandle::exit`] is called. Returns the exit code.
    pub fn run(&self) -> i32 {
        loop {
            let task = {
                let mut state = self.shared.state.lock().unwrap();
                loop {
                    if let Some(code) = state.exit {
                        return code;
                    }
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    state = self.shared.available.wait(state).unwrap();
                }
            };
            task();
        }
    }

    /// Runs the tasks queued at the time of the call and returns how many
    /// ran. Tasks posted while processing are left for the next call.
    pub fn process_pending(&self) -> usize {
        let pending = self.shared.state.lock().unwrap().tasks.len();
        let mut processed = 0;
        for _ in 0..pending {
            let Some(task) = self.shared.state.lock().unwrap().tasks.pop_front() else {
                break;
            };
            task();
            processed += 1;
        }
        processed
    }

    /// Runs queued tasks until the predicate holds. Returns false if the
    /// queue drained without the predicate becoming true.
    pub fn process_until(&self, mut predicate: impl FnMut() -> bool) -> bool {
        loop {
            if predicate() {
                return true;
            }
            let task = self.shared.state.lock().unwrap().tasks.pop_front();
            match task {
                Some(task) => task(),
                None => return false,
            }
        }
    }

    /// Whether an exit was requested, and with which code.
    #[must_use]
    pub fn exit_requested(&self) -> Option<i32> {
        self.shared.state.lock().unwrap().exit
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopHandle {
    /// Enqueues a task for the host thread.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        state.tasks.push_back(Box::new(task));
        self.shared.available.notify_one();
    }

    /// Requests the loop to exit with the given code.
    ///
    /// The first call wins; it wakes [`EventLoop::run`] and notifies the
    /// subscribers registered with [`LoopHandle::on_exiting`] exactly once.
    pub fn exit(&self, exit_code: i32) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.exit.is_some() {
                return;
            }
            state.exit = Some(exit_code);
            self.shared.available.notify_all();
        }
        // One-shot: taken out so a subscriber may safely touch the loop.
        let mut subscribers = std::mem::take(&mut *self.shared.exiting.lock().unwrap());
        for subscriber in &mut subscribers {
            subscriber();
        }
    }

    /// Subscribes to the exit request notification.
    pub fn on_exiting(&self, subscriber: impl FnMut() + Send + 'static) {
        self.shared
            .exiting
            .lock()
            .unwrap()
            .push(Box::new(subscriber));
    }
}

/// The default event-loop controller, backed by the [`EventLoop`] itself.
///
/// Used by the lifecycle engine when no controller factory is registered.
pub struct LoopController {
    handle: LoopHandle,
}

impl LoopController {
    /// Wires the controller to the loop behind `handle`, relaying the loop's
    /// exit request as the `exiting` notification.
    #[must_use]
    pub fn new(handle: LoopHandle, sink: ControllerSink) -> Self {
        handle.on_exiting(move || sink.exiting());
        Self { handle }
    }
}

impl EventLoopController for LoopController {
    fn exit(&mut self, exit_code: i32) {
        self.handle.exit(exit_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn processes_posted_tasks_in_order() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        for value in 0..3 {
            let order = Arc::clone(&order);
            handle.post(move || order.lock().unwrap().push(value));
        }
        assert_eq!(event_loop.process_pending(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn pending_snapshot_excludes_tasks_posted_while_processing() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let handle = handle.clone();
            let count = Arc::clone(&count);
            handle.clone().post(move || {
                count.fetch_add(1, Ordering::SeqCst);
                let count = Arc::clone(&count);
                handle.post(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            });
        }
        assert_eq!(event_loop.process_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(event_loop.process_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nested_processing_is_supported() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let inner_loop = event_loop.clone();
            let inner_handle = handle.clone();
            let seen = Arc::clone(&seen);
            handle.post(move || {
                let seen_inner = Arc::clone(&seen);
                inner_handle.post(move || {
                    seen_inner.fetch_add(1, Ordering::SeqCst);
                });
                // Pump the queue from inside a task.
                inner_loop.process_until(|| seen.load(Ordering::SeqCst) == 1);
            });
        }
        event_loop.process_pending();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_exit_code_wins_and_notifies_once() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let notified = Arc::new(AtomicUsize::new(0));
        {
            let notified = Arc::clone(&notified);
            handle.on_exiting(move || {
                notified.fetch_add(1, Ordering::SeqCst);
            });
        }
        handle.exit(3);
        handle.exit(5);
        assert_eq!(event_loop.exit_requested(), Some(3));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(event_loop.run(), 3);
    }

    #[test]
    fn run_returns_after_exit_posted_from_task() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        {
            let handle = handle.clone();
            event_loop.handle().post(move || handle.exit(7));
        }
        assert_eq!(event_loop.run(), 7);
    }
}
