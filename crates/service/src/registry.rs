//! Process-wide registry of platform backend factories.
//!
//! Each capability holds a list of factories carrying a priority and a
//! platform-applicability test. Selection is deterministic: factories are
//! tried in ascending [`order`](ServicePlatformFactory::order), and the
//! first one that detects the platform and produces a backend wins.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::platform::{
    ConsolePlatform, ConsolePlatformSink, ControllerSink, EventLoopController, ServicePlatform,
    ServicePlatformSink,
};

/// Factory for system service-manager backends.
pub trait ServicePlatformFactory: Send + Sync {
    /// Selection priority; lower values are tried first.
    fn order(&self) -> u32;

    /// Whether this backend applies to the current platform.
    fn detect(&self) -> bool;

    /// Produces a backend wired to the given sink, or `None` to let the next
    /// factory take over.
    fn create(&self, sink: ServicePlatformSink) -> Option<Box<dyn ServicePlatform>>;
}

/// Factory for console backends.
pub trait ConsolePlatformFactory: Send + Sync {
    /// Selection priority; lower values are tried first.
    fn order(&self) -> u32;

    /// Whether this backend applies to the current platform.
    fn detect(&self) -> bool {
        true
    }

    /// Produces a backend wired to the given sink, or `None` to let the next
    /// factory take over.
    fn create(&self, sink: ConsolePlatformSink) -> Option<Box<dyn ConsolePlatform>>;
}

/// Factory for event-loop controllers. Always applicable, so there is no
/// detection step.
pub trait ControllerFactory: Send + Sync {
    /// Selection priority; lower values are tried first.
    fn order(&self) -> u32;

    /// Produces a controller wired to the given sink, or `None` to let the
    /// next factory take over.
    fn create(&self, sink: ControllerSink) -> Option<Box<dyn EventLoopController>>;
}

#[derive(Default)]
struct RegistryInner {
    service_platforms: Mutex<Vec<Arc<dyn ServicePlatformFactory>>>,
    console_platforms: Mutex<Vec<Arc<dyn ConsolePlatformFactory>>>,
    controllers: Mutex<Vec<Arc<dyn ControllerFactory>>>,
}

/// A table of backend factories keyed by capability.
///
/// Clones share the same table. [`Registry::global`] returns the
/// process-wide instance real platform crates register into; tests hand the
/// façade an isolated instance instead.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::default);

impl Registry {
    /// The process-wide registry.
    #[must_use]
    pub fn global() -> Registry {
        GLOBAL.clone()
    }

    /// Adds a service platform factory.
    pub fn register_service_platform(&self, factory: Arc<dyn ServicePlatformFactory>) {
        self.inner.service_platforms.lock().unwrap().push(factory);
    }

    /// Adds a console platform factory.
    pub fn register_console_platform(&self, factory: Arc<dyn ConsolePlatformFactory>) {
        self.inner.console_platforms.lock().unwrap().push(factory);
    }

    /// Adds an event-loop controller factory.
    pub fn register_controller(&self, factory: Arc<dyn ControllerFactory>) {
        self.inner.controllers.lock().unwrap().push(factory);
    }

    /// Selects and creates a service platform backend, or `None` when no
    /// registered factory applies.
    #[must_use]
    pub fn create_service_platform(
        &self,
        sink: ServicePlatformSink,
    ) -> Option<Box<dyn ServicePlatform>> {
        let factories = Self::by_order(&self.inner.service_platforms, |factory| factory.order());
        factories
            .into_iter()
            .filter(|factory| factory.detect())
            .find_map(|factory| factory.create(sink.clone()))
    }

    /// Selects and creates a console platform backend, or `None` when no
    /// registered factory applies.
    #[must_use]
    pub fn create_console_platform(
        &self,
        sink: ConsolePlatformSink,
    ) -> Option<Box<dyn ConsolePlatform>> {
        let factories = Self::by_order(&self.inner.console_platforms, |factory| factory.order());
        factories
            .into_iter()
            .filter(|factory| factory.detect())
            .find_map(|factory| factory.create(sink.clone()))
    }

    /// Selects and creates an event-loop controller, or `None` when no
    /// factory is registered.
    #[must_use]
    pub fn create_controller(&self, sink: ControllerSink) -> Option<Box<dyn EventLoopController>> {
        let factories = Self::by_order(&self.inner.controllers, |factory| factory.order());
        factories
            .into_iter()
            .find_map(|factory| factory.create(sink.clone()))
    }

    // Snapshot under the lock, select outside it: detection and creation run
    // arbitrary backend code.
    fn by_order<T: ?Sized>(
        factories: &Mutex<Vec<Arc<T>>>,
        order: impl Fn(&T) -> u32,
    ) -> Vec<Arc<T>> {
        let mut factories = factories.lock().unwrap().clone();
        factories.sort_by_key(|factory| order(&**factory));
        factories
    }
}
