//! Container runtime backends.
//!
//! Backends implement [`ContainerRuntime`]. The agent picks one by name
//! from a [`RuntimeRegistry`] and never depends on the concrete type.
//!
//! - [`ProcessRuntime`]: one OS process per container, launched through an
//!   [`ImageTool`] and supervised by `procrun-shim`.

pub mod process;
pub mod tool;

pub use self::process::ProcessRuntime;
pub use self::tool::{ImageTool, LaunchPlan};

use crate::runtime::ContainerRuntime;
use std::sync::Arc;

/// Named collection of runtime backends.
#[derive(Default)]
pub struct RuntimeRegistry {
    runtimes: Vec<Arc<dyn ContainerRuntime>>,
}

impl RuntimeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a backend, replacing any backend with the same name.
    pub fn register(&mut self, runtime: Arc<dyn ContainerRuntime>) {
        self.runtimes.retain(|r| r.name() != runtime.name());
        self.runtimes.push(runtime);
    }

    /// Returns all registered backends.
    pub fn all(&self) -> &[Arc<dyn ContainerRuntime>] {
        &self.runtimes
    }

    /// Returns the registered backend names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.runtimes.iter().map(|r| r.name()).collect()
    }

    /// Gets a backend by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ContainerRuntime>> {
        self.runtimes.iter().find(|r| r.name() == name).cloned()
    }
}
