//! A local, in-process task coordinator for scheduling resource-constrained background work on
//! a single machine: build a [`ResourceManifest`] per task, describe the machine's capacity on
//! a [`TaskCoordinator`], `start()` it, and `schedule` work.
//!
//! This crate is a thin facade over two library crates kept independently publishable:
//! [`taskforge_resources`] (manifests, the resource budget, cancellation) and
//! [`taskforge_coordinator`] (task/environment contracts, the worker pool, the scheduling loop
//! itself).

pub use taskforge_coordinator::{
    CoordinatorError, CoordinatorOptions, Task, TaskCoordinator, TaskEnvironment, ThreadedTask,
    WorkerPool,
};
pub use taskforge_resources::{
    CancellationTrigger, CancellationWatcher, CanceledError, ManifestError, ResourceBudget,
    ResourceEntry, ResourceKind, ResourceManifest, UnitSelection, RESOURCE_KIND_COUNT,
};
