use taskforge_resources::{CancellationWatcher, ResourceManifest, UnitSelection};

/// Opaque unit of scheduled work. The coordinator never inspects a task's internals beyond its
/// resource manifest; identity for `cancel`/`prioritize` purposes is by `Arc` pointer.
pub trait Task: Send + Sync {
    /// Stable for the task's entire scheduled lifetime.
    fn used_resources(&self) -> &ResourceManifest;

    /// Executed on a worker thread once the coordinator has reserved `unit_indices` against
    /// this task's manifest. Must not unwind across this boundary: the coordinator catches
    /// panics at the dispatch site, but implementations should prefer to handle their own
    /// errors internally and consult `watcher` periodically to observe cooperative
    /// cancellation.
    fn run(&self, unit_indices: &UnitSelection, watcher: &CancellationWatcher);
}
