use taskforge_resources::{CancellationWatcher, ResourceManifest, UnitSelection};

use crate::task::Task;

/// Wraps a data-parallel task body so it fans out across up to `N` threads and waits for all of
/// them before `run` returns. `N == 1` runs entirely on the caller's thread; `std::thread::scope`
/// already joins every spawned thread before propagating a panic, so that guarantee falls out of
/// the standard library rather than needing to be hand-rolled.
pub struct ThreadedTask<F> {
    max_threads: usize,
    resources: ResourceManifest,
    threaded_run: F,
}

impl<F> ThreadedTask<F>
where
    F: Fn(&UnitSelection, &CancellationWatcher) + Send + Sync,
{
    /// Panics if `max_threads == 0`: this is a programming error, not a runtime condition a
    /// caller should be handed a `Result` for.
    pub fn new(max_threads: usize, resources: ResourceManifest, threaded_run: F) -> Self {
        assert!(max_threads > 0, "ThreadedTask requires at least one thread");
        Self {
            max_threads,
            resources,
            threaded_run,
        }
    }
}

impl<F> Task for ThreadedTask<F>
where
    F: Fn(&UnitSelection, &CancellationWatcher) + Send + Sync,
{
    fn used_resources(&self) -> &ResourceManifest {
        &self.resources
    }

    fn run(&self, unit_indices: &UnitSelection, watcher: &CancellationWatcher) {
        std::thread::scope(|scope| {
            for _ in 1..self.max_threads {
                scope.spawn(|| (self.threaded_run)(unit_indices, watcher));
            }
            (self.threaded_run)(unit_indices, watcher);
        });
    }
}
