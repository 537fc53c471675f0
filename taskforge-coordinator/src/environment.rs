use std::time::Duration;

use taskforge_resources::ResourceManifest;

/// A long-lived context shared by several tasks, activated lazily on first dispatch and torn
/// down once its active task count returns to zero. Identity for bookkeeping is by `Arc`
/// pointer, same as [`crate::Task`].
pub trait TaskEnvironment: Send + Sync {
    /// Resources the environment itself consumes for as long as it is active, on top of
    /// whatever each task using it additionally demands. `None` means the environment has no
    /// resource footprint of its own.
    fn resources(&self) -> Option<&ResourceManifest> {
        None
    }

    /// Hint used by batching heuristics; not enforced by the coordinator itself.
    fn activation_duration(&self) -> Duration {
        Duration::ZERO
    }

    /// Hint used by batching heuristics; not enforced by the coordinator itself.
    fn shutdown_duration(&self) -> Duration {
        Duration::ZERO
    }

    /// Invoked once, before any task using this environment runs on the units it was just
    /// placed on. Serialized per environment by the coordinator; never called concurrently for
    /// the same environment instance.
    fn activate(&self) {}

    /// Invoked once the environment's active task count drops back to zero and the
    /// coordinator reclaims its resources.
    fn shutdown(&self) {}
}
