use std::time::Duration;

/// Tunable knobs for a [`crate::TaskCoordinator`]. There is no file or environment-variable
/// configuration surface in this crate; callers that want one can load these fields from
/// whatever configuration layer their application already uses.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// How often the coordination thread wakes up to re-evaluate the waiting queue.
    pub poll_interval: Duration,
    /// Floor applied to the computed worker-pool size, so lightly loaded systems don't
    /// pre-warm an unreasonably small pool.
    pub min_worker_threads: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            min_worker_threads: 3,
        }
    }
}
