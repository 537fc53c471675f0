use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

const WORKER_POOL_TICK_DURATION: Duration = Duration::from_millis(50);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded-capacity pool of worker threads fed from a pending job queue by an internal
/// coordinator thread, repurposing the poll-loop shape of `euphony`'s `CancellableThreadPool`
/// for plain job submission rather than message-relaying cancellable tasks: the coordinator
/// above this pool already owns cancellation via its own trigger/watcher, so the pool itself
/// carries no cancellation flag of its own, only a shutdown switch.
pub struct WorkerPool {
    max_threads: usize,
    shutdown: Arc<AtomicBool>,
    pending: Arc<Mutex<VecDeque<Job>>>,
    running: Arc<Mutex<Vec<JoinHandle<()>>>>,
    coordinator_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(max_threads: usize) -> Self {
        let max_threads = max_threads.max(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let pending: Arc<Mutex<VecDeque<Job>>> = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(Mutex::new(Vec::with_capacity(max_threads)));

        let coordinator_handle = {
            let shutdown = shutdown.clone();
            let pending = pending.clone();
            let running = running.clone();
            thread::spawn(move || Self::run_coordinator(max_threads, shutdown, pending, running))
        };

        Self {
            max_threads,
            shutdown,
            pending,
            running,
            coordinator_handle: Mutex::new(Some(coordinator_handle)),
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Queues `job` for execution on the next tick that has a free worker slot. Submitting
    /// after `shutdown_and_join` has been called is accepted but the job will never run, since
    /// the coordinator thread has already exited; callers are expected not to submit past
    /// teardown.
    pub fn submit(&self, job: Job) {
        self.pending.lock().push_back(job);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    fn run_coordinator(
        max_threads: usize,
        shutdown: Arc<AtomicBool>,
        pending: Arc<Mutex<VecDeque<Job>>>,
        running: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) {
        loop {
            if shutdown.load(Ordering::Acquire) {
                let mut running_locked = running.lock();
                for handle in running_locked.drain(..) {
                    let _ = handle.join();
                }
                pending.lock().clear();
                return;
            }

            {
                let mut running_locked = running.lock();

                let mut finished_indices = Vec::new();
                for (index, handle) in running_locked.iter().enumerate() {
                    if handle.is_finished() {
                        finished_indices.push(index);
                    }
                }
                for index in finished_indices.into_iter().rev() {
                    let handle = running_locked.remove(index);
                    let _ = handle.join();
                }

                let free_slots = max_threads.saturating_sub(running_locked.len());
                if free_slots > 0 {
                    let jobs: Vec<Job> = {
                        let mut pending_locked = pending.lock();
                        let take = pending_locked.len().min(free_slots);
                        pending_locked.drain(0..take).collect()
                    };

                    for job in jobs {
                        running_locked.push(thread::spawn(job));
                    }
                }
            }

            thread::sleep(WORKER_POOL_TICK_DURATION);
        }
    }

    fn shutdown_and_join(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.coordinator_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[test]
    fn submitted_jobs_eventually_run() {
        let pool = WorkerPool::new(2);
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let completed = completed.clone();
            pool.submit(Box::new(move || {
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while completed.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(completed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn never_exceeds_max_threads_running_at_once() {
        let pool = WorkerPool::new(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            pool.submit(Box::new(move || {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(80));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        thread::sleep(Duration::from_millis(600));
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
