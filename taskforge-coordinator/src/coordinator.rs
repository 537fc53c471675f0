use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use parking_lot::Mutex as PlMutex;
use std::sync::Mutex as StdMutex;
use taskforge_resources::{
    CancellationTrigger, CancellationWatcher, ResourceBudget, ResourceKind, ResourceManifest,
    UnitSelection,
};

use crate::environment::TaskEnvironment;
use crate::error::CoordinatorError;
use crate::options::CoordinatorOptions;
use crate::pool::WorkerPool;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinatorState {
    Created,
    Running,
    Draining,
    Stopped,
}

/// Identity key for an environment: the data pointer of its `Arc<dyn TaskEnvironment>`. Two
/// clones of the same `Arc` produce the same key; distinct environments never collide.
fn environment_key(environment: &Arc<dyn TaskEnvironment>) -> usize {
    Arc::as_ptr(environment) as *const () as usize
}

/// Split out from [`ActiveEnvironment`] so `activate_if_needed` can clone the `Arc` out of the
/// `active_environments` map and release that lock before taking this one, holding both at
/// once would tie this guard's lifetime to the outer map guard and make it impossible to drop
/// the outer lock while the activation call (which may run arbitrary environment code) is in
/// flight.
struct EnvironmentActivation {
    activated: AtomicBool,
    lock: PlMutex<()>,
}

struct ActiveEnvironment {
    environment: Arc<dyn TaskEnvironment>,
    selection: UnitSelection,
    active_task_count: usize,
    activation: Arc<EnvironmentActivation>,
}

struct ScheduledTask {
    task: Arc<dyn Task>,
    environment: Option<Arc<dyn TaskEnvironment>>,
    alternative: Option<Arc<dyn Task>>,
    is_alternative: bool,
}

/// Holds the resource budget across the `Created -> Running` transition. Before `start()` the
/// coordinator has exclusive `&mut` access for `add_resource`; after `start()` the budget is
/// shared lock-free with every worker thread and only `&self` operations remain legal. Modeling
/// this as an enum makes "only `Created` accepts `add_resource`" a match failure instead of a
/// runtime flag check scattered through every call site.
enum BudgetHandle {
    Setup(ResourceBudget),
    Live(Arc<ResourceBudget>),
}

impl BudgetHandle {
    fn add_resource(&mut self, kind: ResourceKind, amount: u64) -> Result<(), CoordinatorError> {
        match self {
            BudgetHandle::Setup(budget) => {
                budget.add_resource(kind, amount);
                Ok(())
            }
            BudgetHandle::Live(_) => Err(CoordinatorError::InvalidState(
                "add_resource is only legal before start",
            )),
        }
    }

    fn activate(&mut self) -> Arc<ResourceBudget> {
        let live = match self {
            BudgetHandle::Setup(budget) => Arc::new(std::mem::replace(budget, ResourceBudget::new())),
            BudgetHandle::Live(budget) => budget.clone(),
        };
        *self = BudgetHandle::Live(live.clone());
        live
    }

    fn query_resource_maximum(&self, kind: ResourceKind) -> u64 {
        match self {
            BudgetHandle::Setup(budget) => budget.query_resource_maximum(kind),
            BudgetHandle::Live(budget) => budget.query_resource_maximum(kind),
        }
    }

    fn count_resource_units(&self, kind: ResourceKind) -> usize {
        match self {
            BudgetHandle::Setup(budget) => budget.count_resource_units(kind),
            BudgetHandle::Live(budget) => budget.count_resource_units(kind),
        }
    }
}

/// The scheduling engine: accepts tasks (optionally paired with an environment or an
/// alternative), matches them against the resource budget, dispatches them onto a worker pool,
/// and propagates cancellation on teardown.
///
/// Grounded in `euphony`'s `CancellableThreadPool`/`run_coordinator` poll loop, generalized from
/// "run whatever is pending" to "consult the budget, dispatch what fits, keep scanning".
pub struct TaskCoordinator {
    options: CoordinatorOptions,
    budget: PlMutex<BudgetHandle>,
    total_cpu_cores: AtomicU64,
    state: PlMutex<CoordinatorState>,
    poisoned: AtomicBool,
    waiting: Arc<PlMutex<VecDeque<ScheduledTask>>>,
    tasks_available: Arc<tokio::sync::Semaphore>,
    coord_shutdown: Arc<AtomicBool>,
    coord_handle: StdMutex<Option<JoinHandle<()>>>,
    worker_pool: PlMutex<Option<Arc<WorkerPool>>>,
    cancellation_trigger: CancellationTrigger,
    cancellation_watcher: CancellationWatcher,
    active_environments: Arc<PlMutex<HashMap<usize, ActiveEnvironment>>>,
}

impl TaskCoordinator {
    /// Constructs an empty coordinator with no resources and no worker pool. Call
    /// `add_resource` to describe the machine's capacity, then `start`.
    pub fn new(options: CoordinatorOptions) -> Self {
        let (cancellation_trigger, cancellation_watcher) = CancellationTrigger::new();
        Self {
            options,
            budget: PlMutex::new(BudgetHandle::Setup(ResourceBudget::new())),
            total_cpu_cores: AtomicU64::new(0),
            state: PlMutex::new(CoordinatorState::Created),
            poisoned: AtomicBool::new(false),
            waiting: Arc::new(PlMutex::new(VecDeque::new())),
            tasks_available: Arc::new(tokio::sync::Semaphore::new(0)),
            coord_shutdown: Arc::new(AtomicBool::new(false)),
            coord_handle: StdMutex::new(None),
            worker_pool: PlMutex::new(None),
            cancellation_trigger,
            cancellation_watcher,
            active_environments: Arc::new(PlMutex::new(HashMap::new())),
        }
    }

    /// Forwards to the underlying budget. Only legal in the `Created` state.
    pub fn add_resource(&self, kind: ResourceKind, amount: u64) -> Result<(), CoordinatorError> {
        if *self.state.lock() != CoordinatorState::Created {
            return Err(CoordinatorError::InvalidState(
                "add_resource is only legal before start",
            ));
        }
        self.budget.lock().add_resource(kind, amount)?;
        if kind == ResourceKind::CpuCores {
            self.total_cpu_cores.fetch_add(amount, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn query_resource_maximum(&self, kind: ResourceKind) -> u64 {
        self.budget.lock().query_resource_maximum(kind)
    }

    /// Requires at least one `CpuCores` unit; creates the worker pool and launches the
    /// coordination thread. Not idempotent: a second call fails.
    pub fn start(&self) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        if *state != CoordinatorState::Created {
            return Err(CoordinatorError::InvalidState(
                "start may only be called once, from the Created state",
            ));
        }
        if self.total_cpu_cores.load(Ordering::Relaxed) == 0 {
            return Err(CoordinatorError::InvalidState(
                "start requires at least one cpu_cores unit",
            ));
        }

        let budget = self.budget.lock().activate();
        let video_units = budget.count_resource_units(ResourceKind::VideoMemory);
        let pool_size = (self.total_cpu_cores.load(Ordering::Relaxed) as usize
            + 4 * video_units
            + 1)
        .max(self.options.min_worker_threads);
        let worker_pool = Arc::new(WorkerPool::new(pool_size));
        *self.worker_pool.lock() = Some(worker_pool.clone());

        let poll_interval = self.options.poll_interval;
        let coord_shutdown = self.coord_shutdown.clone();
        let waiting = self.waiting.clone();
        let tasks_available = self.tasks_available.clone();
        let active_environments = self.active_environments.clone();
        let cancellation_watcher = self.cancellation_watcher.clone();

        let handle = thread::spawn(move || {
            run_coordination_loop(
                budget,
                worker_pool,
                waiting,
                tasks_available,
                active_environments,
                cancellation_watcher,
                coord_shutdown,
                poll_interval,
            )
        });
        *self.coord_handle.lock().unwrap() = Some(handle);

        *state = CoordinatorState::Running;
        tracing::info!("coordinator started with pool size {pool_size}");
        Ok(())
    }

    fn enqueue(&self, entry: ScheduledTask) -> Result<(), CoordinatorError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CoordinatorError::InvalidState(
                "coordinator has been poisoned by cancel_all(true)",
            ));
        }
        if *self.state.lock() != CoordinatorState::Running {
            return Err(CoordinatorError::InvalidState(
                "schedule is only legal once the coordinator is running",
            ));
        }
        self.waiting.lock().push_back(entry);
        self.tasks_available.add_permits(1);
        Ok(())
    }

    pub fn schedule(&self, task: Arc<dyn Task>) -> Result<(), CoordinatorError> {
        self.enqueue(ScheduledTask {
            task,
            environment: None,
            alternative: None,
            is_alternative: false,
        })
    }

    pub fn schedule_with_environment(
        &self,
        environment: Arc<dyn TaskEnvironment>,
        task: Arc<dyn Task>,
    ) -> Result<(), CoordinatorError> {
        self.enqueue(ScheduledTask {
            task,
            environment: Some(environment),
            alternative: None,
            is_alternative: false,
        })
    }

    pub fn schedule_with_alternative(
        &self,
        preferred: Arc<dyn Task>,
        alternative: Arc<dyn Task>,
    ) -> Result<(), CoordinatorError> {
        self.enqueue(ScheduledTask {
            task: preferred,
            environment: None,
            alternative: Some(alternative),
            is_alternative: false,
        })
    }

    pub fn schedule_with_environment_and_alternative(
        &self,
        environment: Arc<dyn TaskEnvironment>,
        preferred: Arc<dyn Task>,
        alternative: Arc<dyn Task>,
    ) -> Result<(), CoordinatorError> {
        self.enqueue(ScheduledTask {
            task: preferred,
            environment: Some(environment),
            alternative: Some(alternative),
            is_alternative: false,
        })
    }

    /// Best-effort hint: moves the matched still-waiting task to the head of the queue.
    /// Returns whether a match was found.
    pub fn prioritize(&self, task: &Arc<dyn Task>) -> bool {
        let mut waiting = self.waiting.lock();
        if let Some(position) = waiting.iter().position(|entry| Arc::ptr_eq(&entry.task, task)) {
            let entry = waiting.remove(position).expect("position came from this deque");
            waiting.push_front(entry);
            true
        } else {
            false
        }
    }

    /// Removes a still-waiting task (and its alternative, if any) from the queue. Cancelling an
    /// alternative directly, instead of the preferred task it belongs to, is rejected.
    pub fn cancel(&self, task: &Arc<dyn Task>) -> Result<bool, CoordinatorError> {
        let mut waiting = self.waiting.lock();

        for entry in waiting.iter() {
            if let Some(alternative) = &entry.alternative {
                if Arc::ptr_eq(alternative, task) {
                    return Err(CoordinatorError::InvalidState(
                        "cancelling an alternative task directly is illegal",
                    ));
                }
            }
            if entry.is_alternative && Arc::ptr_eq(&entry.task, task) {
                return Err(CoordinatorError::InvalidState(
                    "cancelling an alternative task directly is illegal",
                ));
            }
        }

        if let Some(position) = waiting
            .iter()
            .position(|entry| !entry.is_alternative && Arc::ptr_eq(&entry.task, task))
        {
            waiting.remove(position);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Drains the waiting queue. If `forever`, also poisons the coordinator so all future
    /// `schedule*` calls are rejected.
    pub fn cancel_all(&self, forever: bool) {
        self.waiting.lock().clear();
        if forever {
            self.poisoned.store(true, Ordering::Release);
            *self.state.lock() = CoordinatorState::Draining;
        }
    }
}

impl Drop for TaskCoordinator {
    fn drop(&mut self) {
        self.cancellation_trigger.cancel("coordinator is shutting down");
        *self.state.lock() = CoordinatorState::Draining;
        self.coord_shutdown.store(true, Ordering::Release);
        self.tasks_available.add_permits(u16::MAX as usize);

        if let Some(handle) = self.coord_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        // Dropping our `Arc<WorkerPool>` here only tears the pool down once every dispatch
        // closure still in flight has also dropped its clone; `WorkerPool::drop` joins them.
        *self.worker_pool.lock() = None;
        *self.state.lock() = CoordinatorState::Stopped;
    }
}

#[allow(clippy::too_many_arguments)]
fn run_coordination_loop(
    budget: Arc<ResourceBudget>,
    worker_pool: Arc<WorkerPool>,
    waiting: Arc<PlMutex<VecDeque<ScheduledTask>>>,
    tasks_available: Arc<tokio::sync::Semaphore>,
    active_environments: Arc<PlMutex<HashMap<usize, ActiveEnvironment>>>,
    cancellation_watcher: CancellationWatcher,
    coord_shutdown: Arc<AtomicBool>,
    poll_interval: std::time::Duration,
) {
    loop {
        if coord_shutdown.load(Ordering::Acquire) {
            return;
        }

        // Drain whatever permits accumulated since the last tick; the tick itself, not the
        // semaphore, is what guarantees re-evaluation (see the design note on why a blocking
        // async wait isn't used here). `forget` is required: dropping an acquired permit
        // ordinarily returns it to the semaphore, which would make this loop spin forever.
        while let Ok(permit) = tasks_available.try_acquire() {
            permit.forget();
        }

        kick_off(&budget, &worker_pool, &waiting, &active_environments, &cancellation_watcher, &tasks_available);

        thread::sleep(poll_interval);
    }
}

fn kick_off(
    budget: &Arc<ResourceBudget>,
    worker_pool: &Arc<WorkerPool>,
    waiting: &Arc<PlMutex<VecDeque<ScheduledTask>>>,
    active_environments: &Arc<PlMutex<HashMap<usize, ActiveEnvironment>>>,
    cancellation_watcher: &CancellationWatcher,
    tasks_available: &Arc<tokio::sync::Semaphore>,
) {
    let mut waiting_locked = waiting.lock();
    let mut index = 0;

    while index < waiting_locked.len() {
        // Substitute a permanently-infeasible preferred task with its alternative before
        // attempting placement, per the starting alternative policy.
        {
            let entry = &mut waiting_locked[index];
            if let Some(alternative) = &entry.alternative {
                let combined = match &entry.environment {
                    Some(env) => env
                        .resources()
                        .cloned()
                        .unwrap_or_else(ResourceManifest::empty_manifest)
                        .combine(entry.task.used_resources()),
                    None => entry.task.used_resources().clone(),
                };
                if !budget.can_ever_execute(&combined, None) {
                    tracing::warn!("substituting alternative for a permanently infeasible task");
                    entry.task = alternative.clone();
                    entry.alternative = None;
                    entry.is_alternative = true;
                }
            }
        }

        let dispatched = try_dispatch_entry(
            &waiting_locked[index],
            budget,
            worker_pool,
            active_environments,
            cancellation_watcher,
            tasks_available,
        );

        if dispatched {
            waiting_locked.remove(index);
        } else {
            index += 1;
        }
    }
}

/// Restricts `selection` down to only the unit choices made for kinds named by `manifest`,
/// dropping any pins a combined `allocate` call also made for a companion manifest's own
/// kinds. Used so an environment's stored [`ActiveEnvironment::selection`] pins only the
/// environment's own resource kinds, leaving a reused task's other kinds free to pick any
/// unit with room, instead of being force-pinned to whichever unit the environment's first
/// task happened to land on.
fn selection_restricted_to(selection: &UnitSelection, manifest: &ResourceManifest) -> UnitSelection {
    let mut restricted = UnitSelection::new();
    for entry in manifest.entries() {
        if let Some(unit_index) = selection.get(entry.kind) {
            restricted.set(entry.kind, unit_index);
        }
    }
    restricted
}

fn try_dispatch_entry(
    entry: &ScheduledTask,
    budget: &Arc<ResourceBudget>,
    worker_pool: &Arc<WorkerPool>,
    active_environments: &Arc<PlMutex<HashMap<usize, ActiveEnvironment>>>,
    cancellation_watcher: &CancellationWatcher,
    tasks_available: &Arc<tokio::sync::Semaphore>,
) -> bool {
    let mut selection = UnitSelection::new();
    let env_key = entry.environment.as_ref().map(environment_key);

    // Look up and speculatively reserve a slot on an already-active environment in one lock
    // acquisition, so a concurrently completing task can't tear the environment down between
    // "it's active" and "fetch its selection", a plain check-then-fetch across two separate
    // locks would let that race panic on a since-removed entry.
    let mut reserved_existing = false;
    if let Some(key) = env_key {
        let mut environments = active_environments.lock();
        if let Some(active) = environments.get_mut(&key) {
            // Only the environment's own kinds are pinned here; kinds the task itself
            // names (and the environment doesn't) stay free choice, see
            // `selection_restricted_to`.
            selection = active.selection;
            active.active_task_count += 1;
            reserved_existing = true;
        }
    }

    if reserved_existing {
        if !budget.allocate(&mut selection, entry.task.used_resources(), None) {
            release_environment_if_idle(
                env_key.expect("reserved_existing implies env_key"),
                active_environments,
                budget,
            );
            return false;
        }
    } else if let Some(environment) = &entry.environment {
        let env_manifest = environment
            .resources()
            .cloned()
            .unwrap_or_else(ResourceManifest::empty_manifest);

        if !budget.allocate(&mut selection, &env_manifest, Some(entry.task.used_resources())) {
            return false;
        }

        let key = env_key.expect("entry.environment is Some");
        active_environments.lock().insert(
            key,
            ActiveEnvironment {
                environment: environment.clone(),
                selection: selection_restricted_to(&selection, &env_manifest),
                active_task_count: 1,
                activation: Arc::new(EnvironmentActivation {
                    activated: AtomicBool::new(false),
                    lock: PlMutex::new(()),
                }),
            },
        );
    } else if !budget.allocate(&mut selection, entry.task.used_resources(), None) {
        return false;
    }

    dispatch(
        entry.task.clone(),
        entry.environment.clone(),
        selection,
        budget.clone(),
        worker_pool.clone(),
        active_environments.clone(),
        cancellation_watcher.clone(),
        tasks_available.clone(),
    );

    true
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    task: Arc<dyn Task>,
    environment: Option<Arc<dyn TaskEnvironment>>,
    selection: UnitSelection,
    budget: Arc<ResourceBudget>,
    worker_pool: Arc<WorkerPool>,
    active_environments: Arc<PlMutex<HashMap<usize, ActiveEnvironment>>>,
    cancellation_watcher: CancellationWatcher,
    tasks_available: Arc<tokio::sync::Semaphore>,
) {
    worker_pool.submit(Box::new(move || {
        if let Some(environment) = &environment {
            activate_if_needed(environment, &active_environments);
        }

        let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.run(&selection, &cancellation_watcher);
        }));
        if let Err(panic) = run_result {
            tracing::warn!("task panicked during run: {panic:?}");
        }

        budget.release(&selection, task.used_resources(), None);

        if let Some(environment) = &environment {
            release_environment_if_idle(environment_key(environment), &active_environments, &budget);
        }

        tasks_available.add_permits(1);
    }));
}

/// Decrements `active_task_count` for the environment at `key` and, if that was the last
/// active task, removes it from the map and tears it down: calls `shutdown()` and releases its
/// resources back to `budget`. Shared between a task's normal completion (`dispatch`) and a
/// failed re-reservation attempt against an already-active environment (`try_dispatch_entry`),
/// so a decrement that lands on zero can never strand a dead environment entry still holding
/// its resources until coordinator `Drop`.
fn release_environment_if_idle(
    key: usize,
    active_environments: &Arc<PlMutex<HashMap<usize, ActiveEnvironment>>>,
    budget: &ResourceBudget,
) {
    let should_shutdown = {
        let mut environments = active_environments.lock();
        match environments.get_mut(&key) {
            Some(active) => {
                active.active_task_count -= 1;
                active.active_task_count == 0
            }
            None => false,
        }
    };

    if should_shutdown {
        let removed = active_environments.lock().remove(&key);
        if let Some(active) = removed {
            let shutdown_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                active.environment.shutdown();
            }));
            if let Err(panic) = shutdown_result {
                tracing::warn!("environment shutdown panicked: {panic:?}");
            }

            let env_manifest = active
                .environment
                .resources()
                .cloned()
                .unwrap_or_else(ResourceManifest::empty_manifest);
            budget.release(&active.selection, &env_manifest, None);
        }
    }
}

fn activate_if_needed(
    environment: &Arc<dyn TaskEnvironment>,
    active_environments: &Arc<PlMutex<HashMap<usize, ActiveEnvironment>>>,
) {
    let key = environment_key(environment);
    let activation = {
        let environments = active_environments.lock();
        match environments.get(&key) {
            Some(active) => active.activation.clone(),
            None => return,
        }
    };

    if activation.activated.load(Ordering::Acquire) {
        return;
    }

    let _guard = activation.lock.lock();
    if activation.activated.load(Ordering::Relaxed) {
        return;
    }

    let activation_result =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| environment.activate()));
    if let Err(panic) = activation_result {
        tracing::warn!("environment activation panicked: {panic:?}");
    }

    activation.activated.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use taskforge_resources::ResourceManifest;

    use super::*;

    struct ClosureTask<F> {
        resources: ResourceManifest,
        f: F,
    }

    impl<F> Task for ClosureTask<F>
    where
        F: Fn(&UnitSelection, &CancellationWatcher) + Send + Sync,
    {
        fn used_resources(&self) -> &ResourceManifest {
            &self.resources
        }

        fn run(&self, unit_indices: &UnitSelection, watcher: &CancellationWatcher) {
            (self.f)(unit_indices, watcher)
        }
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn scheduled_task_runs_after_start() {
        let coordinator = TaskCoordinator::new(CoordinatorOptions::default());
        coordinator.add_resource(ResourceKind::CpuCores, 4).unwrap();
        coordinator.start().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let task: Arc<dyn Task> = Arc::new(ClosureTask {
            resources: ResourceManifest::single(ResourceKind::CpuCores, 1).unwrap(),
            f: move |_: &UnitSelection, _: &CancellationWatcher| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            },
        });

        coordinator.schedule(task).unwrap();
        assert!(wait_until(Duration::from_secs(2), || ran.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn add_resource_after_start_is_rejected() {
        let coordinator = TaskCoordinator::new(CoordinatorOptions::default());
        coordinator.add_resource(ResourceKind::CpuCores, 2).unwrap();
        coordinator.start().unwrap();

        let result = coordinator.add_resource(ResourceKind::CpuCores, 1);
        assert!(matches!(result, Err(CoordinatorError::InvalidState(_))));
    }

    #[test]
    fn schedule_before_start_is_rejected() {
        let coordinator = TaskCoordinator::new(CoordinatorOptions::default());
        let task: Arc<dyn Task> = Arc::new(ClosureTask {
            resources: ResourceManifest::empty_manifest(),
            f: |_: &UnitSelection, _: &CancellationWatcher| {},
        });

        let result = coordinator.schedule(task);
        assert!(matches!(result, Err(CoordinatorError::InvalidState(_))));
    }

    #[test]
    fn cancel_removes_a_still_waiting_task() {
        let coordinator = TaskCoordinator::new(CoordinatorOptions::default());
        coordinator.add_resource(ResourceKind::CpuCores, 1).unwrap();
        coordinator.start().unwrap();

        // Occupy the single cpu core so the next task stays queued long enough to cancel.
        let blocker_entered = Arc::new(AtomicUsize::new(0));
        let release_blocker = Arc::new(AtomicBool::new(false));
        {
            let blocker_entered = blocker_entered.clone();
            let release_blocker = release_blocker.clone();
            let blocker: Arc<dyn Task> = Arc::new(ClosureTask {
                resources: ResourceManifest::single(ResourceKind::CpuCores, 1).unwrap(),
                f: move |_: &UnitSelection, _: &CancellationWatcher| {
                    blocker_entered.fetch_add(1, Ordering::SeqCst);
                    while !release_blocker.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                },
            });
            coordinator.schedule(blocker).unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || blocker_entered.load(Ordering::SeqCst) == 1));

        let queued: Arc<dyn Task> = Arc::new(ClosureTask {
            resources: ResourceManifest::single(ResourceKind::CpuCores, 1).unwrap(),
            f: |_: &UnitSelection, _: &CancellationWatcher| {},
        });
        coordinator.schedule(queued.clone()).unwrap();

        assert!(coordinator.cancel(&queued).unwrap());
        release_blocker.store(true, Ordering::SeqCst);
    }

    #[test]
    fn cancelling_an_alternative_directly_is_illegal() {
        let coordinator = TaskCoordinator::new(CoordinatorOptions::default());
        coordinator.add_resource(ResourceKind::CpuCores, 1).unwrap();
        coordinator.start().unwrap();

        // Keep the only cpu core busy so neither the preferred nor the alternative task can
        // actually be dispatched during this test, regardless of coordination-thread timing.
        let blocker_entered = Arc::new(AtomicUsize::new(0));
        let release_blocker = Arc::new(AtomicBool::new(false));
        {
            let blocker_entered = blocker_entered.clone();
            let release_blocker = release_blocker.clone();
            let blocker: Arc<dyn Task> = Arc::new(ClosureTask {
                resources: ResourceManifest::single(ResourceKind::CpuCores, 1).unwrap(),
                f: move |_: &UnitSelection, _: &CancellationWatcher| {
                    blocker_entered.fetch_add(1, Ordering::SeqCst);
                    while !release_blocker.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                },
            });
            coordinator.schedule(blocker).unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || blocker_entered.load(Ordering::SeqCst) == 1));

        let preferred: Arc<dyn Task> = Arc::new(ClosureTask {
            resources: ResourceManifest::single(ResourceKind::CpuCores, 1).unwrap(),
            f: |_: &UnitSelection, _: &CancellationWatcher| {},
        });
        let alternative: Arc<dyn Task> = Arc::new(ClosureTask {
            resources: ResourceManifest::single(ResourceKind::CpuCores, 1).unwrap(),
            f: |_: &UnitSelection, _: &CancellationWatcher| {},
        });

        coordinator
            .schedule_with_alternative(preferred, alternative.clone())
            .unwrap();

        let result = coordinator.cancel(&alternative);
        assert!(matches!(result, Err(CoordinatorError::InvalidState(_))));

        release_blocker.store(true, Ordering::SeqCst);
    }

    /// §8 scenario 6: budget has 4 cpu cores. T1 (3 cores) and T2 (3 cores) are scheduled
    /// before T3 (1 core). T1 and T3 should both dispatch immediately (4 cores fit exactly);
    /// T2 should wait until T1 releases its cores.
    #[test]
    fn fifo_dispatch_with_back_pressure() {
        let coordinator = TaskCoordinator::new(CoordinatorOptions::default());
        coordinator.add_resource(ResourceKind::CpuCores, 4).unwrap();
        coordinator.start().unwrap();

        let t1_entered = Arc::new(AtomicUsize::new(0));
        let t1_release = Arc::new(AtomicBool::new(false));
        let t2_entered = Arc::new(AtomicUsize::new(0));
        let t3_entered = Arc::new(AtomicUsize::new(0));

        let t1: Arc<dyn Task> = {
            let entered = t1_entered.clone();
            let release = t1_release.clone();
            Arc::new(ClosureTask {
                resources: ResourceManifest::single(ResourceKind::CpuCores, 3).unwrap(),
                f: move |_: &UnitSelection, _: &CancellationWatcher| {
                    entered.fetch_add(1, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(5));
                    }
                },
            })
        };
        let t2: Arc<dyn Task> = {
            let entered = t2_entered.clone();
            Arc::new(ClosureTask {
                resources: ResourceManifest::single(ResourceKind::CpuCores, 3).unwrap(),
                f: move |_: &UnitSelection, _: &CancellationWatcher| {
                    entered.fetch_add(1, Ordering::SeqCst);
                },
            })
        };
        let t3: Arc<dyn Task> = {
            let entered = t3_entered.clone();
            Arc::new(ClosureTask {
                resources: ResourceManifest::single(ResourceKind::CpuCores, 1).unwrap(),
                f: move |_: &UnitSelection, _: &CancellationWatcher| {
                    entered.fetch_add(1, Ordering::SeqCst);
                },
            })
        };

        coordinator.schedule(t1).unwrap();
        coordinator.schedule(t2).unwrap();
        coordinator.schedule(t3).unwrap();

        assert!(wait_until(Duration::from_secs(2), || t1_entered.load(Ordering::SeqCst) == 1));
        assert!(wait_until(Duration::from_secs(2), || t3_entered.load(Ordering::SeqCst) == 1));
        // T2 needs 3 cores but only 1 remains while T1 is still holding 3; it must not have
        // started yet.
        thread::sleep(Duration::from_millis(150));
        assert_eq!(t2_entered.load(Ordering::SeqCst), 0);

        t1_release.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || t2_entered.load(Ordering::SeqCst) == 1));
    }

    struct CountingEnvironment {
        resources: Option<ResourceManifest>,
        activate_count: AtomicUsize,
        shutdown_count: AtomicUsize,
    }

    impl TaskEnvironment for CountingEnvironment {
        fn resources(&self) -> Option<&ResourceManifest> {
            self.resources.as_ref()
        }

        fn activate(&self) {
            self.activate_count.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&self) {
            self.shutdown_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn environment_activates_once_and_shuts_down_after_last_task() {
        let coordinator = TaskCoordinator::new(CoordinatorOptions::default());
        coordinator.add_resource(ResourceKind::CpuCores, 4).unwrap();
        coordinator.add_resource(ResourceKind::SystemMemory, 2).unwrap();
        coordinator.start().unwrap();

        let concrete_environment = Arc::new(CountingEnvironment {
            resources: Some(ResourceManifest::single(ResourceKind::SystemMemory, 2).unwrap()),
            activate_count: AtomicUsize::new(0),
            shutdown_count: AtomicUsize::new(0),
        });
        let environment: Arc<dyn TaskEnvironment> = concrete_environment.clone();

        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let completed = completed.clone();
            let task: Arc<dyn Task> = Arc::new(ClosureTask {
                resources: ResourceManifest::single(ResourceKind::CpuCores, 1).unwrap(),
                f: move |_: &UnitSelection, _: &CancellationWatcher| {
                    completed.fetch_add(1, Ordering::SeqCst);
                },
            });
            coordinator
                .schedule_with_environment(environment.clone(), task)
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || completed.load(Ordering::SeqCst) == 3));
        assert!(wait_until(Duration::from_secs(2), || {
            concrete_environment.shutdown_count.load(Ordering::SeqCst) == 1
        }));
        // Exactly one activation regardless of how many tasks shared the environment.
        assert_eq!(concrete_environment.activate_count.load(Ordering::SeqCst), 1);

        // The environment's own resources must be back in the budget once shutdown completes:
        // a fresh task demanding the same system-memory amount the environment held must still
        // be able to dispatch.
        let verified = Arc::new(AtomicUsize::new(0));
        let verified_clone = verified.clone();
        let verifier: Arc<dyn Task> = Arc::new(ClosureTask {
            resources: ResourceManifest::single(ResourceKind::SystemMemory, 2).unwrap(),
            f: move |_: &UnitSelection, _: &CancellationWatcher| {
                verified_clone.fetch_add(1, Ordering::SeqCst);
            },
        });
        coordinator.schedule(verifier).unwrap();
        assert!(wait_until(Duration::from_secs(2), || verified.load(Ordering::SeqCst) == 1));
    }
}
