use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::CanceledError;

struct CancellationState {
    canceled: AtomicBool,
    reason: OnceLock<String>,
}

/// Producer end of a one-shot cancellation signal.
///
/// One trigger has exactly one [`CancellationWatcher`]; both must remain reachable for the
/// duration of any task that consults the watcher. The `false -> true` transition is one-way
/// and observed by the watcher atomically. Grounded in `euphony`'s `CancellationToken`
/// (`src/cancellation.rs`), split into two distinct types sharing one atomic state per the
/// design note against casting a watcher out of its trigger's base class.
pub struct CancellationTrigger {
    state: Arc<CancellationState>,
}

/// Consumer end of a one-shot cancellation signal, handed out by [`CancellationTrigger::new`].
#[derive(Clone)]
pub struct CancellationWatcher {
    state: Arc<CancellationState>,
}

impl CancellationTrigger {
    /// Returns a newly armed, not-yet-canceled trigger/watcher pair.
    pub fn new() -> (Self, CancellationWatcher) {
        let state = Arc::new(CancellationState {
            canceled: AtomicBool::new(false),
            reason: OnceLock::new(),
        });
        (
            Self { state: state.clone() },
            CancellationWatcher { state },
        )
    }

    /// Atomically flips the cancellation flag. Storing the reason happens-before the flag
    /// transitions to `true`, so any watcher observing `is_canceled() == true` via an acquire
    /// read also observes the complete reason string. A second call is a no-op: its reason is
    /// dropped rather than panicking, since a trigger may be canceled racily from more than
    /// one place during shutdown.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.state.reason.set(reason.clone()).is_ok() {
            tracing::debug!(%reason, "cancellation triggered");
        }
        self.state.canceled.store(true, Ordering::Release);
    }

    /// Whether this trigger has already been canceled.
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Relaxed)
    }
}

impl CancellationWatcher {
    /// Relaxed read of the cancellation flag.
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Relaxed)
    }

    /// Acquire read of the cancellation flag; fails with [`CanceledError`] carrying the
    /// cancellation reason if the flag is set.
    pub fn throw_if_canceled(&self) -> Result<(), CanceledError> {
        if self.state.canceled.load(Ordering::Acquire) {
            let reason = self.state.reason.get().cloned().unwrap_or_default();
            Err(CanceledError { reason })
        } else {
            Ok(())
        }
    }
}
