use std::fmt;
use std::sync::Arc;

use fnv::FnvHashSet;
use parking_lot::Mutex;

use crate::scheduler::{Deferred, Scheduler, TaskId};

/// Who is asking for, or holding, the write permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requester {
    Task(TaskId),
    /// Background work that is not a schedulable task.
    Background,
}

/// Outcome of an acquisition attempt. Anything but `Granted` means the
/// caller must yield and try again later; it is never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Seize {
    Granted,
    /// Queued. Tasks have been suspended through the scheduler and will
    /// be resumed by the next release. Deferred work will be resubmitted.
    Suspended,
    /// Bounced by the forced yield without being queued. Retry right away.
    Yield,
    /// The task is exiting or was never known to the scheduler. It was
    /// not queued and must not retry.
    Exiting,
}

impl Seize {
    pub fn is_granted(self) -> bool {
        self == Seize::Granted
    }
}

enum Waiter {
    Task(TaskId),
    Deferred(Deferred),
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Waiter::Task(task) => write!(f, "Task({task})"),
            Waiter::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    holder: Option<Requester>,
    /// Arrival order. Drained back to front on release.
    waiters: Vec<Waiter>,
    forced_yields: FnvHashSet<TaskId>,
}

/// The single token that decides who may drive a staging cycle.
///
/// It is not a lock in the blocking sense: an attempt never waits.
/// A refused task is queued and suspended, and every queued request is
/// woken when the holder releases, after which they race again.
pub struct WritePermission {
    state: Mutex<State>,
    scheduler: Arc<dyn Scheduler>,
    force_yield: bool,
}

impl fmt::Debug for WritePermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WritePermission")
            .field("holder", &state.holder)
            .field("waiters", &state.waiters)
            .field("force_yield", &self.force_yield)
            .finish()
    }
}

impl WritePermission {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        force_yield: bool,
    ) -> WritePermission {
        WritePermission {
            state: Mutex::new(State::default()),
            scheduler,
            force_yield,
        }
    }

    /// Attempts to take the permission on behalf of `task`.
    ///
    /// On `Suspended` the task has already been marked as suspended,
    /// so it must yield before doing anything else.
    pub fn try_acquire(&self, task: TaskId) -> Seize {
        if self.scheduler.is_exiting(task) {
            log::debug!("refusing write permission to exiting {task}");
            return Seize::Exiting;
        }

        if self.force_yield && self.state.lock().forced_yields.insert(task) {
            log::debug!("forcing {task} to yield before seizing permission");
            return Seize::Yield;
        }

        let mut state = self.state.lock();
        state.forced_yields.remove(&task);

        match state.holder {
            None => {
                state.holder = Some(Requester::Task(task));
                log::debug!("write permission granted to {task}");
                Seize::Granted
            }
            Some(holder) => {
                debug_assert_ne!(
                    holder,
                    Requester::Task(task),
                    "{task} tried to re-seize the write permission it holds"
                );
                let queued = state
                    .waiters
                    .iter()
                    .any(|w| matches!(w, Waiter::Task(t) if *t == task));
                debug_assert!(
                    !queued,
                    "{task} is already waiting for the write permission"
                );
                self.scheduler.suspend(task);
                if queued {
                    log::error!("{task} queued twice for the write permission");
                    return Seize::Suspended;
                }
                state.waiters.push(Waiter::Task(task));
                log::debug!(
                    "{task} queued behind {holder:?}, {} waiting",
                    state.waiters.len()
                );
                Seize::Suspended
            }
        }
    }

    /// Attempts to take the permission for background work. On
    /// `Granted` the caller runs its operation inline right away, and
    /// `deferred` is dropped. Otherwise `deferred` is submitted to the
    /// scheduler after the next release, so it can try again.
    pub fn try_acquire_deferred(&self, deferred: Deferred) -> Seize {
        let mut state = self.state.lock();
        match state.holder {
            None => {
                state.holder = Some(Requester::Background);
                log::debug!("write permission granted to background work");
                Seize::Granted
            }
            Some(holder) => {
                state.waiters.push(Waiter::Deferred(deferred));
                log::debug!(
                    "background work queued behind {holder:?}, {} waiting",
                    state.waiters.len()
                );
                Seize::Suspended
            }
        }
    }

    /// Grants the permission to `requester` if nobody holds it. Never
    /// queues and never suspends anything.
    pub(crate) fn try_grant(&self, requester: Requester) -> bool {
        let mut state = self.state.lock();
        if state.holder.is_some() {
            return false;
        }
        state.holder = Some(requester);
        log::debug!("write permission granted to {requester:?}");
        true
    }

    /// Drops everything kept about `task`: its forced-yield mark and any
    /// waiter it left in the queue. Call once the task is gone for good.
    pub fn forget(&self, task: TaskId) {
        let mut state = self.state.lock();
        state.forced_yields.remove(&task);
        state.waiters.retain(|w| !matches!(w, Waiter::Task(t) if *t == task));
    }

    /// Gives the permission up and wakes every waiter, newest first.
    /// Nobody is handed the permission directly: the woken requests
    /// retry and one of them wins.
    pub fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(
            state.holder.is_some(),
            "release of a write permission nobody holds"
        );
        let Some(holder) = state.holder.take() else {
            log::error!("release of a write permission nobody holds");
            return;
        };
        let waiters = std::mem::take(&mut state.waiters);
        drop(state);

        log::debug!(
            "write permission released by {holder:?}, waking {}",
            waiters.len()
        );

        for waiter in waiters.into_iter().rev() {
            match waiter {
                Waiter::Task(task) => {
                    if self.scheduler.is_exiting(task) {
                        log::warn!("not resuming exiting {task}");
                    } else {
                        self.scheduler.resume(task);
                    }
                }
                Waiter::Deferred(work) => {
                    self.scheduler.submit_background(work)
                }
            }
        }
    }

    pub fn holds_permission(&self, requester: Requester) -> bool {
        self.state.lock().holder == Some(requester)
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    pub fn holder(&self) -> Option<Requester> {
        self.state.lock().holder
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}
