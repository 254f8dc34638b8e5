//! `hotload` keeps a runtime's code metadata tables swappable while code
//! is running against them.
//!
//! Every table (exports, modules, catch tables, address ranges) keeps
//! one copy per [`Generation`]. Readers look things up through the
//! active generation. A single writer at a time, the holder of the
//! write permission, stages a whole new generation next to it and then
//! flips the active index in one atomic store.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use hotload::{Config, StagedMap, StagedTable, ThreadScheduler};
//!
//! let scheduler = Arc::new(ThreadScheduler::new(1).unwrap());
//! let exports = Arc::new(StagedMap::<&str, usize>::new("exports"));
//! let tables: Vec<Arc<dyn StagedTable>> = vec![exports.clone()];
//! let manager = Config::default().open(scheduler.clone(), tables);
//!
//! // finish bootstrap, which leaves active=0 and staging=1
//! manager.bootstrap().unwrap();
//!
//! let task = scheduler.spawn_task();
//! manager
//!     .update(task, |t| scheduler.park(t), 1, |_cycle| {
//!         exports.stage_insert("lists:reverse/1", 0x1000);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! let active = manager.active_generation();
//! assert_eq!(active.get(), 1);
//! assert_eq!(exports.get(active, &"lists:reverse/1"), Some(0x1000));
//! ```
#![deny(future_incompatible)]
#![deny(nonstandard_style)]
#![deny(rust_2018_idioms)]

mod config;
mod generation;
mod permission;
mod scheduler;
mod table;
mod update;

use std::fmt;
use std::io;
use std::sync::Arc;

use fault_injection::annotate;

pub use crate::{
    config::Config,
    generation::{Generation, GenerationIndex, NUM_GENERATIONS, Phase},
    permission::{Requester, Seize, WritePermission},
    scheduler::{Deferred, Scheduler, TaskId, ThreadScheduler},
    table::{Cycle, StagedMap, StagedTable},
    update::{StagingCycle, WriteGuard},
};

struct Inner {
    config: Config,
    index: GenerationIndex,
    permission: WritePermission,
}

/// The runtime-wide hot update context: one generation index and the
/// write permission guarding it. Clones share the same state.
#[derive(Clone)]
pub struct CodeManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for CodeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeManager")
            .field("config", &self.inner.config)
            .field("index", &self.inner.index)
            .field("permission", &self.inner.permission)
            .finish()
    }
}

impl CodeManager {
    pub(crate) fn new(
        config: Config,
        scheduler: Arc<dyn Scheduler>,
        tables: Vec<Arc<dyn StagedTable>>,
    ) -> CodeManager {
        let permission = WritePermission::new(scheduler, config.force_yield);
        CodeManager {
            inner: Arc::new(Inner {
                config,
                index: GenerationIndex::new(tables),
                permission,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn index(&self) -> &GenerationIndex {
        &self.inner.index
    }

    pub fn permission(&self) -> &WritePermission {
        &self.inner.permission
    }

    /// Puts the index in its bootstrap state, `active = staging = 0`.
    /// Only valid while nothing else is using the manager.
    pub fn init(&self) {
        debug_assert!(!self.inner.permission.is_held());
        self.inner.index.init();
    }

    /// Runs the commit that ends bootstrap without any staged changes,
    /// establishing `staging == active + 1`. Preloaded code is normally
    /// staged between `begin_update` and `commit` of this first cycle
    /// instead, in which case this is not needed.
    pub fn bootstrap(&self) -> io::Result<()> {
        debug_assert!(self.inner.index.is_bootstrapping());
        if !self.inner.permission.try_grant(Requester::Background) {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::WouldBlock,
                "write permission held during bootstrap",
            )));
        }
        let guard = WriteGuard::new(self, Requester::Background);
        guard.begin_update(0).commit()?;
        Ok(())
    }

    pub fn active_generation(&self) -> Generation {
        self.inner.index.active()
    }

    /// Only meaningful for the permission holder.
    pub fn staging_generation(&self) -> Generation {
        self.inner.index.staging()
    }

    pub fn try_acquire_write_permission(&self, task: TaskId) -> Seize {
        self.inner.permission.try_acquire(task)
    }

    pub fn try_acquire_write_permission_deferred(
        &self,
        deferred: Deferred,
    ) -> Seize {
        self.inner.permission.try_acquire_deferred(deferred)
    }

    pub fn release_write_permission(&self) {
        self.inner.permission.release();
    }

    /// Drops whatever the write permission still keeps about `task`.
    /// Call once the task is gone for good, for a [`ThreadScheduler`]
    /// together with [`ThreadScheduler::retire`].
    pub fn forget_task(&self, task: TaskId) {
        self.inner.permission.forget(task);
    }

    fn assert_held(&self, op: &str) {
        debug_assert!(
            self.inner.permission.is_held(),
            "{op} called without holding the write permission"
        );
    }

    pub fn begin_update(&self, num_new: usize) {
        self.assert_held("begin_update");
        self.inner.index.begin_update(num_new);
    }

    pub fn end_update(&self) -> io::Result<()> {
        self.assert_held("end_update");
        self.inner.index.end_update()
    }

    pub fn commit(&self) {
        self.assert_held("commit");
        self.inner.index.commit();
    }

    pub fn abort(&self) {
        self.assert_held("abort");
        self.inner.index.abort();
    }

    /// Scoped version of [`CodeManager::try_acquire_write_permission`].
    /// The error carries the refusal, which means the task must yield.
    pub fn try_seize(&self, task: TaskId) -> Result<WriteGuard<'_>, Seize> {
        match self.try_acquire_write_permission(task) {
            Seize::Granted => {
                Ok(WriteGuard::new(self, Requester::Task(task)))
            }
            refused => Err(refused),
        }
    }

    /// Keeps trying until `task` holds the permission, calling `park`
    /// after every refusal. `park` is the task's way of yielding, for a
    /// [`ThreadScheduler`] that is [`ThreadScheduler::park`]. Returns
    /// `None` once the scheduler reports `task` as exiting.
    pub fn seize<P>(&self, task: TaskId, mut park: P) -> Option<WriteGuard<'_>>
    where
        P: FnMut(TaskId),
    {
        loop {
            match self.try_seize(task) {
                Ok(guard) => return Some(guard),
                Err(Seize::Exiting) => return None,
                Err(_) => park(task),
            }
        }
    }

    /// Scoped version of
    /// [`CodeManager::try_acquire_write_permission_deferred`]. `None`
    /// means `retry` was queued and will be submitted to the scheduler
    /// once the permission is released.
    pub fn try_seize_deferred(&self, retry: Deferred) -> Option<WriteGuard<'_>> {
        match self.try_acquire_write_permission_deferred(retry) {
            Seize::Granted => Some(WriteGuard::new(self, Requester::Background)),
            _ => None,
        }
    }

    /// Runs one whole update cycle on behalf of `task`: seizes the
    /// permission, stages `num_new` entries through `stage`, commits if
    /// it and the tables succeed and aborts otherwise, and releases.
    /// Fails with `Interrupted` if `task` exits before it gets the
    /// permission.
    pub fn update<P, F, T>(
        &self,
        task: TaskId,
        park: P,
        num_new: usize,
        stage: F,
    ) -> io::Result<T>
    where
        P: FnMut(TaskId),
        F: FnOnce(&StagingCycle<'_>) -> io::Result<T>,
    {
        let Some(guard) = self.seize(task, park) else {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("{task} exited while waiting for the write permission"),
            )));
        };
        let cycle = guard.begin_update(num_new);
        let ret = stage(&cycle)?;
        cycle.commit()?;
        Ok(ret)
    }
}
