use std::io;
use std::sync::Arc;

use crate::{CodeManager, Scheduler, StagedTable, ThreadScheduler};

/// Top-level configuration for a [`CodeManager`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Bounce every task's first attempt to seize the write permission,
    /// so the yield-and-retry path of callers gets exercised even when
    /// there is no contention. Meant for debug builds and tests.
    pub force_yield: bool,
    /// Number of background worker threads for a
    /// [`ThreadScheduler`](crate::ThreadScheduler). Defaults to 2.
    pub background_threads: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config { force_yield: false, background_threads: 2 }
    }
}

impl Config {
    /// Builds a manager over `tables` that suspends and resumes waiters
    /// through `scheduler`. The manager starts out in the bootstrap
    /// state, see [`CodeManager::init`].
    pub fn open(
        &self,
        scheduler: Arc<dyn Scheduler>,
        tables: Vec<Arc<dyn StagedTable>>,
    ) -> CodeManager {
        log::debug!(
            "opening CodeManager with {} tables, force_yield: {}",
            tables.len(),
            self.force_yield
        );
        let manager = CodeManager::new(self.clone(), scheduler, tables);
        manager.init();
        manager
    }

    /// A [`ThreadScheduler`] with `background_threads` workers.
    pub fn thread_scheduler(&self) -> io::Result<ThreadScheduler> {
        ThreadScheduler::new(self.background_threads)
    }
}
