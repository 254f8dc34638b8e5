use std::io;

use crate::{CodeManager, Generation, Requester};

/// Proof of holding the write permission. Releases it when dropped, on
/// every exit path.
pub struct WriteGuard<'a> {
    manager: &'a CodeManager,
    requester: Requester,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let held = self.manager.permission().holds_permission(self.requester);
        debug_assert!(
            held || std::thread::panicking(),
            "{:?} lost the write permission before its guard dropped",
            self.requester
        );
        if held {
            self.manager.release_write_permission();
        } else {
            log::error!(
                "{:?} lost the write permission before its guard dropped",
                self.requester
            );
        }
    }
}

impl<'a> WriteGuard<'a> {
    pub(crate) fn new(
        manager: &'a CodeManager,
        requester: Requester,
    ) -> WriteGuard<'a> {
        WriteGuard { manager, requester }
    }

    pub fn requester(&self) -> Requester {
        self.requester
    }

    fn holds(&self) -> bool {
        self.manager.permission().holds_permission(self.requester)
    }

    fn assert_holds(&self, op: &str) {
        debug_assert!(
            self.holds(),
            "{:?} does not hold the write permission for {op}",
            self.requester
        );
    }

    /// Opens a staging cycle for `num_new` new entries.
    pub fn begin_update(&self, num_new: usize) -> StagingCycle<'_> {
        self.assert_holds("begin_update");
        self.manager.begin_update(num_new);
        StagingCycle { guard: self, finished: false }
    }
}

/// An open staging cycle. Dropping it without committing aborts it, so
/// an early return or a panic never leaves half-staged tables behind.
pub struct StagingCycle<'a> {
    guard: &'a WriteGuard<'a>,
    finished: bool,
}

impl Drop for StagingCycle<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.guard.holds() {
            log::error!(
                "{:?} dropped the staging cycle for {} after losing the write permission",
                self.guard.requester,
                self.staging()
            );
            return;
        }
        log::debug!(
            "staging cycle for {} dropped without commit, aborting",
            self.staging()
        );
        self.guard.manager.abort();
    }
}

impl StagingCycle<'_> {
    pub fn staging(&self) -> Generation {
        self.guard.manager.index().staging()
    }

    /// Ends population. On error the cycle is still open and will be
    /// aborted when dropped.
    pub fn end_update(&mut self) -> io::Result<()> {
        self.guard.assert_holds("end_update");
        self.guard.manager.end_update()
    }

    /// Ends population if it was not ended yet, then commits. An error
    /// from the tables aborts the cycle.
    pub fn commit(mut self) -> io::Result<Generation> {
        self.guard.assert_holds("commit");
        if self.guard.manager.index().phase() == crate::Phase::Staging {
            self.end_update()?;
        }
        self.finished = true;
        self.guard.manager.commit();
        Ok(self.guard.manager.active_generation())
    }

    pub fn abort(mut self) {
        self.guard.assert_holds("abort");
        self.finished = true;
        self.guard.manager.abort();
    }
}
