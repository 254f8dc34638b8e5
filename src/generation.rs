use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use fault_injection::fallible;

use crate::table::{Cycle, StagedTable};

/// The number of generations in the ring. Two is enough: one is read
/// by running code while the other one is being staged.
pub const NUM_GENERATIONS: u32 = 2;

/// One numbered slot of the generation ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u32);

impl Generation {
    pub const ZERO: Generation = Generation(0);

    /// Panics if `ix` does not name a slot in the ring.
    pub fn new(ix: u32) -> Generation {
        assert!(ix < NUM_GENERATIONS, "generation {ix} out of range");
        Generation(ix)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// The slot that follows this one in the ring.
    pub const fn next(self) -> Generation {
        Generation((self.0 + 1) % NUM_GENERATIONS)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    /// `begin_update` has run, tables accept writes.
    Staging = 1,
    /// `end_update` has run, waiting for commit or abort.
    Staged = 2,
}

impl Phase {
    fn from_u8(raw: u8) -> Phase {
        match raw {
            0 => Phase::Idle,
            1 => Phase::Staging,
            2 => Phase::Staged,
            other => unreachable!("corrupt phase byte {other}"),
        }
    }
}

/// Double-buffered index over the active and staging generations of
/// every registered [`StagedTable`].
///
/// Only `active` is meant for concurrent readers. Everything else is
/// driven by whoever holds the write permission, so there is no lock
/// in here: the permission is the lock.
pub struct GenerationIndex {
    active: AtomicU32,
    staging: AtomicU32,
    phase: AtomicU8,
    tables: Vec<Arc<dyn StagedTable>>,
}

impl fmt::Debug for GenerationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.tables.iter().map(|t| t.name()).collect();
        f.debug_struct("GenerationIndex")
            .field("active", &self.active())
            .field("staging", &self.staging())
            .field("phase", &self.phase())
            .field("tables", &names)
            .finish()
    }
}

impl Default for GenerationIndex {
    fn default() -> GenerationIndex {
        GenerationIndex::new(vec![])
    }
}

impl GenerationIndex {
    pub fn new(tables: Vec<Arc<dyn StagedTable>>) -> GenerationIndex {
        // active and staging both start at zero so that preloaded code
        // can be staged single threaded. The commit that ends preloading
        // sets things straight.
        GenerationIndex {
            active: AtomicU32::new(0),
            staging: AtomicU32::new(0),
            phase: AtomicU8::new(Phase::Idle as u8),
            tables,
        }
    }

    /// Resets the index to its bootstrap state.
    pub fn init(&self) {
        self.active.store(0, Ordering::Relaxed);
        self.staging.store(0, Ordering::Relaxed);
        self.phase.store(Phase::Idle as u8, Ordering::Release);
        log::trace!("init act={} stg={}", self.active(), self.staging());
    }

    /// The generation visible to running code. The returned value stays
    /// meaningful for as long as the caller looks at tables through it,
    /// so read it once per lookup and reuse it.
    pub fn active(&self) -> Generation {
        Generation(self.active.load(Ordering::Acquire))
    }

    /// The generation being staged. Only meaningful for the holder of
    /// the write permission.
    pub fn staging(&self) -> Generation {
        Generation(self.staging.load(Ordering::Relaxed))
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// True until the first commit has run.
    pub fn is_bootstrapping(&self) -> bool {
        self.active() == self.staging()
    }

    pub fn tables(&self) -> &[Arc<dyn StagedTable>] {
        &self.tables
    }

    fn cycle(&self) -> Cycle {
        Cycle { active: self.active(), staging: self.staging() }
    }

    fn check_phase(&self, from: &[Phase], op: &str) {
        let current = self.phase();
        let legal = from.contains(&current);
        debug_assert!(
            legal,
            "{op} called in phase {current:?}, expected one of {from:?}"
        );
        if !legal {
            log::error!(
                "{op} called in phase {current:?}, expected one of {from:?}"
            );
        }
    }

    fn transition(&self, from: &[Phase], to: Phase, op: &str) {
        self.check_phase(from, op);
        self.phase.store(to as u8, Ordering::Release);
    }

    /// Opens a staging cycle on every table. `num_new` is a hint for
    /// how many entries the cycle is about to add.
    pub fn begin_update(&self, num_new: usize) {
        self.transition(&[Phase::Idle], Phase::Staging, "begin_update");
        let cycle = self.cycle();
        for table in &self.tables {
            table.stage_begin(cycle, num_new);
        }
        log::trace!("start act={} stg={}", cycle.active, cycle.staging);
    }

    /// Closes the population phase. A table that finds its staged
    /// state unusable fails this call, after which the cycle can only
    /// be aborted.
    pub fn end_update(&self) -> io::Result<()> {
        self.check_phase(&[Phase::Staging], "end_update");
        let cycle = self.cycle();
        for table in &self.tables {
            if let Err(e) = stage_end(table.as_ref(), cycle) {
                log::warn!(
                    "table {} rejected staged generation {}: {e}",
                    table.name(),
                    cycle.staging
                );
                return Err(e);
            }
        }
        self.phase.store(Phase::Staged as u8, Ordering::Release);
        log::trace!("end act={} stg={}", cycle.active, cycle.staging);
        Ok(())
    }

    /// Makes the staging generation active.
    ///
    /// Tables publish before the flip, and the flip is a release store,
    /// so a reader that acquires the new id sees every staged write.
    pub fn commit(&self) {
        self.transition(&[Phase::Staged], Phase::Idle, "commit");
        let cycle = self.cycle();

        for table in &self.tables {
            table.publish(cycle);
        }

        let new_active = cycle.staging;
        self.active.store(new_active.get(), Ordering::Release);
        self.staging.store(new_active.next().get(), Ordering::Relaxed);

        // with two generations the vacated slot is the one we stage
        // into next, so anything cached against it is now stale.
        if cycle.active != new_active {
            for table in &self.tables {
                table.vacate(cycle.active);
            }
        }

        debug_assert_eq!(self.staging(), self.active().next());
        log::trace!("activate act={} stg={}", self.active(), self.staging());
    }

    /// Throws away everything staged in this cycle. `active` and
    /// `staging` are left alone, so the next cycle reuses the same slot.
    pub fn abort(&self) {
        self.transition(
            &[Phase::Staging, Phase::Staged],
            Phase::Idle,
            "abort",
        );
        let cycle = self.cycle();
        for table in &self.tables {
            table.discard(cycle);
        }
        log::trace!("abort act={} stg={}", cycle.active, cycle.staging);
    }
}

fn stage_end(table: &dyn StagedTable, cycle: Cycle) -> io::Result<()> {
    fallible!(table.stage_end(cycle));
    Ok(())
}
