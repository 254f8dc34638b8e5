use std::fmt;
use std::hash::Hash;
use std::io;
use std::sync::Arc;

use fault_injection::annotate;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};

use crate::generation::{Generation, NUM_GENERATIONS};

/// The pair of generations a staging cycle works against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    /// What readers currently see.
    pub active: Generation,
    /// What this cycle writes into.
    pub staging: Generation,
}

/// A table that keeps one copy of its contents per generation and
/// takes part in the staging protocol driven by
/// [`GenerationIndex`](crate::GenerationIndex).
///
/// All methods are called by the holder of the write permission only,
/// never concurrently with each other.
pub trait StagedTable: Send + Sync {
    fn name(&self) -> &str;

    /// A cycle is opening. `capacity_hint` is how many entries the
    /// holder expects to add.
    fn stage_begin(&self, cycle: Cycle, capacity_hint: usize);

    /// No more writes will arrive in this cycle.
    fn stage_end(&self, cycle: Cycle) -> io::Result<()>;

    /// The staged copy becomes the contents of `cycle.staging`. Runs
    /// before the active generation flips.
    fn publish(&self, cycle: Cycle);

    /// Drop whatever was staged in this cycle.
    fn discard(&self, cycle: Cycle);

    /// `generation` has just stopped being active. Anything cached
    /// against it must go.
    fn vacate(&self, _generation: Generation) {}
}

type Validator<K, V> =
    Box<dyn Fn(&FnvHashMap<K, V>) -> io::Result<()> + Send + Sync>;

struct Pending<K, V> {
    cycle: Cycle,
    map: FnvHashMap<K, V>,
    sealed: bool,
}

/// A hash map with one immutable snapshot per generation.
///
/// Readers pick a generation (normally the active one) and look keys up
/// in its snapshot. The permission holder stages a whole new snapshot
/// on the side, which becomes visible in one step when the index
/// commits.
pub struct StagedMap<K, V> {
    name: String,
    slots: [RwLock<Arc<FnvHashMap<K, V>>>; NUM_GENERATIONS as usize],
    pending: Mutex<Option<Pending<K, V>>>,
    validator: Option<Validator<K, V>>,
}

impl<K, V> fmt::Debug for StagedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lens: Vec<usize> = self.slots.iter().map(|s| s.read().len()).collect();
        f.debug_struct("StagedMap")
            .field("name", &self.name)
            .field("slot_lens", &lens)
            .field("staging", &self.pending.lock().is_some())
            .finish()
    }
}

impl<K, V> StagedMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(name: impl Into<String>) -> StagedMap<K, V> {
        StagedMap {
            name: name.into(),
            slots: std::array::from_fn(|_| RwLock::new(Arc::default())),
            pending: Mutex::new(None),
            validator: None,
        }
    }

    /// Installs a check that runs against the fully staged map when the
    /// cycle ends. An error makes `end_update` fail.
    pub fn with_validator<F>(mut self, validator: F) -> StagedMap<K, V>
    where
        F: Fn(&FnvHashMap<K, V>) -> io::Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn snapshot(&self, generation: Generation) -> Arc<FnvHashMap<K, V>> {
        self.slots[generation.as_index()].read().clone()
    }

    pub fn get(&self, generation: Generation, key: &K) -> Option<V> {
        self.slots[generation.as_index()].read().get(key).cloned()
    }

    pub fn len(&self, generation: Generation) -> usize {
        self.slots[generation.as_index()].read().len()
    }

    pub fn is_empty(&self, generation: Generation) -> bool {
        self.len(generation) == 0
    }

    /// Writes into the staging copy. Returns the value previously staged
    /// under `key`.
    pub fn stage_insert(&self, key: K, value: V) -> Option<V> {
        self.with_pending("stage_insert", |map| map.insert(key, value))
            .flatten()
    }

    pub fn stage_remove(&self, key: &K) -> Option<V> {
        self.with_pending("stage_remove", |map| map.remove(key)).flatten()
    }

    fn with_pending<R>(
        &self,
        op: &str,
        f: impl FnOnce(&mut FnvHashMap<K, V>) -> R,
    ) -> Option<R> {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(p) if !p.sealed => Some(f(&mut p.map)),
            Some(_) => {
                debug_assert!(false, "{op} on sealed table {}", self.name);
                log::error!("{op} on sealed table {}", self.name);
                None
            }
            None => {
                debug_assert!(false, "{op} outside of a cycle on {}", self.name);
                log::error!("{op} outside of a cycle on {}", self.name);
                None
            }
        }
    }
}

impl<K, V> StagedTable for StagedMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stage_begin(&self, cycle: Cycle, capacity_hint: usize) {
        let active = self.snapshot(cycle.active);
        let mut map = FnvHashMap::default();
        map.reserve(active.len() + capacity_hint);
        map.extend(active.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut pending = self.pending.lock();
        debug_assert!(pending.is_none(), "{} already staging", self.name);
        *pending = Some(Pending { cycle, map, sealed: false });
    }

    fn stage_end(&self, cycle: Cycle) -> io::Result<()> {
        let mut pending = self.pending.lock();
        let Some(p) = pending.as_mut() else {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: stage_end without stage_begin", self.name),
            )));
        };
        debug_assert_eq!(p.cycle, cycle);
        if let Some(validator) = &self.validator {
            validator(&p.map)?;
        }
        p.sealed = true;
        Ok(())
    }

    fn publish(&self, cycle: Cycle) {
        let Some(p) = self.pending.lock().take() else {
            debug_assert!(false, "{}: publish without staged state", self.name);
            log::error!("{}: publish without staged state", self.name);
            return;
        };
        debug_assert!(p.sealed);
        debug_assert_eq!(p.cycle, cycle);
        *self.slots[cycle.staging.as_index()].write() = Arc::new(p.map);
    }

    fn discard(&self, _cycle: Cycle) {
        if let Some(p) = self.pending.lock().take() {
            log::debug!(
                "{}: discarding {} staged entries for {}",
                self.name,
                p.map.len(),
                p.cycle.staging
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(active: u32, staging: u32) -> Cycle {
        Cycle {
            active: Generation::new(active),
            staging: Generation::new(staging),
        }
    }

    #[test]
    fn staged_writes_are_invisible_until_published() {
        let map: StagedMap<&str, u64> = StagedMap::new("modules");
        let c = cycle(0, 1);

        map.stage_begin(c, 2);
        map.stage_insert("lists", 1);
        map.stage_insert("maps", 2);
        assert!(map.is_empty(c.staging));
        map.stage_end(c).unwrap();
        assert!(map.is_empty(c.staging));

        map.publish(c);
        assert_eq!(map.get(c.staging, &"maps"), Some(2));
        assert!(map.is_empty(c.active));
    }

    #[test]
    fn snapshots_survive_later_cycles() {
        let map: StagedMap<u8, u8> = StagedMap::new("catches");
        let first = cycle(0, 1);
        map.stage_begin(first, 1);
        map.stage_insert(1, 1);
        map.stage_end(first).unwrap();
        map.publish(first);

        let held = map.snapshot(Generation::new(1));

        let second = cycle(1, 0);
        map.stage_begin(second, 0);
        map.stage_remove(&1);
        map.stage_insert(2, 2);
        map.stage_end(second).unwrap();
        map.publish(second);

        assert_eq!(held.get(&1), Some(&1));
        assert_eq!(map.get(Generation::new(0), &1), None);
        assert_eq!(map.get(Generation::new(0), &2), Some(2));
    }

    #[test]
    fn validator_rejects_staged_state() {
        let map: StagedMap<u32, u32> =
            StagedMap::new("ranges").with_validator(|m| {
                if m.len() > 1 {
                    Err(io::Error::new(io::ErrorKind::InvalidData, "too big"))
                } else {
                    Ok(())
                }
            });
        let c = cycle(0, 1);
        map.stage_begin(c, 2);
        map.stage_insert(1, 1);
        map.stage_insert(2, 2);
        let err = map.stage_end(c).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        map.discard(c);
        assert!(map.is_empty(c.staging));
        assert!(map.pending.lock().is_none());
    }
}
