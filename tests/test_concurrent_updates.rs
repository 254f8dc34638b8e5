mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::{Arc, Barrier};
use std::thread;

use crossbeam_channel::{Sender, unbounded};

use hotload::{
    CodeManager, Config, Deferred, Scheduler, StagedMap, StagedTable,
    ThreadScheduler,
};

const N_TASK_WRITERS: usize = 4;
const N_BACKGROUND_WRITERS: usize = 4;
const N_READERS: usize = 4;
const CYCLES_PER_WRITER: u64 = 50;

/// Key 0 holds the version, keys 1..=version hold one entry each.
type Exports = StagedMap<u64, u64>;
type Modules = StagedMap<&'static str, u64>;

#[derive(Clone)]
struct Shared {
    manager: CodeManager,
    exports: Arc<Exports>,
    modules: Arc<Modules>,
    version: Arc<AtomicU64>,
    /// Bumped by the holder before anything is published, so a reader
    /// that sees it unchanged across its reads saw no publish either.
    cycles: Arc<AtomicU64>,
}

impl Shared {
    // must hold the write permission
    fn stage_next_version(&self) -> u64 {
        self.cycles.fetch_add(1, SeqCst);
        let v = self.version.fetch_add(1, SeqCst) + 1;
        self.exports.stage_insert(0, v);
        self.exports.stage_insert(v, v);
        self.modules.stage_insert("version", v);
        v
    }
}

fn background_writer(ctx: (Shared, Sender<u64>)) {
    let (shared, done) = ctx;
    let retry = Deferred::new(background_writer, (shared.clone(), done.clone()));
    let Some(guard) = shared.manager.try_seize_deferred(retry) else {
        return;
    };
    let cycle = guard.begin_update(1);
    let v = shared.stage_next_version();
    cycle.commit().unwrap();
    drop(guard);
    done.send(v).unwrap();
}

fn check(shared: &Shared) -> bool {
    let c1 = shared.cycles.load(SeqCst);
    let g = shared.manager.active_generation();
    let exports = shared.exports.snapshot(g);
    let modules = shared.modules.snapshot(g);
    let c2 = shared.cycles.load(SeqCst);

    if c1 != c2 {
        // the slot may have been restaged under us
        return false;
    }

    let version = exports.get(&0).copied().unwrap_or(0);
    assert_eq!(modules.get("version").copied().unwrap_or(0), version);
    assert_eq!(exports.len() as u64, if version == 0 { 0 } else { version + 1 });
    for k in 1..=version {
        assert_eq!(exports.get(&k), Some(&k), "torn generation {g}");
    }
    true
}

#[test]
fn readers_never_see_a_torn_generation() {
    common::setup_logger();

    let config = Config { background_threads: 3, ..Config::default() };
    let scheduler = Arc::new(config.thread_scheduler().unwrap());
    let exports = Arc::new(Exports::new("exports"));
    let modules = Arc::new(Modules::new("modules"));
    let tables: Vec<Arc<dyn StagedTable>> =
        vec![exports.clone(), modules.clone()];
    let manager = config.open(scheduler.clone(), tables);
    manager.bootstrap().unwrap();

    let shared = Shared {
        manager,
        exports,
        modules,
        version: Arc::new(AtomicU64::new(0)),
        cycles: Arc::new(AtomicU64::new(0)),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(N_TASK_WRITERS + N_READERS + 1));

    let readers: Vec<_> = (0..N_READERS)
        .map(|n| {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            let start = start.clone();
            thread::Builder::new()
                .name(format!("reader_{n}"))
                .spawn(move || {
                    start.wait();
                    let mut checked = 0_u64;
                    // once the writers are done every check goes through
                    while !shutdown.load(SeqCst) || checked == 0 {
                        if check(&shared) {
                            checked += 1;
                        }
                    }
                    checked
                })
                .unwrap()
        })
        .collect();

    let writers: Vec<_> = (0..N_TASK_WRITERS)
        .map(|n| {
            let shared = shared.clone();
            let scheduler: Arc<ThreadScheduler> = scheduler.clone();
            let start = start.clone();
            thread::Builder::new()
                .name(format!("writer_{n}"))
                .spawn(move || {
                    let task = scheduler.spawn_task();
                    start.wait();
                    for _ in 0..CYCLES_PER_WRITER {
                        shared
                            .manager
                            .update(task, |t| scheduler.park(t), 1, |_| {
                                Ok(shared.stage_next_version())
                            })
                            .unwrap();
                    }
                })
                .unwrap()
        })
        .collect();

    let (done_tx, done_rx) = unbounded();
    start.wait();
    for _ in 0..N_BACKGROUND_WRITERS {
        background_writer((shared.clone(), done_tx.clone()));
    }

    for writer in writers {
        writer.join().unwrap();
    }
    for _ in 0..N_BACKGROUND_WRITERS {
        done_rx.recv().unwrap();
    }

    shutdown.store(true, SeqCst);
    let mut checked = 0;
    for reader in readers {
        let n = reader.join().unwrap();
        assert!(n > 0);
        checked += n;
    }
    log::info!("readers validated {checked} generations");

    let total = N_TASK_WRITERS as u64 * CYCLES_PER_WRITER
        + N_BACKGROUND_WRITERS as u64;
    assert_eq!(shared.cycles.load(SeqCst), total);
    assert!(check(&shared));
    let active = shared.manager.active_generation();
    assert_eq!(shared.exports.get(active, &0), Some(total));
    assert_eq!(shared.manager.staging_generation(), active.next());
    assert!(!shared.manager.permission().is_held());
    assert_eq!(shared.manager.permission().waiter_count(), 0);
}

#[test]
fn parked_task_wakes_up_on_release() {
    common::setup_logger();

    let scheduler = Arc::new(ThreadScheduler::new(1).unwrap());
    let exports = Arc::new(Exports::new("exports"));
    let tables: Vec<Arc<dyn StagedTable>> = vec![exports.clone()];
    let manager = Config::default().open(scheduler.clone(), tables);
    manager.bootstrap().unwrap();

    let holder = scheduler.spawn_task();
    let waiter = scheduler.spawn_task();
    let guard = manager.try_seize(holder).unwrap();

    let m2 = manager.clone();
    let s2 = scheduler.clone();
    let (tx, rx) = unbounded();
    let t = thread::spawn(move || {
        let guard = m2
            .seize(waiter, |t| {
                tx.send(()).unwrap();
                s2.park(t)
            })
            .unwrap();
        let cycle = guard.begin_update(1);
        cycle.commit().unwrap()
    });

    // the waiter has queued and parked (or is about to)
    rx.recv().unwrap();
    assert!(scheduler.is_suspended(waiter));

    let cycle = guard.begin_update(1);
    exports.stage_insert(1, 1);
    let first = cycle.commit().unwrap();
    drop(guard);

    let second = t.join().unwrap();
    assert_ne!(first, second);
    assert_eq!(manager.active_generation(), second);
    assert_eq!(exports.get(second, &1), Some(1));
}

#[test]
fn exiting_waiter_stops_seizing() {
    common::setup_logger();

    let scheduler = Arc::new(ThreadScheduler::new(1).unwrap());
    let exports = Arc::new(Exports::new("exports"));
    let tables: Vec<Arc<dyn StagedTable>> = vec![exports.clone()];
    let manager = Config::default().open(scheduler.clone(), tables);
    manager.bootstrap().unwrap();

    let holder = scheduler.spawn_task();
    let waiter = scheduler.spawn_task();
    let guard = manager.try_seize(holder).unwrap();

    let m2 = manager.clone();
    let s2 = scheduler.clone();
    let (tx, rx) = unbounded();
    let t = thread::spawn(move || {
        let mut parks = 0_usize;
        let seized = m2
            .seize(waiter, |t| {
                parks += 1;
                tx.send(()).unwrap();
                s2.park(t)
            })
            .is_some();
        (seized, parks)
    });

    rx.recv().unwrap();
    scheduler.exit(waiter);

    let (seized, parks) = t.join().unwrap();
    assert!(!seized);
    assert_eq!(parks, 1);
    assert_eq!(manager.permission().waiter_count(), 1);

    drop(guard);
    assert_eq!(manager.permission().waiter_count(), 0);
    assert!(scheduler.is_exiting(waiter));

    scheduler.retire(waiter);
    scheduler.retire(holder);
    manager.forget_task(waiter);
    manager.forget_task(holder);
    assert_eq!(scheduler.task_count(), 0);
}
