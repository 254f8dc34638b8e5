//! The scheduling capabilities the write permission needs from its
//! runtime, and a thread-backed implementation of them.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use fault_injection::fallible;
use fnv::FnvHashMap;
use parking_lot::{Condvar, Mutex};

/// Identifies a schedulable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// A unit of background work that wants the write permission. It is
/// handed back to the scheduler when the permission is released, and
/// is expected to try to acquire it again when it runs.
pub struct Deferred(Box<dyn FnOnce() + Send + 'static>);

impl Deferred {
    pub fn new<A: Send + 'static>(func: fn(A), arg: A) -> Deferred {
        Deferred(Box::new(move || func(arg)))
    }

    pub fn from_fn<F: FnOnce() + Send + 'static>(f: F) -> Deferred {
        Deferred(Box::new(f))
    }

    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deferred")
    }
}

/// What the write permission consumes from the runtime's scheduler.
pub trait Scheduler: Send + Sync {
    /// Marks `task` as not runnable. Called while the permission's queue
    /// lock is held, so this must only record state, never block. The
    /// task itself yields later.
    fn suspend(&self, task: TaskId);

    /// Makes a suspended task runnable again.
    fn resume(&self, task: TaskId);

    /// Runs `work` asynchronously on some background thread.
    fn submit_background(&self, work: Deferred);

    /// Tasks on their way out are not worth waking, and are refused the
    /// write permission instead of being queued.
    fn is_exiting(&self, _task: TaskId) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Runnable,
    Suspended,
    Exiting,
}

enum WorkerMessage {
    Work(Deferred),
    Shutdown,
}

#[derive(Default)]
struct Tasks {
    states: Mutex<FnvHashMap<TaskId, TaskState>>,
    cv: Condvar,
}

/// A [`Scheduler`] whose tasks are OS threads and whose background work
/// runs on a small pool of named worker threads.
pub struct ThreadScheduler {
    tasks: Arc<Tasks>,
    next_task_id: AtomicU64,
    tx: Sender<WorkerMessage>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("tasks", &self.tasks.states.lock().len())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in &workers {
            if self.tx.send(WorkerMessage::Shutdown).is_err() {
                break;
            }
        }
        let me = thread::current().id();
        for worker in workers {
            if worker.thread().id() == me {
                // dropped from inside deferred work, the message above
                // is enough to stop this worker once it returns.
                continue;
            }
            if let Err(e) = worker.join() {
                log::error!("background worker panicked: {e:?}");
            }
        }
    }
}

fn worker(rx: Receiver<WorkerMessage>) {
    loop {
        match rx.recv() {
            Ok(WorkerMessage::Work(work)) => work.run(),
            Ok(WorkerMessage::Shutdown) => return,
            Err(e) => {
                log::error!(
                    "background worker unable to receive message, unexpected shutdown: {e:?}"
                );
                return;
            }
        }
    }
}

impl ThreadScheduler {
    /// Spawns `background_threads` workers, at least one.
    pub fn new(background_threads: usize) -> io::Result<ThreadScheduler> {
        let (tx, rx) = unbounded();
        let mut workers = Vec::with_capacity(background_threads.max(1));
        for n in 0..background_threads.max(1) {
            let rx = rx.clone();
            let spawn_res = thread::Builder::new()
                .name(format!("hotload_bg_{n}"))
                .spawn(move || worker(rx));
            workers.push(fallible!(spawn_res));
        }

        Ok(ThreadScheduler {
            tasks: Arc::default(),
            next_task_id: AtomicU64::new(1),
            tx,
            workers: Mutex::new(workers),
        })
    }

    /// Registers a new runnable task.
    pub fn spawn_task(&self) -> TaskId {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        self.tasks.states.lock().insert(id, TaskState::Runnable);
        id
    }

    /// Blocks the calling thread while `task` is suspended. Returns at
    /// once if it was already resumed, which is what makes a resume
    /// that races ahead of the park harmless.
    pub fn park(&self, task: TaskId) {
        let mut states = self.tasks.states.lock();
        while states.get(&task) == Some(&TaskState::Suspended) {
            self.tasks.cv.wait(&mut states);
        }
    }

    /// Marks `task` as exiting. It will not be resumed again, and a
    /// `park` it is blocked in returns.
    pub fn exit(&self, task: TaskId) {
        if let Some(state) = self.tasks.states.lock().get_mut(&task) {
            *state = TaskState::Exiting;
        }
        self.tasks.cv.notify_all();
    }

    /// Forgets `task` entirely. From then on it is treated like an
    /// exiting task.
    pub fn retire(&self, task: TaskId) {
        self.tasks.states.lock().remove(&task);
        self.tasks.cv.notify_all();
    }

    /// Number of tasks spawned and not yet retired.
    pub fn task_count(&self) -> usize {
        self.tasks.states.lock().len()
    }

    pub fn is_suspended(&self, task: TaskId) -> bool {
        self.tasks.states.lock().get(&task) == Some(&TaskState::Suspended)
    }
}

impl Scheduler for ThreadScheduler {
    fn suspend(&self, task: TaskId) {
        let mut states = self.tasks.states.lock();
        if let Some(state) = states.get_mut(&task) {
            if *state == TaskState::Runnable {
                *state = TaskState::Suspended;
            }
        }
    }

    fn resume(&self, task: TaskId) {
        let mut states = self.tasks.states.lock();
        if let Some(state) = states.get_mut(&task) {
            if *state == TaskState::Suspended {
                *state = TaskState::Runnable;
            }
        }
        drop(states);
        self.tasks.cv.notify_all();
    }

    fn submit_background(&self, work: Deferred) {
        if self.tx.send(WorkerMessage::Work(work)).is_err() {
            log::error!("background pool is gone, dropping deferred work");
        }
    }

    fn is_exiting(&self, task: TaskId) -> bool {
        !matches!(
            self.tasks.states.lock().get(&task),
            Some(TaskState::Runnable | TaskState::Suspended)
        )
    }
}

#[test]
fn resume_before_park_is_not_lost() {
    let scheduler = ThreadScheduler::new(1).unwrap();
    let task = scheduler.spawn_task();

    scheduler.suspend(task);
    assert!(scheduler.is_suspended(task));
    scheduler.resume(task);
    scheduler.park(task);
    assert!(!scheduler.is_suspended(task));
}

#[test]
fn park_blocks_until_resumed() {
    let scheduler = Arc::new(ThreadScheduler::new(1).unwrap());
    let task = scheduler.spawn_task();
    scheduler.suspend(task);

    let s2 = scheduler.clone();
    let waker = thread::spawn(move || {
        thread::sleep(std::time::Duration::from_millis(20));
        s2.resume(task);
    });

    scheduler.park(task);
    assert!(!scheduler.is_suspended(task));
    waker.join().unwrap();
}

#[test]
fn exit_unparks_and_retire_forgets() {
    let scheduler = Arc::new(ThreadScheduler::new(1).unwrap());
    let tasks: Vec<TaskId> = (0..3).map(|_| scheduler.spawn_task()).collect();
    assert_eq!(scheduler.task_count(), 3);

    let task = tasks[0];
    scheduler.suspend(task);
    let s2 = scheduler.clone();
    let exiter = thread::spawn(move || {
        thread::sleep(std::time::Duration::from_millis(20));
        s2.exit(task);
    });
    scheduler.park(task);
    exiter.join().unwrap();
    assert!(scheduler.is_exiting(task));

    // exiting tasks stay exiting
    scheduler.suspend(task);
    scheduler.resume(task);
    assert!(scheduler.is_exiting(task));

    for task in &tasks[..2] {
        scheduler.retire(*task);
    }
    assert_eq!(scheduler.task_count(), 1);
    assert!(scheduler.is_exiting(tasks[1]));
    assert!(!scheduler.is_exiting(tasks[2]));

    // retired tasks are not brought back by a stray suspend
    scheduler.suspend(tasks[1]);
    assert_eq!(scheduler.task_count(), 1);
    scheduler.park(tasks[1]);
}

#[test]
fn background_work_runs() {
    let scheduler = ThreadScheduler::new(2).unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);
    scheduler.submit_background(Deferred::new(
        |tx: Sender<u32>| tx.send(42).unwrap(),
        tx,
    ));
    assert_eq!(rx.recv().unwrap(), 42);
}
