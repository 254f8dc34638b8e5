#![allow(dead_code)]

// A scheduler that only records what the write permission asks of it.
// Suspends and resumes are bookkeeping, background work is either run
// on the spot or parked in a queue for the test to run by hand.

use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use hotload::{Deferred, Scheduler, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Suspend(TaskId),
    Resume(TaskId),
    Background,
}

#[derive(Default)]
pub struct RecordingScheduler {
    events: SegQueue<Event>,
    background: Mutex<Vec<Deferred>>,
    exiting: Mutex<Vec<TaskId>>,
}

impl RecordingScheduler {
    pub fn new() -> Arc<RecordingScheduler> {
        Arc::new(RecordingScheduler::default())
    }

    /// Everything recorded since the last call.
    pub fn drain(&self) -> Vec<Event> {
        let mut ret = vec![];
        while let Some(event) = self.events.pop() {
            ret.push(event);
        }
        ret
    }

    pub fn run_background(&self) -> usize {
        let work = std::mem::take(&mut *self.background.lock());
        let n = work.len();
        for w in work {
            w.run();
        }
        n
    }

    pub fn mark_exiting(&self, task: TaskId) {
        self.exiting.lock().push(task);
    }
}

impl Scheduler for RecordingScheduler {
    fn suspend(&self, task: TaskId) {
        self.events.push(Event::Suspend(task));
    }

    fn resume(&self, task: TaskId) {
        self.events.push(Event::Resume(task));
    }

    fn submit_background(&self, work: Deferred) {
        self.events.push(Event::Background);
        self.background.lock().push(work);
    }

    fn is_exiting(&self, task: TaskId) -> bool {
        self.exiting.lock().contains(&task)
    }
}
