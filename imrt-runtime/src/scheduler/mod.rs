/*
 *   Copyright (c) 2026 the imrt authors
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! Multi-worker pool that dispatches runnable tasks. The idle behaviour of
//! a worker is injected through [`IdleHook`] rather than modeled as a
//! base-class method to override — [`crate::reactor::Reactor`] supplies an
//! epoll-driven hook; a bare `Scheduler` just condvar-waits. This mirrors
//! the dependency-injection shape used elsewhere in this codebase to let a
//! generic driver thread host domain-specific I/O loops.

mod worker_loop;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crate::task::{Task, TaskState};

pub type WorkerId = usize;

pub(crate) enum WorkItem {
    Task(Arc<Task>),
    Thunk(Box<dyn FnOnce() + Send + 'static>),
}

struct QueueEntry {
    item: WorkItem,
    pinned: Option<WorkerId>,
}

/// Decides what a worker does when its queue holds no dispatchable item.
/// The default blocks on a condvar; [`crate::reactor::Reactor`] polls epoll
/// instead.
pub trait IdleHook: Send + Sync {
    /// Runs one iteration of idle behaviour. Returning `true` means the
    /// hook made progress (e.g. fired timers or I/O callbacks) and the
    /// worker should immediately re-check the queue; `false` means it
    /// actually blocked/waited.
    fn on_idle(&self, scheduler: &Scheduler) -> bool;

    /// Wakes any worker parked in `on_idle`. Called whenever `schedule`
    /// enqueues the first item into an empty queue, or enqueues an item
    /// pinned to a specific worker. A no-op by default.
    fn tickle(&self) {}
}

struct BlockingIdle {
    work_available: Condvar,
}

impl IdleHook for BlockingIdle {
    fn on_idle(&self, scheduler: &Scheduler) -> bool {
        let mut queue = scheduler.queue.lock().unwrap();
        if !queue.is_empty() || scheduler.should_stop(&queue) {
            return false;
        }
        let (guard, timeout) = self
            .work_available
            .wait_timeout(queue, std::time::Duration::from_millis(250))
            .unwrap();
        queue = guard;
        !timeout.timed_out() && !queue.is_empty()
    }

    fn tickle(&self) { self.work_available.notify_all(); }
}

pub struct Scheduler {
    name: String,
    worker_count: usize,
    queue: Mutex<VecDeque<QueueEntry>>,
    idle: Mutex<Arc<dyn IdleHook>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    auto_stop: AtomicBool,
    idle_workers: AtomicUsize,
}

thread_local! {
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<Weak<Scheduler>>> = const { std::cell::RefCell::new(None) };
    static CURRENT_WORKER_ID: std::cell::Cell<Option<WorkerId>> = const { std::cell::Cell::new(None) };
}

impl Scheduler {
    pub fn new(name: impl Into<String>, worker_count: usize) -> Arc<Scheduler> {
        let default_idle: Arc<dyn IdleHook> = Arc::new(BlockingIdle { work_available: Condvar::new() });
        Arc::new(Scheduler {
            name: name.into(),
            worker_count: worker_count.max(1),
            queue: Mutex::new(VecDeque::new()),
            idle: Mutex::new(default_idle),
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            idle_workers: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn worker_count(&self) -> usize { self.worker_count }

    /// Overrides the idle behaviour — used by [`crate::reactor::Reactor`]
    /// to splice its epoll-driven loop into every worker.
    pub fn set_idle_hook(&self, hook: Arc<dyn IdleHook>) { *self.idle.lock().unwrap() = hook; }

    fn idle_hook(&self) -> Arc<dyn IdleHook> { self.idle.lock().unwrap().clone() }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock().unwrap();
        for worker_id in 0..self.worker_count {
            let scheduler = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, worker_id))
                .spawn(move || worker_loop::run(scheduler, worker_id))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        tracing::info!(scheduler = %self.name, workers = self.worker_count, "scheduler started");
    }

    /// Enqueues `work`, optionally pinned to a specific worker. Wakes a
    /// worker when the item is the first in an empty queue, or whenever
    /// it's pinned, since a pinned item can otherwise sit unseen until that
    /// worker's next unrelated wakeup — the bare scheduler's `tickle` is a
    /// condvar notify; the Reactor's tickle writes to its wake-up pipe
    /// instead.
    pub fn schedule(&self, task: Arc<Task>, pinned: Option<WorkerId>) {
        self.enqueue(WorkItem::Task(task), pinned);
    }

    pub fn schedule_thunk(&self, thunk: impl FnOnce() + Send + 'static, pinned: Option<WorkerId>) {
        self.enqueue(WorkItem::Thunk(Box::new(thunk)), pinned);
    }

    pub fn schedule_batch(&self, tasks: impl IntoIterator<Item = Arc<Task>>) {
        for task in tasks {
            self.schedule(task, None);
        }
    }

    pub(crate) fn enqueue(&self, item: WorkItem, pinned: Option<WorkerId>) {
        let was_empty;
        {
            let mut queue = self.queue.lock().unwrap();
            was_empty = queue.is_empty();
            queue.push_back(QueueEntry { item, pinned });
        }
        if was_empty || pinned.is_some() {
            self.idle_hook().tickle();
        }
    }

    /// Pops the next item dispatchable on `worker_id`: one pinned to it, or
    /// the oldest unpinned one. FIFO within each of those two lanes; no
    /// ordering is guaranteed between them.
    pub(crate) fn pop_for_worker(&self, worker_id: WorkerId) -> Option<WorkItem> {
        let mut queue = self.queue.lock().unwrap();
        let index = queue
            .iter()
            .position(|e| e.pinned == Some(worker_id))
            .or_else(|| queue.iter().position(|e| e.pinned.is_none()))?;
        queue.remove(index).map(|e| e.item)
    }

    pub(crate) fn queue_is_empty(&self) -> bool { self.queue.lock().unwrap().is_empty() }

    fn should_stop(&self, queue: &VecDeque<QueueEntry>) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && queue.is_empty()
            && self.idle_workers.load(Ordering::SeqCst) >= self.worker_count
    }

    /// Moves the calling task to a different worker. Must be called from
    /// within a running task.
    pub fn switch_to(&self, worker_id: WorkerId) {
        let task = crate::task::current_task().expect("switch_to() called outside of a task");
        self.enqueue(WorkItem::Task(task), Some(worker_id));
        Task::yield_to_suspended();
    }

    /// The scheduler driving the task currently running on this thread, if
    /// any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub fn current_worker_id() -> Option<WorkerId> { CURRENT_WORKER_ID.with(|c| c.get()) }

    pub(crate) fn enter_worker(self: &Arc<Self>, worker_id: WorkerId) {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(Arc::downgrade(self)));
        CURRENT_WORKER_ID.with(|c| c.set(Some(worker_id)));
    }

    /// `stop()` sets auto-stop, wakes every worker once, then blocks until
    /// every worker thread joins. Idempotent after completion: a second
    /// call sees `running == false` and returns immediately.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.auto_stop.store(true, Ordering::SeqCst);
        self.idle_hook().tickle();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!(scheduler = %self.name, "scheduler stopped");
    }

    pub(crate) fn mark_idle(&self) { self.idle_workers.fetch_add(1, Ordering::SeqCst); }
    pub(crate) fn mark_busy(&self) { self.idle_workers.fetch_sub(1, Ordering::SeqCst); }

    pub(crate) fn resolve_task_post_resume(&self, task: Arc<Task>, worker_id: WorkerId) {
        match task.state() {
            TaskState::Ready => self.enqueue(WorkItem::Task(task), None),
            TaskState::Suspended => {}
            TaskState::Terminated | TaskState::Failed => {}
            other => {
                tracing::error!(?other, worker = worker_id, "task left resume() in an unexpected state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_schedule_runs_thunk() {
        let scheduler = Scheduler::new("test", 2);
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        scheduler.start();
        scheduler.schedule_thunk(move || { c.fetch_add(1, Ordering::SeqCst); }, None);
        std::thread::sleep(Duration::from_millis(100));
        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pinned_work_runs_on_named_worker() {
        let scheduler = Scheduler::new("test-pin", 4);
        let seen_worker = Arc::new(Mutex::new(None));
        let seen = seen_worker.clone();
        scheduler.start();
        scheduler.schedule_thunk(
            move || {
                *seen.lock().unwrap() = Scheduler::current_worker_id();
            },
            Some(2),
        );
        std::thread::sleep(Duration::from_millis(100));
        scheduler.stop();
        assert_eq!(*seen_worker.lock().unwrap(), Some(2));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let scheduler = Scheduler::new("test-idempotent", 1);
        scheduler.start();
        scheduler.stop();
        scheduler.stop();
    }
}
