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

//! A counting semaphore whose `wait()` suspends the *task*, not the worker
//! thread — acquiring an exhausted one is one of the suspension points in
//! spec §5. [`crate::rpc`]'s bounded outbound queue is built out of a pair
//! of these (one counting free slots, one counting queued items).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::scheduler::Scheduler;
use crate::task::{current_task, Task};

struct Waiter {
    scheduler: Arc<Scheduler>,
    task: Arc<Task>,
}

struct Inner {
    concurrency: usize,
    waiters: VecDeque<Waiter>,
}

/// A counting semaphore for cooperative tasks. `wait()` either takes a
/// permit immediately or parks the calling task on a FIFO waiter list;
/// `notify()` hands a permit directly to the oldest waiter if one exists,
/// otherwise increments the count for a future `wait()` to find.
pub struct CoroutineSemaphore {
    inner: Mutex<Inner>,
}

impl CoroutineSemaphore {
    pub fn new(initial_concurrency: usize) -> Arc<CoroutineSemaphore> {
        Arc::new(CoroutineSemaphore { inner: Mutex::new(Inner { concurrency: initial_concurrency, waiters: VecDeque::new() }) })
    }

    /// Takes a permit without blocking if one is immediately available.
    pub fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.concurrency > 0 {
            inner.concurrency -= 1;
            true
        } else {
            false
        }
    }

    /// Takes a permit, suspending the current task until `notify()` hands
    /// one directly to it if none is available right now. Must be called
    /// from within a running task.
    pub fn wait(&self) {
        let granted = {
            let mut inner = self.inner.lock().unwrap();
            if inner.concurrency > 0 {
                inner.concurrency -= 1;
                true
            } else {
                let task = current_task().expect("CoroutineSemaphore::wait called outside of a task");
                let scheduler = Scheduler::current().expect("CoroutineSemaphore::wait called outside of a scheduler");
                inner.waiters.push_back(Waiter { scheduler, task });
                false
            }
        };
        if !granted {
            Task::yield_to_suspended();
        }
    }

    /// Releases a permit: hands it straight to the oldest waiter (waking
    /// it on its own scheduler) if one is parked, otherwise banks it for a
    /// future `wait()`/`try_wait()`.
    pub fn notify(&self) {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            match inner.waiters.pop_front() {
                Some(waiter) => Some(waiter),
                None => {
                    inner.concurrency += 1;
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            waiter.scheduler.schedule(waiter.task, None);
        }
    }

    pub fn concurrency(&self) -> usize { self.inner.lock().unwrap().concurrency }

    pub fn reset(&self) { self.inner.lock().unwrap().concurrency = 0; }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_try_wait_respects_initial_concurrency() {
        let sem = CoroutineSemaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.notify();
        assert!(sem.try_wait());
    }

    #[test]
    fn test_notify_wakes_waiting_task() {
        let scheduler = Scheduler::new("sem-test", 1);
        scheduler.start();
        let sem = CoroutineSemaphore::new(0);
        let woke = Arc::new(AtomicU32::new(0));
        let sem2 = sem.clone();
        let woke2 = woke.clone();
        scheduler.schedule_thunk(
            move || {
                sem2.wait();
                woke2.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(woke.load(Ordering::SeqCst), 0, "waiter should still be parked");
        sem.notify();
        std::thread::sleep(Duration::from_millis(50));
        scheduler.stop();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
    }
}
