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

//! The body run by every scheduler worker thread: pop, resume, reschedule,
//! idle, repeat.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::task::Task;

use super::{Scheduler, WorkItem, WorkerId};

pub(super) fn run(scheduler: Arc<Scheduler>, worker_id: WorkerId) {
    scheduler.enter_worker(worker_id);
    loop {
        match scheduler.pop_for_worker(worker_id) {
            Some(WorkItem::Task(task)) => {
                scheduler.mark_busy();
                dispatch_task(&scheduler, task, worker_id);
            }
            Some(WorkItem::Thunk(thunk)) => {
                scheduler.mark_busy();
                dispatch_thunk(&scheduler, thunk, worker_id);
            }
            None => {
                if scheduler.should_stop_now() {
                    break;
                }
                scheduler.mark_idle();
                scheduler.idle_hook().on_idle(&scheduler);
                scheduler.mark_busy();
            }
        }
    }
}

fn dispatch_task(scheduler: &Arc<Scheduler>, task: Arc<Task>, worker_id: WorkerId) {
    task.resume();
    scheduler.resolve_task_post_resume(task, worker_id);
}

fn dispatch_thunk(scheduler: &Arc<Scheduler>, thunk: Box<dyn FnOnce() + Send + 'static>, worker_id: WorkerId) {
    // A bare thunk gets wrapped in a one-shot task so it runs under the same
    // suspend/resume machinery as scheduled coroutine work; if it never
    // suspends it just runs straight to Terminated.
    let task = Task::create(thunk, crate::config::default_task_stack_size(), false);
    dispatch_task(scheduler, task, worker_id);
}

impl Scheduler {
    fn should_stop_now(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst) && self.queue_is_empty()
    }
}
