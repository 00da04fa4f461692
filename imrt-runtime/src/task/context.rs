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

//! Thread-local "current task" / "current yielder" bookkeeping.
//!
//! These are read on every suspension point, so they are true
//! thread-locals rather than a global map keyed by `ThreadId` — a lookup
//! there would need its own lock, taken on the hottest path in the runtime.
//!
//! The yielder pointer is valid for as long as the owning task's stack
//! frame is parked mid-[`fringe::generator::Yielder::suspend`] — which is
//! exactly the window during which [`super::Task::yield_to_suspended`] and
//! [`super::Task::yield_to_ready`] are allowed to be called from within the
//! task's own thunk.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use fringe::generator::Yielder;

use super::{Task, TaskId, TaskState};

pub(super) type TaskYielder = Yielder<'static, (), ()>;

thread_local! {
    static CURRENT_TASK: RefCell<Option<(TaskId, Weak<Task>)>> = const { RefCell::new(None) };
    static CURRENT_YIELDER: Cell<*mut TaskYielder> = Cell::new(std::ptr::null_mut());
}

/// Installed by the generator body right before running the user thunk, and
/// cleared when the thunk returns (normally or by panic).
pub(super) struct ActiveGuard;

impl ActiveGuard {
    pub(super) fn enter(task: &Arc<Task>, yielder: &mut TaskYielder) -> ActiveGuard {
        CURRENT_TASK.with(|c| *c.borrow_mut() = Some((task.id(), Arc::downgrade(task))));
        CURRENT_YIELDER.with(|c| c.set(yielder as *mut TaskYielder));
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|c| *c.borrow_mut() = None);
        CURRENT_YIELDER.with(|c| c.set(std::ptr::null_mut()));
    }
}

/// The id of the task currently running on this OS thread, if any.
pub fn current_task_id() -> Option<TaskId> { CURRENT_TASK.with(|c| c.borrow().as_ref().map(|(id, _)| *id)) }

/// A strong handle to the task currently running on this OS thread, if any.
pub fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|c| c.borrow().as_ref().and_then(|(_, weak)| weak.upgrade()))
}

pub(super) fn set_current_state(state: TaskState) {
    if let Some(task) = current_task() {
        *task.state.lock() = state;
    }
}

/// Suspends the task currently running on this thread by calling
/// `Yielder::suspend` on its thread-local yielder. Panics if called
/// outside of a running task (a contract violation).
pub(super) fn suspend_current() {
    let yielder = CURRENT_YIELDER.with(|c| c.get());
    assert!(!yielder.is_null(), "yield called outside of a running task");
    // SAFETY: the pointer is only non-null while the owning stack frame is
    // parked inside `suspend`, which is precisely the lifetime in which
    // this function may run (it is only reachable from task-thunk code).
    unsafe { (*yielder).suspend(()) };
}
