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

//! A suspendable computation with its own stack and saved machine context.
//! The context switch itself is delegated to [`fringe`]'s stackful
//! generators: `resume()` is `Generator::resume`, and a suspension point is
//! the thunk calling `Yielder::suspend` through the thread-local plumbing in
//! [`context`].

mod context;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fringe::generator::Generator;
use fringe::OsStack;
use imrt_core::{Noncopyable, Spinlock};

pub use context::{current_task, current_task_id};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Ready,
    Running,
    Suspended,
    Terminated,
    Failed,
}

type TaskThunk = Box<dyn FnOnce() + Send + 'static>;
type TaskGenerator = Generator<'static, (), (), OsStack>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> TaskId { NEXT_ID.fetch_add(1, Ordering::Relaxed) }

/// A cooperatively scheduled unit of execution. Exclusively owned by the
/// scheduler queue while pending, and by the current worker while running —
/// this crate enforces that by always handing the task out as `Arc<Task>`
/// and never exposing `&mut Task`.
pub struct Task {
    id: TaskId,
    hybrid: bool,
    stack_size: usize,
    state: Spinlock<TaskState>,
    generator: Spinlock<Option<TaskGenerator>>,
    _pin: Noncopyable,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .field("hybrid", &self.hybrid)
            .finish()
    }
}

impl Task {
    /// Creates a task in `Init` state running `thunk` on a stack of
    /// `stack_size` bytes. `hybrid` changes only which root context is used
    /// as the yield target; the state machine is unchanged.
    pub fn create(thunk: impl FnOnce() + Send + 'static, stack_size: usize, hybrid: bool) -> Arc<Task> {
        let task = Arc::new(Task {
            id: next_id(),
            hybrid,
            stack_size,
            state: Spinlock::new(TaskState::Init),
            generator: Spinlock::new(None),
            _pin: Noncopyable::new(),
        });
        task.reset(thunk);
        task
    }

    pub fn id(&self) -> TaskId { self.id }

    pub fn state(&self) -> TaskState { *self.state.lock() }

    pub fn is_hybrid(&self) -> bool { self.hybrid }

    /// Reinitializes the saved context to start `thunk` on the existing
    /// stack. Legal only in `Init`, `Terminated`, or `Failed` states; panics
    /// otherwise, since calling it elsewhere is a programmer error (a
    /// contract violation).
    pub fn reset(self: &Arc<Self>, thunk: impl FnOnce() + Send + 'static) {
        {
            let state = self.state.lock();
            assert!(
                matches!(*state, TaskState::Init | TaskState::Terminated | TaskState::Failed),
                "reset() called while task is {:?}",
                *state
            );
        }
        let stack = OsStack::new(self.stack_size).expect("failed to allocate task stack");
        let weak = Arc::downgrade(self);
        let boxed_thunk: TaskThunk = Box::new(thunk);
        let generator = Generator::new(stack, move |yielder, ()| {
            let task = match weak.upgrade() {
                Some(task) => task,
                None => return, // scheduler dropped the task before it ever ran
            };
            let _guard = context::ActiveGuard::enter(&task, yielder);
            let result = catch_unwind(AssertUnwindSafe(boxed_thunk));
            *task.state.lock() = match result {
                Ok(()) => TaskState::Terminated,
                Err(_) => TaskState::Failed,
            };
        });
        *self.state.lock() = TaskState::Init;
        *self.generator.lock() = Some(generator);
    }

    /// Transfers control from the current worker's root context to this
    /// task's saved context. Returns once the task suspends or terminates.
    /// Accepts `Init`, `Ready`, or `Suspended` — a task parked via
    /// [`Task::yield_to_suspended`] is handed back to a scheduler queue
    /// without anyone flipping its state first, so `resume()` itself sets
    /// `Running` on the way in. Panics on any other state (resuming a task
    /// that's already `Running` is a contract violation the scheduler must
    /// never commit).
    pub fn resume(self: &Arc<Self>) -> TaskState {
        {
            let mut state = self.state.lock();
            assert!(
                matches!(*state, TaskState::Init | TaskState::Ready | TaskState::Suspended),
                "resume() called while task is {:?}",
                *state
            );
            *state = TaskState::Running;
        }
        let finished = {
            let mut guard = self.generator.lock();
            let generator = guard.as_mut().expect("resume() called on a task with no generator installed");
            generator.resume(()).is_none()
        };
        if finished {
            // The stack is reclaimed: drop the generator (and its OsStack).
            *self.generator.lock() = None;
        }
        self.state()
    }

    /// Saves the current task's context and transfers to the worker's root;
    /// the task remains off the runnable queue until something else
    /// re-schedules it.
    pub fn yield_to_suspended() {
        context::set_current_state(TaskState::Suspended);
        context::suspend_current();
    }

    /// As [`Task::yield_to_suspended`], but marks the task `Ready` first.
    /// The scheduler driving this task inspects that state once `resume()`
    /// returns and re-enqueues it — `Task` itself has no knowledge of
    /// schedulers.
    pub fn yield_to_ready() {
        context::set_current_state(TaskState::Ready);
        context::suspend_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_task_runs_thunk_exactly_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let task = Task::create(move || ran2.store(true, Ordering::SeqCst), 64 * 1024, false);
        assert_eq!(task.state(), TaskState::Init);
        let state = task.resume();
        assert_eq!(state, TaskState::Terminated);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_task_suspends_and_resumes() {
        let task = Task::create(
            || {
                Task::yield_to_suspended();
            },
            64 * 1024,
            false,
        );
        let state = task.resume();
        assert_eq!(state, TaskState::Suspended);
        let state = task.resume();
        assert_eq!(state, TaskState::Terminated);
    }

    #[test]
    fn test_task_failed_on_panic() {
        let task = Task::create(
            || {
                panic!("boom");
            },
            64 * 1024,
            false,
        );
        let state = task.resume();
        assert_eq!(state, TaskState::Failed);
    }

    #[test]
    fn test_reset_reuses_stack_after_termination() {
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c1 = count.clone();
        let task = Task::create(move || { c1.fetch_add(1, Ordering::SeqCst); }, 64 * 1024, false);
        assert_eq!(task.resume(), TaskState::Terminated);
        let c2 = count.clone();
        task.reset(move || { c2.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(task.state(), TaskState::Init);
        assert_eq!(task.resume(), TaskState::Terminated);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
