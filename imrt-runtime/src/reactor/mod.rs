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

//! Edge-triggered readiness demultiplexer that supplies a [`Scheduler`]'s
//! idle behaviour: instead of spinning or condvar-waiting, idle workers run
//! one epoll cycle, fire expired timers, and resume whatever was waiting.

pub mod fd_registry;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{RuntimeError, RuntimeResult};
use crate::scheduler::{IdleHook, Scheduler};
use crate::task::current_task;
use crate::timer::TimerManager;

pub use fd_registry::{Direction, FdContext, FdRegistry};
use fd_registry::ResumeTarget;

const IDLE_POLL_CAP_MS: u64 = 3_000;
const MAX_EPOLL_EVENTS: usize = 256;

/// Global scheduler → reactor association so [`Reactor::current`] can be
/// recovered from inside a running task, which only otherwise knows its
/// [`Scheduler`]. Mirrors the named worker registry's process-wide
/// name→scheduler table.
static REACTORS_BY_SCHEDULER: Mutex<Vec<(Weak<Scheduler>, Weak<Reactor>)>> = Mutex::new(Vec::new());

pub struct Reactor {
    scheduler: Arc<Scheduler>,
    timers: TimerManager,
    registry: FdRegistry,
    epoll_fd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    pending_events: AtomicI64,
}

impl Reactor {
    pub fn new(scheduler: Arc<Scheduler>) -> RuntimeResult<Arc<Reactor>> {
        let epoll_fd = check_fd(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let mut pipe_fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret < 0 {
            unsafe { libc::close(epoll_fd) };
            return Err(RuntimeError::Syscall(std::io::Error::last_os_error()));
        }
        let (wake_read, wake_write) = (pipe_fds[0], pipe_fds[1]);

        let mut event = libc::epoll_event { events: libc::EPOLLIN as u32, u64: wake_read as u64 };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_read, &mut event) };
        if ret < 0 {
            unsafe {
                libc::close(wake_read);
                libc::close(wake_write);
                libc::close(epoll_fd);
            }
            return Err(RuntimeError::Syscall(std::io::Error::last_os_error()));
        }

        let reactor = Arc::new(Reactor {
            scheduler: scheduler.clone(),
            timers: TimerManager::new(),
            registry: FdRegistry::new(),
            epoll_fd,
            wake_read,
            wake_write,
            pending_events: AtomicI64::new(0),
        });

        let tickle_target = reactor.clone();
        reactor.timers.set_on_inserted_at_front(move || tickle_target.tickle());

        scheduler.set_idle_hook(reactor.clone() as Arc<dyn IdleHook>);

        REACTORS_BY_SCHEDULER
            .lock()
            .unwrap()
            .push((Arc::downgrade(&scheduler), Arc::downgrade(&reactor)));

        Ok(reactor)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> { &self.scheduler }

    pub fn timers(&self) -> &TimerManager { &self.timers }

    pub fn fd_registry(&self) -> &FdRegistry { &self.registry }

    /// The reactor driving the scheduler that is currently running a task
    /// on this thread, if one was composed over it.
    pub fn current() -> Option<Arc<Reactor>> {
        let scheduler = Scheduler::current()?;
        let table = REACTORS_BY_SCHEDULER.lock().unwrap();
        table
            .iter()
            .find(|(s, _)| s.upgrade().is_some_and(|s| Arc::ptr_eq(&s, &scheduler)))
            .and_then(|(_, r)| r.upgrade())
    }

    /// Arms `dir` on `fd`: resumes the current task (or runs `thunk`, if
    /// given) the next time that direction becomes ready. Errors if the
    /// direction is already armed, or if no current task exists and no
    /// thunk was supplied.
    pub fn arm_event(
        &self,
        fd: RawFd,
        dir: Direction,
        thunk: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> RuntimeResult<()> {
        let ctx = self
            .registry
            .get(fd, true)
            .ok_or_else(|| RuntimeError::ContractViolation(format!("fd {fd} has no context")))?;
        let target = match thunk {
            Some(thunk) => ResumeTarget::Thunk(Mutex::new(Some(thunk)), self.scheduler.clone()),
            None => {
                let task = current_task()
                    .ok_or_else(|| RuntimeError::ContractViolation("arm_event called outside of a task".into()))?;
                ResumeTarget::Task(task, self.scheduler.clone(), Scheduler::current_worker_id())
            }
        };
        if !ctx.arm(dir, target) {
            return Err(RuntimeError::ContractViolation(format!(
                "direction {dir:?} already armed for fd {fd}"
            )));
        }
        self.pending_events.fetch_add(1, Ordering::SeqCst);
        self.sync_kernel_registration(fd, &ctx)
    }

    /// Removes `dir`'s slot without firing it.
    pub fn disarm_event(&self, fd: RawFd, dir: Direction) {
        if let Some(ctx) = self.registry.get(fd, false) {
            if ctx.disarm(dir).is_some() {
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            let _ = self.sync_kernel_registration(fd, &ctx);
        }
    }

    /// As [`Reactor::disarm_event`], but also fires the slot's target as if
    /// its event had arrived — the mechanism behind I/O timeouts.
    pub fn cancel_event(&self, fd: RawFd, dir: Direction) {
        if let Some(ctx) = self.registry.get(fd, false) {
            if let Some(target) = ctx.disarm(dir) {
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
                let _ = self.sync_kernel_registration(fd, &ctx);
                target.fire();
            }
        }
    }

    /// Disarms both directions from the kernel in one call, firing whatever
    /// was armed. After this call the `FdContext` has no armed directions.
    pub fn cancel_all(&self, fd: RawFd) {
        let Some(ctx) = self.registry.get(fd, false) else { return };
        let mut fired = Vec::new();
        for dir in [Direction::Read, Direction::Write] {
            if let Some(target) = ctx.disarm(dir) {
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
                fired.push(target);
            }
        }
        let _ = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        for target in fired {
            target.fire();
        }
    }

    fn sync_kernel_registration(&self, fd: RawFd, ctx: &FdContext) -> RuntimeResult<()> {
        let mask = ctx.armed_mask();
        let op = if mask == 0 { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        let mut event = libc::epoll_event { events: mask | libc::EPOLLET as u32, u64: fd as u64 };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // ADD vs MOD: a fresh fd has never been registered with epoll.
            if op == libc::EPOLL_CTL_MOD && err.raw_os_error() == Some(libc::ENOENT) {
                let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
                if ret == 0 {
                    return Ok(());
                }
            }
            if op == libc::EPOLL_CTL_DEL && matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                return Ok(());
            }
            return Err(RuntimeError::Syscall(err));
        }
        Ok(())
    }

    fn tickle(&self) {
        let byte: u8 = 1;
        unsafe {
            libc::write(self.wake_write, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.wake_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    fn epoll_wait_once(&self, timeout_ms: u64) -> Vec<(RawFd, u32)> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EPOLL_EVENTS];
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EPOLL_EVENTS as i32, timeout) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                tracing::warn!(error = %err, "epoll_wait failed");
            }
            return Vec::new();
        }
        (0..n as usize).map(|i| (events[i].u64 as RawFd, events[i].events)).collect()
    }
}

impl IdleHook for Reactor {
    fn on_idle(&self, scheduler: &Scheduler) -> bool {
        let timeout_ms = self.timers.next_timeout_ms().clamp(IDLE_POLL_CAP_MS);
        let ready = self.epoll_wait_once(timeout_ms);

        let mut expired = Vec::new();
        self.timers.collect_expired(&mut expired);
        for callback in expired.iter().cloned() {
            scheduler.schedule_thunk(move || (*callback)(), None);
        }
        let mut progress = !expired.is_empty();

        for (fd, events) in ready {
            if fd == self.wake_read {
                self.drain_wake_pipe();
                continue;
            }
            let Some(ctx) = self.registry.get(fd, false) else { continue };
            let mut fired_mask = 0u32;
            if events & libc::EPOLLIN as u32 != 0 {
                fired_mask |= Direction::Read.epoll_bit();
            }
            if events & libc::EPOLLOUT as u32 != 0 {
                fired_mask |= Direction::Write.epoll_bit();
            }
            if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                // Promote to the union of armed directions so an error can
                // never strand a waiter on the direction that didn't
                // nominally fire.
                fired_mask |= ctx.armed_mask();
            }
            for dir in [Direction::Read, Direction::Write] {
                if fired_mask & dir.epoll_bit() == 0 {
                    continue;
                }
                if let Some(target) = ctx.disarm(dir) {
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                    progress = true;
                    target.fire();
                }
            }
            let _ = self.sync_kernel_registration(fd, &ctx);
        }

        progress
    }

    fn tickle(&self) { Reactor::tickle(self); }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
            libc::close(self.epoll_fd);
        }
    }
}

fn check_fd(fd: RawFd) -> RuntimeResult<RawFd> {
    if fd < 0 {
        Err(RuntimeError::Syscall(std::io::Error::last_os_error()))
    } else {
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_arm_event_fires_on_pipe_write() {
        let scheduler = Scheduler::new("reactor-test", 1);
        let reactor = Reactor::new(scheduler.clone()).unwrap();
        scheduler.start();

        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        reactor
            .arm_event(read_fd, Direction::Read, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
            .unwrap();

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

        std::thread::sleep(Duration::from_millis(200));
        scheduler.stop();
        assert!(fired.load(Ordering::SeqCst));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn test_cancel_event_fires_without_readiness() {
        let scheduler = Scheduler::new("reactor-cancel-test", 1);
        let reactor = Reactor::new(scheduler.clone()).unwrap();
        scheduler.start();

        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        reactor
            .arm_event(read_fd, Direction::Read, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
            .unwrap();
        reactor.cancel_event(read_fd, Direction::Read);

        std::thread::sleep(Duration::from_millis(50));
        scheduler.stop();
        assert!(fired.load(Ordering::SeqCst));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn test_double_arm_same_direction_is_rejected() {
        let scheduler = Scheduler::new("reactor-double-arm", 1);
        let reactor = Reactor::new(scheduler.clone()).unwrap();

        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        reactor.arm_event(read_fd, Direction::Read, Some(Box::new(|| {}))).unwrap();
        let second = reactor.arm_event(read_fd, Direction::Read, Some(Box::new(|| {})));
        assert!(second.is_err());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
