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

//! Dynamically grown, sparse fd → [`FdContext`] table.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, RwLock};

use crate::scheduler::{Scheduler, WorkerId};
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub(crate) fn epoll_bit(self) -> u32 {
        match self {
            Direction::Read => libc::EPOLLIN as u32,
            Direction::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// What gets resumed when a slot's direction fires.
pub(crate) enum ResumeTarget {
    Task(Arc<Task>, Arc<Scheduler>, Option<WorkerId>),
    Thunk(Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>, Arc<Scheduler>),
}

impl ResumeTarget {
    pub(crate) fn fire(&self) {
        match self {
            ResumeTarget::Task(task, scheduler, pinned) => scheduler.schedule(task.clone(), *pinned),
            ResumeTarget::Thunk(slot, scheduler) => {
                if let Some(thunk) = slot.lock().unwrap().take() {
                    scheduler.schedule_thunk(thunk, None);
                }
            }
        }
    }
}

#[derive(Default)]
struct Slot {
    target: Option<ResumeTarget>,
}

pub struct FdContext {
    pub fd: RawFd,
    pub is_socket: bool,
    pub user_nonblock: std::sync::atomic::AtomicBool,
    pub system_nonblock: std::sync::atomic::AtomicBool,
    pub closed: std::sync::atomic::AtomicBool,
    pub send_timeout_ms: std::sync::atomic::AtomicU64,
    pub recv_timeout_ms: std::sync::atomic::AtomicU64,
    slots: Mutex<(Option<Slot>, Option<Slot>)>, // (Read, Write)
    /// Used as the weak-upgradeable condition for this fd's timeout timers;
    /// dropping the FdContext cancels any outstanding one transparently.
    pub(crate) alive: Arc<()>,
}

pub const TIMEOUT_INFINITE: u64 = u64::MAX;

impl FdContext {
    fn new(fd: RawFd, is_socket: bool) -> FdContext {
        FdContext {
            fd,
            is_socket,
            user_nonblock: std::sync::atomic::AtomicBool::new(false),
            system_nonblock: std::sync::atomic::AtomicBool::new(is_socket),
            closed: std::sync::atomic::AtomicBool::new(false),
            send_timeout_ms: std::sync::atomic::AtomicU64::new(TIMEOUT_INFINITE),
            recv_timeout_ms: std::sync::atomic::AtomicU64::new(TIMEOUT_INFINITE),
            slots: Mutex::new((None, None)),
            alive: Arc::new(()),
        }
    }

    pub(crate) fn condition(&self) -> std::sync::Weak<()> { Arc::downgrade(&self.alive) }

    fn slot_mut<'a>(guard: &'a mut (Option<Slot>, Option<Slot>), dir: Direction) -> &'a mut Option<Slot> {
        match dir {
            Direction::Read => &mut guard.0,
            Direction::Write => &mut guard.1,
        }
    }

    /// Occupies `dir`'s slot with `target`. Returns `false` (a contract
    /// violation — the caller must not have two waiters on one direction)
    /// if the slot is already occupied.
    pub(crate) fn arm(&self, dir: Direction, target: ResumeTarget) -> bool {
        let mut guard = self.slots.lock().unwrap();
        let slot = Self::slot_mut(&mut guard, dir);
        if slot.as_ref().is_some_and(|s| s.target.is_some()) {
            return false;
        }
        *slot = Some(Slot { target: Some(target) });
        true
    }

    /// Removes `dir`'s slot without firing it.
    pub(crate) fn disarm(&self, dir: Direction) -> Option<ResumeTarget> {
        let mut guard = self.slots.lock().unwrap();
        Self::slot_mut(&mut guard, dir).take().and_then(|s| s.target)
    }

    /// Bitmask of directions currently armed.
    pub(crate) fn armed_mask(&self) -> u32 {
        let guard = self.slots.lock().unwrap();
        let mut mask = 0;
        if guard.0.is_some() {
            mask |= Direction::Read.epoll_bit();
        }
        if guard.1.is_some() {
            mask |= Direction::Write.epoll_bit();
        }
        mask
    }

    pub(crate) fn has_any_armed(&self) -> bool {
        let guard = self.slots.lock().unwrap();
        guard.0.is_some() || guard.1.is_some()
    }
}

/// Sparse, dynamically grown fd → [`FdContext`] table guarded by a
/// read-write lock; lookups vastly outnumber insertions.
pub struct FdRegistry {
    table: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl Default for FdRegistry {
    fn default() -> Self { Self::new() }
}

impl FdRegistry {
    pub fn new() -> FdRegistry { FdRegistry { table: RwLock::new(Vec::new()) } }

    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let table = self.table.read().unwrap();
            if let Some(Some(ctx)) = table.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }
        let mut table = self.table.write().unwrap();
        if table.len() <= idx {
            table.resize_with(idx + 1, || None);
        }
        if table[idx].is_none() {
            let is_socket = is_socket_fd(fd);
            table[idx] = Some(Arc::new(FdContext::new(fd, is_socket)));
        }
        table[idx].clone()
    }

    pub fn remove(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        let mut table = self.table.write().unwrap();
        table.get_mut(idx).and_then(|slot| slot.take())
    }
}

fn is_socket_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd, &mut stat) };
    ret == 0 && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_create_grows_table() {
        let registry = FdRegistry::new();
        assert!(registry.get(5, false).is_none());
        let ctx = registry.get(5, true).unwrap();
        assert_eq!(ctx.fd, 5);
        assert!(registry.get(5, false).is_some());
    }

    #[test]
    fn test_remove_clears_slot() {
        let registry = FdRegistry::new();
        registry.get(3, true).unwrap();
        assert!(registry.remove(3).is_some());
        assert!(registry.get(3, false).is_none());
    }

    #[test]
    fn test_arm_rejects_double_occupancy() {
        let ctx = FdContext::new(9, true);
        assert!(ctx.arm(Direction::Read, ResumeTarget::Thunk(Mutex::new(Some(Box::new(|| {}))), Scheduler::new("t", 1))));
        assert!(!ctx.arm(Direction::Read, ResumeTarget::Thunk(Mutex::new(Some(Box::new(|| {}))), Scheduler::new("t", 1))));
        assert!(ctx.arm(Direction::Write, ResumeTarget::Thunk(Mutex::new(Some(Box::new(|| {}))), Scheduler::new("t", 1))));
    }
}
