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

//! Transparent syscall interception: every wrapper here has the signature
//! of the libc call it shadows, and is semantically identical to it for an
//! fd with no registered context, for interception disabled on this
//! thread, or for a user-requested nonblocking fd. Otherwise, a would-block
//! result parks the current task instead of returning to the caller.

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::reactor::{fd_registry::TIMEOUT_INFINITE, Direction, Reactor};
use crate::task::{current_task, Task};

thread_local! {
    static INTERCEPTION_DISABLED: Cell<bool> = const { Cell::new(false) };
}

/// Disables interception for the duration of `f` on this thread. Used by
/// code paths that must always see true blocking/nonblocking semantics
/// (e.g. a worker draining at shutdown with no reactor to suspend into).
pub fn without_interception<R>(f: impl FnOnce() -> R) -> R {
    let previous = INTERCEPTION_DISABLED.with(|c| c.replace(true));
    let result = f();
    INTERCEPTION_DISABLED.with(|c| c.set(previous));
    result
}

fn is_wouldblock(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK))
}

fn should_bypass(reactor: Option<&Arc<Reactor>>, fd: RawFd) -> bool {
    if INTERCEPTION_DISABLED.with(|c| c.get()) {
        return true;
    }
    let Some(reactor) = reactor else { return true };
    let Some(ctx) = reactor.fd_registry().get(fd, false) else { return true };
    !ctx.is_socket || ctx.user_nonblock.load(Ordering::SeqCst)
}

/// Runs `syscall` in a loop, retrying on `EINTR` and suspending the current
/// task on `EAGAIN`/`EWOULDBLOCK` until `dir` is armed or `timeout_ms`
/// elapses. `syscall` must return a raw libc return value (`-1` on error,
/// with `errno` set).
fn intercept(fd: RawFd, dir: Direction, timeout_ms: Option<u64>, mut syscall: impl FnMut() -> isize) -> io::Result<isize> {
    let reactor = Reactor::current();
    if should_bypass(reactor.as_ref(), fd) {
        return raw_result(syscall());
    }
    let reactor = reactor.expect("should_bypass returned false without a current reactor");
    let ctx = reactor
        .fd_registry()
        .get(fd, true)
        .expect("fd_registry auto-creates a context when asked");

    loop {
        match raw_result(syscall()) {
            Ok(n) => return Ok(n),
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) if !is_wouldblock(&err) => return Err(err),
            Err(_) => {}
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let timer = timeout_ms.filter(|ms| *ms != TIMEOUT_INFINITE).map(|ms| {
            let reactor = reactor.clone();
            let cancelled = cancelled.clone();
            reactor.timers().add_condition_timer(
                ms,
                move || {
                    cancelled.store(true, Ordering::SeqCst);
                    reactor.cancel_event(fd, dir);
                },
                ctx.condition(),
                false,
            )
        });

        reactor
            .arm_event(fd, dir, None)
            .map_err(|e| io::Error::from_raw_os_error(e.as_errno()))?;
        Task::yield_to_suspended();
        if let Some(timer) = &timer {
            timer.cancel();
        }
        if cancelled.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
        // The slot fired: an event arrived (or we were spuriously cancelled
        // by `cancel_event`/`cancel_all`). Either way, retry the syscall.
    }
}

fn raw_result(n: isize) -> io::Result<isize> {
    if n == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n)
    }
}

macro_rules! cvt_usize {
    ($result:expr) => {
        $result.map(|n| n as usize)
    };
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Read, recv_timeout(fd), || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) as isize
    }))
}

pub fn readv(fd: RawFd, iov: &mut [libc::iovec]) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Read, recv_timeout(fd), || unsafe {
        libc::readv(fd, iov.as_ptr(), iov.len() as i32) as isize
    }))
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Read, recv_timeout(fd), || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) as isize
    }))
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: i32, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Read, recv_timeout(fd), || unsafe {
        libc::recvfrom(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags, addr, addrlen) as isize
    }))
}

pub fn recvmsg(fd: RawFd, msg: &mut libc::msghdr, flags: i32) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Read, recv_timeout(fd), || unsafe { libc::recvmsg(fd, msg, flags) as isize }))
}

pub fn accept(fd: RawFd, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> io::Result<RawFd> {
    let n = intercept(fd, Direction::Read, recv_timeout(fd), || unsafe { libc::accept(fd, addr, addrlen) as isize })?;
    let accepted = n as RawFd;
    if let Some(reactor) = Reactor::current() {
        reactor.fd_registry().get(accepted, true);
    }
    Ok(accepted)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Write, send_timeout(fd), || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) as isize
    }))
}

pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Write, send_timeout(fd), || unsafe {
        libc::writev(fd, iov.as_ptr(), iov.len() as i32) as isize
    }))
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Write, send_timeout(fd), || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) as isize
    }))
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: i32, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Write, send_timeout(fd), || unsafe {
        libc::sendto(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags, addr, addrlen) as isize
    }))
}

pub fn sendmsg(fd: RawFd, msg: &libc::msghdr, flags: i32) -> io::Result<usize> {
    cvt_usize!(intercept(fd, Direction::Write, send_timeout(fd), || unsafe { libc::sendmsg(fd, msg, flags) as isize }))
}

/// `connect`: after the first call returns `EINPROGRESS`, arms Write with a
/// condition timer for `send_timeout(fd)` (the deadline `Socket::connect`
/// stores before calling down here), suspends, then reads `SO_ERROR` to
/// learn the real outcome — exactly the timeout-arming template `intercept`
/// uses, since an unroutable peer otherwise never makes Write ready on its
/// own.
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> io::Result<()> {
    let reactor = Reactor::current();
    if should_bypass(reactor.as_ref(), fd) {
        return raw_result(unsafe { libc::connect(fd, addr, addrlen) as isize }).map(|_| ());
    }
    let reactor = reactor.unwrap();
    let first = unsafe { libc::connect(fd, addr, addrlen) };
    if first == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let ctx = reactor
        .fd_registry()
        .get(fd, true)
        .expect("fd_registry auto-creates a context when asked");

    let cancelled = Arc::new(AtomicBool::new(false));
    let timer = send_timeout(fd).filter(|ms| *ms != TIMEOUT_INFINITE).map(|ms| {
        let reactor = reactor.clone();
        let cancelled = cancelled.clone();
        reactor.timers().add_condition_timer(
            ms,
            move || {
                cancelled.store(true, Ordering::SeqCst);
                reactor.cancel_event(fd, Direction::Write);
            },
            ctx.condition(),
            false,
        )
    });

    reactor
        .arm_event(fd, Direction::Write, None)
        .map_err(|e| io::Error::from_raw_os_error(e.as_errno()))?;
    Task::yield_to_suspended();
    if let Some(timer) = &timer {
        timer.cancel();
    }
    if cancelled.load(Ordering::SeqCst) {
        return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }

    let mut so_error: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error));
    }
    Ok(())
}

/// Converts the duration to milliseconds, arms a one-shot timer that
/// re-schedules the current task, and yields. Always returns `0`, matching
/// the libc wrappers it shadows.
fn sleep_ms(ms: u64) {
    match (Reactor::current(), current_task()) {
        (Some(reactor), Some(task)) => {
            let scheduler = reactor.scheduler().clone();
            reactor.timers().add_timer(ms, move || scheduler.schedule(task.clone(), None), false);
            Task::yield_to_suspended();
        }
        _ => std::thread::sleep(std::time::Duration::from_millis(ms)),
    }
}

pub fn sleep(seconds: u32) -> u32 {
    sleep_ms(seconds as u64 * 1000);
    0
}

pub fn usleep(micros: u64) -> i32 {
    sleep_ms(micros / 1000);
    0
}

pub fn nanosleep(duration: std::time::Duration) -> i32 {
    sleep_ms(duration.as_millis() as u64);
    0
}

/// Registers a freshly created fd in the [`crate::reactor::FdRegistry`] of
/// the current reactor, if any.
pub fn socket(domain: i32, kind: i32, protocol: i32) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, kind, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(reactor) = Reactor::current() {
        reactor.fd_registry().get(fd, true);
    }
    Ok(fd)
}

/// Cancels all armed directions, forgets the fd, then closes it.
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(reactor) = Reactor::current() {
        reactor.cancel_all(fd);
        reactor.fd_registry().remove(fd);
    }
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// `F_SETFL`: records the user's `O_NONBLOCK` request, then ORs in the
/// system's own nonblocking bit before delegating. `F_GETFL`: delegates,
/// then masks the reported flag to reflect the user's wish rather than the
/// kernel's.
pub fn fcntl_setfl(fd: RawFd, flags: i32) -> io::Result<i32> {
    let user_nonblock = flags & libc::O_NONBLOCK != 0;
    let mut effective = flags;
    if let Some(reactor) = Reactor::current() {
        if let Some(ctx) = reactor.fd_registry().get(fd, false) {
            ctx.user_nonblock.store(user_nonblock, Ordering::SeqCst);
            effective |= libc::O_NONBLOCK;
        }
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, effective) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub fn fcntl_getfl(fd: RawFd) -> io::Result<i32> {
    let ret = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    if let Some(reactor) = Reactor::current() {
        if let Some(ctx) = reactor.fd_registry().get(fd, false) {
            if !ctx.user_nonblock.load(Ordering::SeqCst) {
                return Ok(ret & !libc::O_NONBLOCK);
            }
        }
    }
    Ok(ret)
}

/// `SO_SNDTIMEO`/`SO_RCVTIMEO`: updates the `FdContext`'s timeouts in
/// addition to delegating to the real `setsockopt`.
pub fn setsockopt_timeout(fd: RawFd, which: i32, timeout_ms: u64) -> io::Result<()> {
    if let Some(reactor) = Reactor::current() {
        if let Some(ctx) = reactor.fd_registry().get(fd, false) {
            match which {
                libc::SO_SNDTIMEO => ctx.send_timeout_ms.store(timeout_ms, Ordering::SeqCst),
                libc::SO_RCVTIMEO => ctx.recv_timeout_ms.store(timeout_ms, Ordering::SeqCst),
                _ => {}
            }
        }
    }
    let tv = libc::timeval { tv_sec: (timeout_ms / 1000) as libc::time_t, tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            which,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn recv_timeout(fd: RawFd) -> Option<u64> {
    Reactor::current().and_then(|r| r.fd_registry().get(fd, false)).map(|ctx| ctx.recv_timeout_ms.load(Ordering::SeqCst))
}

fn send_timeout(fd: RawFd) -> Option<u64> {
    Reactor::current().and_then(|r| r.fd_registry().get(fd, false)).map(|ctx| ctx.send_timeout_ms.load(Ordering::SeqCst))
}
