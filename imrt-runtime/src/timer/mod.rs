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

//! Ordered set of deadlines, with wall-clock regression detection and a
//! hook a [`crate::reactor::Reactor`] uses to shorten its next epoll wait.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds until the earliest timer, or no timer pending at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextTimeout {
    Millis(u64),
    Infinite,
}

impl NextTimeout {
    pub fn clamp(self, cap_ms: u64) -> u64 {
        match self {
            NextTimeout::Millis(ms) => ms.min(cap_ms),
            NextTimeout::Infinite => cap_ms,
        }
    }
}

/// Callbacks are `Fn`, not `FnOnce`: a periodic timer's callback must run
/// again at its next deadline, so one-shot timers just happen to run their
/// `Fn` exactly once.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerEntry {
    id: u64,
    deadline_ms: AtomicU64,
    period_ms: AtomicU64,
    callback: TimerCallback,
    condition: Option<Weak<()>>,
    cancelled: AtomicBool,
}

/// A handle a caller can use to cancel or reschedule a timer it created.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
    manager: Weak<TimerManagerInner>,
}

impl TimerHandle {
    pub fn cancel(&self) { self.entry.cancelled.store(true, Ordering::SeqCst); }

    /// Replaces the pending fire with one at `delay_ms` from now, with a
    /// new period. Used to reset a running periodic timer mid-flight.
    pub fn reset(&self, delay_ms: u64, period_ms: u64) {
        self.entry.cancelled.store(true, Ordering::SeqCst);
        if let Some(manager) = self.manager.upgrade() {
            let deadline = now_ms().saturating_add(delay_ms);
            manager.insert_entry(Arc::new(TimerEntry {
                id: self.entry.id,
                deadline_ms: AtomicU64::new(deadline),
                period_ms: AtomicU64::new(period_ms),
                callback: self.entry.callback.clone(),
                condition: self.entry.condition.clone(),
                cancelled: AtomicBool::new(false),
            }));
        }
    }
}

struct HeapKey {
    deadline_ms: u64,
    seq: u64,
    entry: Arc<TimerEntry>,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool { self.deadline_ms == other.deadline_ms && self.seq == other.seq }
}
impl Eq for HeapKey {}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // highest (and thus pops first). Sequence number is the stable
        // tiebreaker for equal deadlines.
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> { Some(self.cmp(other)) }
}

struct TimerManagerInner {
    heap: Mutex<BinaryHeap<HeapKey>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    previous_now_ms: AtomicU64,
    on_inserted_at_front: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// `collect_expired` treats every outstanding timer as expired once the
/// wall clock has jumped backward by more than this many milliseconds
/// since the previous call, so long-scheduled events are never orphaned by
/// an NTP step or a suspended laptop's clock catching up.
const CLOCK_REGRESSION_THRESHOLD_MS: u64 = 60 * 60 * 1000;

impl TimerManagerInner {
    fn insert_entry(&self, entry: Arc<TimerEntry>) {
        let deadline_ms = entry.deadline_ms.load(Ordering::SeqCst);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let became_front = {
            let mut heap = self.heap.lock().unwrap();
            let was_front_deadline = heap.peek().map(|k| k.deadline_ms);
            heap.push(HeapKey { deadline_ms, seq, entry });
            was_front_deadline.is_none_or(|front| deadline_ms < front)
        };
        if became_front {
            if let Some(hook) = self.on_inserted_at_front.lock().unwrap().as_ref() {
                hook();
            }
        }
    }

    fn insert(
        &self,
        deadline_ms: u64,
        period_ms: u64,
        callback: TimerCallback,
        condition: Option<Weak<()>>,
    ) -> Arc<TimerEntry> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(TimerEntry {
            id,
            deadline_ms: AtomicU64::new(deadline_ms),
            period_ms: AtomicU64::new(period_ms),
            callback,
            condition,
            cancelled: AtomicBool::new(false),
        });
        self.insert_entry(entry.clone());
        entry
    }

    fn next_timeout_ms(&self) -> NextTimeout {
        // `BinaryHeap::iter()` is not sorted; only `peek`/`pop` respect the
        // heap order, so cancelled entries at the front are popped aside
        // and restored once a live one is found (or the heap is drained).
        let mut heap = self.heap.lock().unwrap();
        let now = now_ms();
        let mut skipped = Vec::new();
        let result = loop {
            match heap.pop() {
                None => break NextTimeout::Infinite,
                Some(key) if key.entry.cancelled.load(Ordering::SeqCst) => skipped.push(key),
                Some(key) => {
                    let deadline = key.entry.deadline_ms.load(Ordering::SeqCst);
                    let result = NextTimeout::Millis(deadline.saturating_sub(now));
                    skipped.push(key);
                    break result;
                }
            }
        };
        for key in skipped {
            heap.push(key);
        }
        result
    }

    fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = now_ms();
        let previous = self.previous_now_ms.swap(now, Ordering::SeqCst);
        let regressed = previous > 0 && now + CLOCK_REGRESSION_THRESHOLD_MS < previous;

        let mut expired_entries = Vec::new();
        {
            let mut heap = self.heap.lock().unwrap();
            while let Some(top) = heap.peek() {
                let expired = regressed || top.entry.deadline_ms.load(Ordering::SeqCst) <= now;
                if !expired {
                    break;
                }
                expired_entries.push(heap.pop().unwrap().entry);
            }
        }

        for entry in expired_entries {
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            let condition_alive = entry.condition.as_ref().is_none_or(|w| w.upgrade().is_some());
            if !condition_alive {
                continue;
            }
            let period = entry.period_ms.load(Ordering::SeqCst);
            if period > 0 {
                let next_deadline = now.saturating_add(period);
                entry.deadline_ms.store(next_deadline, Ordering::SeqCst);
                self.insert_entry(entry.clone());
            }
            out.push(entry.callback.clone());
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Ordered set of deadlines shared by a [`crate::reactor::Reactor`] and any
/// intercepted I/O call that needs a timeout.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<TimerManagerInner>,
}

impl Default for TimerManager {
    fn default() -> Self { Self::new() }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            inner: Arc::new(TimerManagerInner {
                heap: Mutex::new(BinaryHeap::new()),
                next_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
                previous_now_ms: AtomicU64::new(0),
                on_inserted_at_front: Mutex::new(None),
            }),
        }
    }

    /// Installs the callback invoked whenever an insertion becomes the new
    /// earliest deadline, outside of any internal lock. A Reactor uses this
    /// to wake its epoll wait early.
    pub fn set_on_inserted_at_front(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_inserted_at_front.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn add_timer(&self, delay_ms: u64, callback: impl Fn() + Send + Sync + 'static, periodic: bool) -> TimerHandle {
        let period = if periodic { delay_ms } else { 0 };
        let deadline = now_ms().saturating_add(delay_ms);
        let entry = self.inner.insert(deadline, period, Arc::new(callback), None);
        TimerHandle { entry, manager: Arc::downgrade(&self.inner) }
    }

    /// `callback` fires only if `condition.upgrade()` still succeeds at
    /// expiry; used to arm an I/O timeout without keeping its target alive.
    pub fn add_condition_timer(
        &self,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        condition: Weak<()>,
        periodic: bool,
    ) -> TimerHandle {
        let period = if periodic { delay_ms } else { 0 };
        let deadline = now_ms().saturating_add(delay_ms);
        let entry = self.inner.insert(deadline, period, Arc::new(callback), Some(condition));
        TimerHandle { entry, manager: Arc::downgrade(&self.inner) }
    }

    pub fn next_timeout_ms(&self) -> NextTimeout { self.inner.next_timeout_ms() }

    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) { self.inner.collect_expired(out); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_collect_expired_returns_nothing_early() {
        let manager = TimerManager::new();
        manager.add_timer(10_000, || {}, false);
        let mut out = Vec::new();
        manager.collect_expired(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_immediate_timer_fires() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        manager.add_timer(0, move || f.store(true, Ordering::SeqCst), false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        manager.collect_expired(&mut out);
        assert_eq!(out.len(), 1);
        (*out[0])();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let manager = TimerManager::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = manager.add_timer(0, move || { c.fetch_add(1, Ordering::SeqCst); }, false);
        handle.cancel();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        manager.collect_expired(&mut out);
        assert!(out.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_condition_timer_skipped_after_referent_dropped() {
        let manager = TimerManager::new();
        let strong = Arc::new(());
        let weak = Arc::downgrade(&strong);
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        manager.add_condition_timer(0, move || f.store(true, Ordering::SeqCst), weak, false);
        drop(strong);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        manager.collect_expired(&mut out);
        assert!(out.is_empty());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_insertion_at_front_hook_fires_once() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        manager.set_on_inserted_at_front(move || { h.fetch_add(1, Ordering::SeqCst); });
        manager.add_timer(10_000, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        manager.add_timer(20_000, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "later, non-minimal insert must not retrigger the hook");
        manager.add_timer(1, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_periodic_timer_reschedules_itself() {
        let manager = TimerManager::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        manager.add_timer(0, move || { c.fetch_add(1, Ordering::SeqCst); }, true);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        manager.collect_expired(&mut out);
        assert_eq!(out.len(), 1);
        (*out[0])();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Still armed for the next period rather than consumed.
        assert_ne!(manager.next_timeout_ms(), NextTimeout::Infinite);
    }
}
