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

//! Thin newtypes over [`std::sync`] primitives that panic loudly on a
//! poisoned lock instead of silently unwrapping it inline at every call
//! site. The runtime never holds these across a suspension point (see
//! spec §5); a poisoned lock therefore always means a worker thread
//! panicked while holding it, which is itself a contract violation worth
//! surfacing immediately.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A `Mutex` that resolves poisoning by recovering the inner guard — a
/// panic elsewhere shouldn't wedge every other lock user, but callers can
/// still observe it via `tracing`.
#[derive(Debug, Default)]
pub struct Spinlock<T>(Mutex<T>);

impl<T> Spinlock<T> {
    pub fn new(value: T) -> Self { Spinlock(Mutex::new(value)) }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("recovering poisoned lock");
                poisoned.into_inner()
            }
        }
    }
}

/// As [`Spinlock`] but for readers/writers that don't need exclusive
/// access on the hot path (e.g. the FdRegistry's sparse table).
#[derive(Debug, Default)]
pub struct RwSpinlock<T>(RwLock<T>);

impl<T> RwSpinlock<T> {
    pub fn new(value: T) -> Self { RwSpinlock(RwLock::new(value)) }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        match self.0.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spinlock_basic() {
        let lock = Spinlock::new(0);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_rwspinlock_basic() {
        let lock = RwSpinlock::new(vec![1, 2, 3]);
        assert_eq!(lock.read().len(), 3);
        lock.write().push(4);
        assert_eq!(lock.read().len(), 4);
    }
}
