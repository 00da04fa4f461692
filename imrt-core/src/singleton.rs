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

//! A `OnceLock`-backed singleton helper. `static` + `OnceLock::new()` is a
//! `const` expression, so the singleton itself can live in a `static`
//! declaration; the wrapped value is created lazily on first access.
//!
//! This is the same shape the worker registry (`imrt_runtime::worker`) uses
//! to hand out named `Scheduler`/`Reactor` pairs without requiring callers
//! to thread a context object through every function signature.

use std::sync::OnceLock;

pub struct Singleton<T> {
    cell: OnceLock<T>,
}

impl<T> Singleton<T> {
    pub const fn new() -> Self { Singleton { cell: OnceLock::new() } }

    /// Returns the existing value, or initializes it with `init` the first
    /// time any thread calls this. `init` may run more than once under
    /// contention; only one result is kept.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T { self.cell.get_or_init(init) }

    pub fn get(&self) -> Option<&T> { self.cell.get() }
}

impl<T> Default for Singleton<T> {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_initializes_once() {
        static CALLS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let singleton: Singleton<u32> = Singleton::new();
        let value = *singleton.get_or_init(|| {
            CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            42
        });
        let value_again = *singleton.get_or_init(|| {
            CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            99
        });
        assert_eq!(value, 42);
        assert_eq!(value_again, 42);
        assert_eq!(CALLS.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
