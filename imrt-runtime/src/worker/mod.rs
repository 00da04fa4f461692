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

//! Process-wide, configuration-driven registry of named worker pools. A
//! `TcpServerConfig`'s `accept_worker`/`io_worker`/`process_worker` fields,
//! and an RPC stream's hosting worker, are all names resolved through this
//! registry rather than threading `Arc<Reactor>` handles through every
//! signature in the application layer above this crate.

use std::collections::HashMap;
use std::sync::Arc;

use imrt_core::Singleton;

use crate::config::{Config, WorkerConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::reactor::Reactor;
use crate::scheduler::Scheduler;
use crate::task::Task;

/// One named pool: a plain `Scheduler` if the entry asked for no I/O
/// multiplexing, or a `Reactor` (which owns and drives its own `Scheduler`)
/// if it did. Nearly every real worker is a `Reactor` — `iomanager` pools
/// are the norm in the source this is grounded on — but the registry keeps
/// both shapes so a pure CPU-bound pool doesn't pay for an epoll fd and
/// wake-up pipe it never uses.
pub enum WorkerPool {
    Plain(Arc<Scheduler>),
    Reactor(Arc<Reactor>),
}

impl WorkerPool {
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        match self {
            WorkerPool::Plain(s) => s,
            WorkerPool::Reactor(r) => r.scheduler(),
        }
    }

    pub fn as_reactor(&self) -> Option<&Arc<Reactor>> {
        match self {
            WorkerPool::Plain(_) => None,
            WorkerPool::Reactor(r) => Some(r),
        }
    }

    pub fn start(&self) { self.scheduler().start(); }

    pub fn stop(&self) { self.scheduler().stop(); }
}

/// `name -> WorkerPool` lookup table. Populated once at startup from
/// `Config.workers`; insertion after that point is still possible (e.g. a
/// test registering an ad-hoc pool) but is not the intended steady-state
/// usage — lookups vastly outnumber inserts, same rationale as
/// [`crate::reactor::FdRegistry`].
#[derive(Default)]
pub struct WorkerRegistry {
    pools: std::sync::RwLock<HashMap<String, Arc<WorkerPool>>>,
}

impl WorkerRegistry {
    pub fn new() -> WorkerRegistry { WorkerRegistry::default() }

    /// Builds every pool named in `config.workers`, each running as a
    /// `Reactor` (the registry doesn't know in advance whether a pool will
    /// need I/O, so it always gives one the capability). `use_caller` is
    /// accepted for configuration-schema fidelity (see spec §6) but is a
    /// hybrid-mode optimization this registry doesn't implement — every
    /// pool here runs on its own worker threads; see DESIGN.md for the
    /// Open Question resolution.
    pub fn init(config: &Config) -> RuntimeResult<WorkerRegistry> {
        let registry = WorkerRegistry::new();
        for (name, worker_config) in &config.workers {
            registry.add(name, worker_config)?;
        }
        Ok(registry)
    }

    pub fn add(&self, name: &str, worker_config: &WorkerConfig) -> RuntimeResult<()> {
        let scheduler = Scheduler::new(name, worker_config.thread_count.max(1));
        let reactor = Reactor::new(scheduler)?;
        self.pools.write().unwrap().insert(name.to_string(), Arc::new(WorkerPool::Reactor(reactor)));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkerPool>> { self.pools.read().unwrap().get(name).cloned() }

    pub fn start_all(&self) {
        for pool in self.pools.read().unwrap().values() {
            pool.start();
        }
    }

    pub fn stop_all(&self) {
        for pool in self.pools.read().unwrap().values() {
            pool.stop();
        }
    }

    /// Schedules `task` on the named pool. Logs an error (rather than
    /// panicking) if the name is unknown, matching `WorkerManager::schedule`
    /// in the source this is grounded on.
    pub fn schedule(&self, name: &str, task: Arc<Task>) {
        match self.get(name) {
            Some(pool) => pool.scheduler().schedule(task, None),
            None => tracing::error!(worker = name, "schedule: worker pool not found"),
        }
    }

    pub fn schedule_thunk(&self, name: &str, thunk: impl FnOnce() + Send + 'static) {
        match self.get(name) {
            Some(pool) => pool.scheduler().schedule_thunk(thunk, None),
            None => tracing::error!(worker = name, "schedule_thunk: worker pool not found"),
        }
    }

    pub fn count(&self) -> usize { self.pools.read().unwrap().len() }

    /// Resolves a `TcpServerConfig` worker-name field, falling back to
    /// `default_name` (the convention used when a config omits the field:
    /// reuse whichever worker was actually passed to the server).
    pub fn resolve<'a>(&self, name: Option<&'a str>, default_name: &'a str) -> RuntimeResult<Arc<WorkerPool>> {
        let resolved = name.unwrap_or(default_name);
        self.get(resolved)
            .ok_or_else(|| RuntimeError::ContractViolation(format!("worker pool {resolved:?} not configured")))
    }
}

static GLOBAL: Singleton<WorkerRegistry> = Singleton::new();

impl WorkerRegistry {
    /// Process-wide registry, lazily built from `config` on first access —
    /// the Rust analogue of `WorkerMgr::GetInstance()` in the source this is
    /// grounded on. Every call after the first ignores `config` and returns
    /// the already-initialized registry; build distinct `WorkerRegistry`
    /// instances directly (via [`WorkerRegistry::init`]) when that matters,
    /// e.g. in tests that don't want to share state across test functions.
    pub fn global(config: &Config) -> &'static WorkerRegistry {
        GLOBAL.get_or_init(|| WorkerRegistry::init(config).unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to build the global worker registry from config, starting empty");
            WorkerRegistry::new()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_init_builds_named_pools_from_config() {
        let yaml = r#"
workers:
  io:
    thread_count: 2
  accept:
    thread_count: 1
"#;
        let config = Config::load_from_str(yaml).unwrap();
        let registry = WorkerRegistry::init(&config).unwrap();
        assert_eq!(registry.count(), 2);
        assert!(registry.get("io").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_schedule_runs_on_named_pool() {
        let yaml = "workers:\n  w:\n    thread_count: 1\n";
        let config = Config::load_from_str(yaml).unwrap();
        let registry = WorkerRegistry::init(&config).unwrap();
        registry.start_all();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        registry.schedule_thunk("w", move || { c.fetch_add(1, Ordering::SeqCst); });
        std::thread::sleep(Duration::from_millis(100));
        registry.stop_all();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_on_unknown_worker_does_not_panic() {
        let registry = WorkerRegistry::new();
        registry.schedule_thunk("ghost", || {});
    }
}
