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

//! The runtime substrate the rest of an IM platform is built on: a
//! cooperatively scheduled coroutine system fused with an edge-triggered
//! I/O demultiplexer, transparent syscall interception, a hierarchical
//! timer manager, a TCP connection framework, and a length-framed RPC
//! transport. Application-layer servlets/DAOs/DTOs are not this crate's
//! concern — only the substrate they run on top of.
//!
//! Dependency order (leaves first): [`task`], [`scheduler`], [`timer`],
//! [`reactor`] (composes scheduler + timer around epoll), [`io`]
//! (interception built on the reactor), [`net`] (sockets + [`net::TcpServer`]
//! built on `io`), [`rpc`] (length-framed transport built on `net`),
//! [`worker`] (named scheduler/reactor registry), [`sync`] (coroutine-aware
//! synchronization primitives used by `rpc`'s outbound queue).

pub mod config;
pub mod error;
pub mod io;
pub mod net;
pub mod reactor;
pub mod rpc;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod timer;
pub mod worker;

pub use error::{RuntimeError, RuntimeResult};
pub use reactor::Reactor;
pub use scheduler::Scheduler;
pub use task::Task;
pub use timer::TimerManager;
