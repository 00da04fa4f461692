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

//! A length-framed, correlation-tagged, bidirectional RPC stream over a
//! [`Socket`]. A client stream ([`RpcStream::new`]) owns its own reconnect
//! loop; a server-accepted stream ([`RpcStream::accept`]) wraps a socket
//! that's already connected and ends for good once that socket dies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_queue::ArrayQueue;

use crate::error::{RuntimeError, RuntimeResult};
use crate::io;
use crate::net::socket::{BindSpec, Socket};
use crate::reactor::Reactor;
use crate::rpc::message::{RpcMessage, SequenceId, MAX_BODY_DEFAULT};
use crate::scheduler::Scheduler;
use crate::sync::CoroutineSemaphore;
use crate::task::{current_task, Task};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

/// Produces the response a reader task sends back for an inbound Request.
/// Runs on the reader task, so a slow handler delays only that stream's own
/// request processing — not the worker.
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, command: u32, body: Vec<u8>) -> (u32, String, Vec<u8>);
}

impl<F: Fn(u32, Vec<u8>) -> (u32, String, Vec<u8>) + Send + Sync> RequestHandler for F {
    fn handle_request(&self, command: u32, body: Vec<u8>) -> (u32, String, Vec<u8>) { self(command, body) }
}

pub trait NotifyHandler: Send + Sync {
    fn handle_notify(&self, command: u32, body: Vec<u8>);
}

impl<F: Fn(u32, Vec<u8>) + Send + Sync> NotifyHandler for F {
    fn handle_notify(&self, command: u32, body: Vec<u8>) { self(command, body) }
}

pub struct RpcResponse {
    pub status: u32,
    pub status_text: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RpcStreamConfig {
    pub max_body: u32,
    pub connect_timeout_ms: u64,
    pub reconnect_backoff_initial_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub outbound_queue_capacity: usize,
}

impl Default for RpcStreamConfig {
    fn default() -> Self {
        RpcStreamConfig {
            max_body: MAX_BODY_DEFAULT,
            connect_timeout_ms: 5_000,
            reconnect_backoff_initial_ms: 200,
            reconnect_backoff_max_ms: 10_000,
            outbound_queue_capacity: 64,
        }
    }
}

struct PendingCall {
    scheduler: Arc<Scheduler>,
    task: Arc<Task>,
    slot: Arc<Mutex<Option<RuntimeResult<RpcResponse>>>>,
}

/// A length-framed, bidirectional, correlation-tagged transport over a
/// [`Socket`]. The writer's outbound queue is a lock-free bounded
/// [`ArrayQueue`], fed by a pair of [`CoroutineSemaphore`]s: `outbound_slots`
/// counts free capacity (producers wait on it — this is the back-pressure
/// point), `outbound_items` counts queued messages (the writer waits on it).
pub struct RpcStream {
    config: RpcStreamConfig,
    reactor: Arc<Reactor>,
    worker: Arc<Scheduler>,
    peer: Option<BindSpec>,
    reconnect: bool,
    socket: Mutex<Option<Arc<Socket>>>,
    state: Mutex<StreamState>,
    next_seq: AtomicU32,
    pending: Mutex<HashMap<SequenceId, PendingCall>>,
    outbound: ArrayQueue<RpcMessage>,
    outbound_items: Arc<CoroutineSemaphore>,
    outbound_slots: Arc<CoroutineSemaphore>,
    request_handler: Option<Arc<dyn RequestHandler>>,
    notify_handler: Option<Arc<dyn NotifyHandler>>,
    running: AtomicBool,
}

impl RpcStream {
    /// A client-side stream: `start()` connects to `peer` and keeps
    /// reconnecting (with backoff) across disconnects until `stop()`.
    pub fn new(
        peer: BindSpec,
        reactor: Arc<Reactor>,
        config: RpcStreamConfig,
        request_handler: Option<Arc<dyn RequestHandler>>,
        notify_handler: Option<Arc<dyn NotifyHandler>>,
    ) -> Arc<RpcStream> {
        Self::build(Some(peer), true, reactor, config, request_handler, notify_handler)
    }

    /// A server-side stream wrapping an already-accepted, already-connected
    /// socket. There's nothing to reconnect to — once this socket dies the
    /// stream is done for good.
    pub fn accept(
        socket: Socket,
        reactor: Arc<Reactor>,
        config: RpcStreamConfig,
        request_handler: Option<Arc<dyn RequestHandler>>,
        notify_handler: Option<Arc<dyn NotifyHandler>>,
    ) -> Arc<RpcStream> {
        let stream = Self::build(None, false, reactor, config, request_handler, notify_handler);
        *stream.state.lock().unwrap() = StreamState::Connected;
        *stream.socket.lock().unwrap() = Some(Arc::new(socket));
        stream
    }

    fn build(
        peer: Option<BindSpec>,
        reconnect: bool,
        reactor: Arc<Reactor>,
        config: RpcStreamConfig,
        request_handler: Option<Arc<dyn RequestHandler>>,
        notify_handler: Option<Arc<dyn NotifyHandler>>,
    ) -> Arc<RpcStream> {
        let worker = reactor.scheduler().clone();
        Arc::new(RpcStream {
            outbound_slots: CoroutineSemaphore::new(config.outbound_queue_capacity),
            outbound: ArrayQueue::new(config.outbound_queue_capacity.max(1)),
            config,
            reactor,
            worker,
            peer,
            reconnect,
            socket: Mutex::new(None),
            state: Mutex::new(StreamState::Disconnected),
            next_seq: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound_items: CoroutineSemaphore::new(0),
            request_handler,
            notify_handler,
            running: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> StreamState { *self.state.lock().unwrap() }

    /// For a client stream: spawns the connection/reconnection driver. For
    /// an accepted stream: spawns the reader and writer over the socket it
    /// was built with. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.reconnect {
            let stream = self.clone();
            self.worker.schedule_thunk(move || stream.connection_loop(), None);
        } else {
            let socket = self.socket.lock().unwrap().clone().expect("accepted stream built without a socket");
            self.spawn_session(socket);
        }
    }

    /// Enqueues a `Request`, suspending the caller until a correlated
    /// `Response` arrives or `timeout_ms` elapses. Blocks (cooperatively,
    /// via `io::usleep`) while the stream is `Connecting`, up to the same
    /// deadline. Must be called from within a running task.
    pub fn request(self: &Arc<Self>, command: u32, body: Vec<u8>, timeout_ms: u64) -> RuntimeResult<RpcResponse> {
        let deadline = now_ms().saturating_add(timeout_ms);
        loop {
            match self.state() {
                StreamState::Connected => break,
                StreamState::Draining => return Err(RuntimeError::NotConnected),
                StreamState::Disconnected if !self.reconnect => return Err(RuntimeError::NotConnected),
                _ => {
                    if now_ms() >= deadline {
                        return Err(RuntimeError::Timeout);
                    }
                    io::usleep(5_000);
                }
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let task = current_task().expect("RpcStream::request called outside of a task");
        let scheduler = Scheduler::current().expect("RpcStream::request called outside of a scheduler");
        let slot = Arc::new(Mutex::new(None));
        self.pending.lock().unwrap().insert(seq, PendingCall { scheduler: scheduler.clone(), task: task.clone(), slot: slot.clone() });

        let remaining = deadline.saturating_sub(now_ms()).max(1);
        let stream = self.clone();
        let timer = self.reactor.timers().add_timer(
            remaining,
            move || {
                if let Some(pending) = stream.pending.lock().unwrap().remove(&seq) {
                    pending.scheduler.schedule(pending.task, None);
                }
            },
            false,
        );

        self.enqueue_outbound(RpcMessage::Request { command, seq, body });
        Task::yield_to_suspended();
        timer.cancel();

        match slot.lock().unwrap().take() {
            Some(result) => result,
            None => Err(RuntimeError::Timeout),
        }
    }

    /// Enqueues a `Notify` and returns immediately (after any back-pressure
    /// wait the outbound queue imposes).
    pub fn notify(&self, command: u32, body: Vec<u8>) {
        self.enqueue_outbound(RpcMessage::Notify { command, body });
    }

    fn enqueue_outbound(&self, msg: RpcMessage) {
        self.outbound_slots.wait();
        if self.outbound.push(msg).is_err() {
            // outbound_slots guarantees a free slot; a push failing here
            // means slots and queue capacity have drifted out of sync.
            tracing::error!("rpc outbound queue full despite a reserved slot, dropping message");
            self.outbound_slots.notify();
            return;
        }
        self.outbound_items.notify();
    }

    fn connection_loop(self: Arc<Self>) {
        let mut backoff = self.config.reconnect_backoff_initial_ms;
        let peer = self.peer.clone().expect("client stream built without a peer");
        while self.running.load(Ordering::SeqCst) {
            *self.state.lock().unwrap() = StreamState::Connecting;
            match self.connect_once(&peer) {
                Ok(socket) => {
                    backoff = self.config.reconnect_backoff_initial_ms;
                    *self.state.lock().unwrap() = StreamState::Connected;
                    self.run_session_until_broken(socket);
                }
                Err(_) => {}
            }
            if !self.running.load(Ordering::SeqCst) || self.state() == StreamState::Draining {
                break;
            }
            *self.state.lock().unwrap() = StreamState::Disconnected;
            self.fail_pending_calls();
            io::usleep(backoff * 1000);
            backoff = (backoff * 2).min(self.config.reconnect_backoff_max_ms);
        }
        *self.state.lock().unwrap() = StreamState::Disconnected;
        self.fail_pending_calls();
    }

    fn connect_once(&self, peer: &BindSpec) -> RuntimeResult<Arc<Socket>> {
        let mut socket = match peer {
            BindSpec::Unix(_) => Socket::unix_stream()?,
            BindSpec::Tcp(addr) if addr.is_ipv6() => Socket::tcp_v6()?,
            BindSpec::Tcp(_) => Socket::tcp_v4()?,
        };
        socket.connect(peer, Some(self.config.connect_timeout_ms))?;
        let socket = Arc::new(socket);
        *self.socket.lock().unwrap() = Some(socket.clone());
        Ok(socket)
    }

    /// Spawns reader/writer, then polls (cooperatively) until the session's
    /// socket is replaced or cleared, i.e. until the connection dies.
    fn run_session_until_broken(self: &Arc<Self>, socket: Arc<Socket>) {
        self.spawn_session(socket.clone());
        while self.is_current_socket(&socket) && self.running.load(Ordering::SeqCst) {
            io::usleep(20_000);
        }
    }

    fn spawn_session(self: &Arc<Self>, socket: Arc<Socket>) {
        let reader = self.clone();
        let reader_socket = socket.clone();
        self.worker.schedule_thunk(move || reader.reader_loop(reader_socket), None);
        let writer = self.clone();
        self.worker.schedule_thunk(move || writer.writer_loop(socket), None);
    }

    fn is_current_socket(&self, socket: &Arc<Socket>) -> bool {
        self.socket.lock().unwrap().as_ref().is_some_and(|s| Arc::ptr_eq(s, socket))
    }

    fn reader_loop(self: Arc<Self>, socket: Arc<Socket>) {
        loop {
            match RpcMessage::decode(&socket, self.config.max_body) {
                Ok(msg) => self.dispatch_inbound(msg),
                Err(RuntimeError::Protocol(reason)) => {
                    tracing::warn!(reason, "rpc stream protocol error, draining");
                    *self.state.lock().unwrap() = StreamState::Draining;
                    self.clear_socket(&socket);
                    break;
                }
                Err(_) => {
                    self.clear_socket(&socket);
                    break;
                }
            }
            if !self.is_current_socket(&socket) {
                break;
            }
        }
    }

    fn dispatch_inbound(self: &Arc<Self>, msg: RpcMessage) {
        match msg {
            RpcMessage::Response { seq, status, status_text, body, .. } => {
                if let Some(pending) = self.pending.lock().unwrap().remove(&seq) {
                    *pending.slot.lock().unwrap() = Some(Ok(RpcResponse { status, status_text, body }));
                    pending.scheduler.schedule(pending.task, None);
                }
                // No pending call for `seq`: either never existed on this
                // stream, or it already timed out — a late response is
                // silently dropped either way.
            }
            RpcMessage::Request { command, seq, body } => {
                if let Some(handler) = self.request_handler.clone() {
                    let (status, status_text, resp_body) = handler.handle_request(command, body);
                    self.enqueue_outbound(RpcMessage::Response { command, seq, status, status_text, body: resp_body });
                }
            }
            RpcMessage::Notify { command, body } => {
                if let Some(handler) = &self.notify_handler {
                    handler.handle_notify(command, body);
                }
            }
        }
    }

    /// Dequeues whatever's queued at wake-up time (one `wait()`-worth at
    /// least, plus anything else already sitting there) and writes it as a
    /// single framed batch, coalescing multiple messages into one send.
    fn writer_loop(self: Arc<Self>, socket: Arc<Socket>) {
        loop {
            self.outbound_items.wait();
            if !self.is_current_socket(&socket) {
                break;
            }
            let mut batch = Vec::new();
            if let Some(first) = self.outbound.pop() {
                batch.push(first);
            }
            while let Some(next) = self.outbound.pop() {
                self.outbound_items.try_wait();
                batch.push(next);
            }
            let mut framed = Vec::new();
            let mut encode_failed = false;
            for msg in &batch {
                match msg.encode(self.config.max_body) {
                    Ok(bytes) => framed.extend_from_slice(&bytes),
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping unencodable outbound rpc message");
                        encode_failed = true;
                    }
                }
            }
            for _ in 0..batch.len() {
                self.outbound_slots.notify();
            }
            if encode_failed && framed.is_empty() {
                continue;
            }
            if let Err(err) = socket.write_all(&framed) {
                tracing::warn!(error = %err, "rpc stream write failed");
                self.clear_socket(&socket);
                break;
            }
            if !self.is_current_socket(&socket) {
                break;
            }
        }
    }

    fn clear_socket(&self, socket: &Arc<Socket>) {
        let mut current = self.socket.lock().unwrap();
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, socket)) {
            *current = None;
        }
    }

    fn fail_pending_calls(&self) {
        let pending: Vec<PendingCall> = std::mem::take(&mut *self.pending.lock().unwrap()).into_values().collect();
        for call in pending {
            *call.slot.lock().unwrap() = Some(Err(RuntimeError::NotConnected));
            call.scheduler.schedule(call.task, None);
        }
    }

    /// Stops the stream: marks it `Draining`, cancels the live socket's
    /// pending I/O (waking the reader/writer so they observe the torn-down
    /// socket), wakes a parked writer, and fails every pending call with
    /// `NotConnected`. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.state.lock().unwrap() = StreamState::Draining;
        if let Some(socket) = self.socket.lock().unwrap().take() {
            socket.cancel_all();
        }
        self.outbound_items.notify();
        self.fail_pending_calls();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::BindSpec;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_request_response_roundtrip() {
        let scheduler = Scheduler::new("rpc-test", 2);
        let reactor = Reactor::new(scheduler.clone()).unwrap();
        scheduler.start();

        let mut listener = Socket::tcp_v4().unwrap();
        listener.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(16).unwrap();
        let port = match listener.local_addr().unwrap() {
            BindSpec::Tcp(addr) => addr.port(),
            _ => unreachable!(),
        };

        let echo_handler: Arc<dyn RequestHandler> = Arc::new(|command: u32, body: Vec<u8>| {
            assert_eq!(command, 7);
            (200, "ok".to_string(), body)
        });
        let reactor_accept = reactor.clone();
        reactor.scheduler().schedule_thunk(
            move || {
                let accepted = listener.accept().unwrap();
                let server = RpcStream::accept(accepted, reactor_accept, RpcStreamConfig::default(), Some(echo_handler), None);
                server.start();
                // Held alive for the test's duration by leaking the Arc: a
                // standalone accept loop would stash these in a session
                // table instead.
                std::mem::forget(server);
            },
            None,
        );

        let result = Arc::new(Mutex::new(None));
        let result_in_task = result.clone();
        let reactor_client = reactor.clone();
        reactor.scheduler().schedule_thunk(
            move || {
                let peer = BindSpec::Tcp(format!("127.0.0.1:{port}").parse().unwrap());
                let client = RpcStream::new(peer, reactor_client, RpcStreamConfig::default(), None, None);
                client.start();
                let response = client.request(7, b"hello".to_vec(), 1_000);
                *result_in_task.lock().unwrap() = Some(response);
            },
            None,
        );

        std::thread::sleep(Duration::from_millis(300));
        scheduler.stop();

        let response = result.lock().unwrap().take().expect("request task did not run").unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_request_times_out_and_late_response_is_dropped() {
        let scheduler = Scheduler::new("rpc-timeout-test", 2);
        let reactor = Reactor::new(scheduler.clone()).unwrap();
        scheduler.start();

        let mut listener = Socket::tcp_v4().unwrap();
        listener.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(16).unwrap();
        let port = match listener.local_addr().unwrap() {
            BindSpec::Tcp(addr) => addr.port(),
            _ => unreachable!(),
        };

        let handled = Arc::new(AtomicU32::new(0));
        let handled_in_handler = handled.clone();
        let slow_handler: Arc<dyn RequestHandler> = Arc::new(move |_command: u32, body: Vec<u8>| {
            io::usleep(300_000);
            handled_in_handler.fetch_add(1, Ordering::SeqCst);
            (200, "ok".to_string(), body)
        });
        let reactor_accept = reactor.clone();
        reactor.scheduler().schedule_thunk(
            move || {
                let accepted = listener.accept().unwrap();
                let server = RpcStream::accept(accepted, reactor_accept, RpcStreamConfig::default(), Some(slow_handler), None);
                server.start();
                std::mem::forget(server);
            },
            None,
        );

        let result = Arc::new(Mutex::new(None));
        let result_in_task = result.clone();
        let reactor_client = reactor.clone();
        reactor.scheduler().schedule_thunk(
            move || {
                let peer = BindSpec::Tcp(format!("127.0.0.1:{port}").parse().unwrap());
                let client = RpcStream::new(peer, reactor_client, RpcStreamConfig::default(), None, None);
                client.start();
                let response = client.request(1, b"slow".to_vec(), 100);
                *result_in_task.lock().unwrap() = Some(response);
            },
            None,
        );

        std::thread::sleep(Duration::from_millis(250));
        let outcome = result.lock().unwrap().take().expect("request task did not run");
        assert!(matches!(outcome, Err(RuntimeError::Timeout)));

        // Let the slow handler's response land and confirm it didn't
        // resurrect or corrupt anything (it has nothing left to complete).
        std::thread::sleep(Duration::from_millis(300));
        scheduler.stop();
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}
