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

//! Accept loop over one or more bound sockets, handing each accepted
//! connection to a per-connection task on a configurable worker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::TcpServerConfig;
use crate::error::RuntimeResult;
use crate::net::socket::{BindSpec, Socket};
use crate::net::tls::TlsAcceptor;
use crate::scheduler::Scheduler;

/// The business logic a concrete server hangs off the accept loop. Named
/// `TcpServerHandlers` rather than a single method so a future server kind
/// (e.g. one that also wants a per-connection teardown hook) can grow this
/// without breaking `TcpServer::new`'s signature.
pub trait TcpServerHandlers: Send + Sync {
    /// Runs as a fresh task on the io worker for every accepted connection.
    fn handle_client(&self, client: Socket);
}

impl<F: Fn(Socket) + Send + Sync> TcpServerHandlers for F {
    fn handle_client(&self, client: Socket) { self(client) }
}

/// Accept loop over one or more bound listening sockets. Construct with
/// `TcpServer::new`, `bind` one or more addresses, then `start`; `stop`
/// cancels the accept loops and waits (bounded by `config.timeout`) for
/// in-flight connection tasks to finish.
pub struct TcpServer {
    config: TcpServerConfig,
    accept_worker: Arc<Scheduler>,
    io_worker: Arc<Scheduler>,
    handlers: Arc<dyn TcpServerHandlers>,
    listeners: Mutex<Vec<Arc<Socket>>>,
    running: AtomicBool,
    inflight: Arc<AtomicUsize>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl TcpServer {
    pub fn new(
        config: TcpServerConfig,
        accept_worker: Arc<Scheduler>,
        io_worker: Arc<Scheduler>,
        handlers: Arc<dyn TcpServerHandlers>,
    ) -> TcpServer {
        let tls_acceptor = Self::build_tls_acceptor(&config);
        TcpServer {
            config,
            accept_worker,
            io_worker,
            handlers,
            listeners: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            inflight: Arc::new(AtomicUsize::new(0)),
            tls_acceptor,
        }
    }

    /// Builds the shared `TlsAcceptor` an `ssl: 1` config entry asks for.
    /// Logs and runs as a plaintext server instead of failing construction
    /// outright if the cert/key pair can't be loaded — matching `bind`'s own
    /// policy of reporting per-address failures rather than aborting the
    /// whole server.
    fn build_tls_acceptor(config: &TcpServerConfig) -> Option<TlsAcceptor> {
        if config.ssl == 0 {
            return None;
        }
        let (Some(cert_file), Some(key_file)) = (config.cert_file.as_deref(), config.key_file.as_deref()) else {
            tracing::error!(name = ?config.name, "tcp server config has ssl: 1 but is missing cert_file/key_file");
            return None;
        };
        match TlsAcceptor::from_files(cert_file, key_file) {
            Ok(acceptor) => Some(acceptor),
            Err(err) => {
                tracing::error!(name = ?config.name, error = %err, "failed to build tls acceptor, server will run without tls");
                None
            }
        }
    }

    pub fn config(&self) -> &TcpServerConfig { &self.config }

    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    pub fn sockets(&self) -> Vec<Arc<Socket>> { self.listeners.lock().unwrap().clone() }

    /// Binds every address in `config.address`, reporting failures but
    /// proceeding with whichever addresses succeeded. Idempotent once at
    /// least one bind has already succeeded (a second call just rebinds
    /// any addresses not already listening).
    pub fn bind(&self) -> Vec<(String, RuntimeResult<()>)> {
        let mut results = Vec::new();
        for addr in &self.config.address {
            let outcome = self.bind_one(addr);
            let failed = outcome.is_err();
            results.push((addr.clone(), outcome));
            if failed {
                tracing::warn!(address = %addr, "tcp server failed to bind address");
            }
        }
        results
    }

    fn bind_one(&self, addr: &str) -> RuntimeResult<()> {
        let spec: BindSpec = addr.parse()?;
        let mut socket = match &spec {
            BindSpec::Unix(_) => Socket::unix_stream()?,
            BindSpec::Tcp(a) if a.is_ipv6() => Socket::tcp_v6()?,
            BindSpec::Tcp(_) => Socket::tcp_v4()?,
        };
        socket.bind(&spec)?;
        socket.listen(1024)?;
        self.listeners.lock().unwrap().push(Arc::new(socket));
        Ok(())
    }

    /// Spawns one accept-loop task per listening socket on the accept
    /// worker. Each accepted connection is handed to `handle_client` as a
    /// fresh task on the io worker.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            let server = self.clone();
            self.accept_worker.schedule_thunk(move || server.accept_loop(listener), None);
        }
        tracing::info!(name = ?self.config.name, addresses = ?self.config.address, "tcp server started");
    }

    fn accept_loop(self: Arc<Self>, listener: Arc<Socket>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok(client) => {
                    let handlers = self.handlers.clone();
                    let inflight = self.inflight.clone();
                    let tls_acceptor = self.tls_acceptor.clone();
                    inflight.fetch_add(1, Ordering::SeqCst);
                    self.io_worker.schedule_thunk(
                        move || {
                            // The handshake runs as part of this task, on the io
                            // worker, so a slow or stalled peer suspends the task
                            // instead of blocking the worker thread — same as
                            // every other intercepted read/write in this crate.
                            let ready = match &tls_acceptor {
                                Some(acceptor) => match client.upgrade_tls_server(acceptor) {
                                    Ok(()) => true,
                                    Err(err) => {
                                        tracing::warn!(error = %err, "tls handshake failed, dropping connection");
                                        false
                                    }
                                },
                                None => true,
                            };
                            if ready {
                                handlers.handle_client(client);
                            }
                            inflight.fetch_sub(1, Ordering::SeqCst);
                        },
                        None,
                    );
                }
                Err(_) if !self.running.load(Ordering::SeqCst) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "tcp server accept failed, retrying");
                }
            }
        }
    }

    /// Cancels every listening socket's pending `accept()` (waking the
    /// accept loops, which then observe `running == false` and exit), then
    /// waits up to `config.timeout` milliseconds for in-flight connection
    /// tasks to drain. Idempotent: a second call is a no-op.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for listener in self.listeners.lock().unwrap().iter() {
            listener.cancel_accept();
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.timeout);
        while self.inflight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        tracing::info!(name = ?self.config.name, "tcp server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicU32;

    fn test_config(addr: &str) -> TcpServerConfig {
        TcpServerConfig { address: vec![addr.to_string()], timeout: 500, ..Default::default() }
    }

    #[test]
    fn test_echo_accept_roundtrip() {
        let scheduler = Scheduler::new("tcp-test", 2);
        let reactor = Reactor::new(scheduler.clone()).unwrap();
        scheduler.start();

        let echoes = Arc::new(AtomicU32::new(0));
        let echoes2 = echoes.clone();
        let handler = move |client: Socket| {
            let mut buf = [0u8; 64];
            if let Ok(n) = client.recv(&mut buf) {
                if n > 0 {
                    let _ = client.write_all(&buf[..n]);
                    echoes2.fetch_add(1, Ordering::SeqCst);
                }
            }
        };

        let config = test_config("127.0.0.1:0");
        let server = Arc::new(TcpServer::new(config, reactor.scheduler().clone(), reactor.scheduler().clone(), Arc::new(handler)));
        server.bind();
        let port = local_port(&server);
        server.start();

        std::thread::sleep(Duration::from_millis(50));
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        use std::io::{Read, Write};
        stream.write_all(b"ping\n").unwrap();
        let mut response = [0u8; 64];
        let n = stream.read(&mut response).unwrap();
        assert_eq!(&response[..n], b"ping\n");

        drop(stream);
        std::thread::sleep(Duration::from_millis(100));
        server.stop();
        scheduler.stop();
        assert_eq!(echoes.load(Ordering::SeqCst), 1);
    }

    fn local_port(server: &TcpServer) -> u16 {
        match server.sockets()[0].local_addr() {
            Some(BindSpec::Tcp(addr)) => addr.port(),
            _ => panic!("expected a tcp bind"),
        }
    }

    const TEST_CERT: &str = include_str!("../../testdata/tls/test_cert.pem");
    const TEST_KEY: &str = include_str!("../../testdata/tls/test_key.pem");

    #[test]
    fn test_ssl_config_upgrades_accepted_connections_to_tls() {
        use crate::net::tls::TlsConnector;

        let mut cert_path = std::env::temp_dir();
        cert_path.push(format!("imrt-tcp-server-tls-test-{:?}-cert.pem", std::thread::current().id()));
        std::fs::write(&cert_path, TEST_CERT).unwrap();
        let mut key_path = std::env::temp_dir();
        key_path.push(format!("imrt-tcp-server-tls-test-{:?}-key.pem", std::thread::current().id()));
        std::fs::write(&key_path, TEST_KEY).unwrap();

        let scheduler = Scheduler::new("tcp-tls-test", 2);
        let reactor = Reactor::new(scheduler.clone()).unwrap();
        scheduler.start();

        let echoes = Arc::new(AtomicU32::new(0));
        let echoes2 = echoes.clone();
        let handler = move |client: Socket| {
            assert!(client.is_tls());
            let mut buf = [0u8; 64];
            if let Ok(n) = client.recv(&mut buf) {
                if n > 0 {
                    let _ = client.write_all(&buf[..n]);
                    echoes2.fetch_add(1, Ordering::SeqCst);
                }
            }
        };

        let config = TcpServerConfig {
            address: vec!["127.0.0.1:0".to_string()],
            timeout: 500,
            ssl: 1,
            cert_file: Some(cert_path.to_str().unwrap().to_string()),
            key_file: Some(key_path.to_str().unwrap().to_string()),
            ..Default::default()
        };
        let server = Arc::new(TcpServer::new(config, reactor.scheduler().clone(), reactor.scheduler().clone(), Arc::new(handler)));
        server.bind();
        let port = local_port(&server);
        server.start();

        std::thread::sleep(Duration::from_millis(50));
        // Plain TCP connect from a thread with no current reactor, then
        // upgrade in place; I/O in this thread falls back to blocking
        // syscalls since there's no reactor to suspend into.
        let mut client_socket = Socket::tcp_v4().unwrap();
        let peer: BindSpec = format!("127.0.0.1:{port}").parse().unwrap();
        client_socket.connect(&peer, None).unwrap();
        let connector = TlsConnector::with_no_verification().unwrap();
        client_socket.upgrade_tls_client(&connector, "localhost").unwrap();
        client_socket.write_all(b"hello tls").unwrap();
        let mut response = [0u8; 64];
        let n = client_socket.recv(&mut response).unwrap();
        assert_eq!(&response[..n], b"hello tls");

        drop(client_socket);
        std::thread::sleep(Duration::from_millis(100));
        server.stop();
        scheduler.stop();
        assert_eq!(echoes.load(Ordering::SeqCst), 1);

        std::fs::remove_file(cert_path).ok();
        std::fs::remove_file(key_path).ok();
    }
}
