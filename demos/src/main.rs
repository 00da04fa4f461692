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

//! Echo server + loopback client: binds a [`TcpServer`] whose accepted
//! connections are wrapped as server-side [`RpcStream`]s with an echoing
//! request handler, then drives a client `RpcStream` against itself to
//! exercise `request()`/`notify()` end to end. `-t`/`-b` pick how an echoed
//! body is logged (text or hex), mirroring the runtime's own C++
//! `echo_server` example this is grounded on.

use std::sync::Arc;
use std::time::Duration;

use imrt_runtime::config::{Config, WorkerConfig};
use imrt_runtime::net::socket::{BindSpec, Socket};
use imrt_runtime::net::TcpServer;
use imrt_runtime::rpc::{RequestHandler, RpcStream, RpcStreamConfig};
use imrt_runtime::worker::WorkerRegistry;

#[derive(Clone, Copy)]
enum LogMode {
    Text,
    Hex,
}

fn log_echo(mode: LogMode, body: &[u8]) {
    match mode {
        LogMode::Text => tracing::info!(body = %String::from_utf8_lossy(body), "echoed"),
        LogMode::Hex => tracing::info!(body = %hex_string(body), "echoed"),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() {
    tracing_subscriber::fmt::init();

    let mode = match std::env::args().nth(1).as_deref() {
        Some("-b") => LogMode::Hex,
        _ => LogMode::Text,
    };

    let config = Config::load_from_path("imrt.yaml").unwrap_or_default();
    let registry = WorkerRegistry::init(&config).expect("failed to build worker pools from config");
    if registry.get("io").is_none() {
        registry.add("io", &WorkerConfig { thread_count: 2, use_caller: false }).unwrap();
    }
    if registry.get("accept").is_none() {
        registry.add("accept", &WorkerConfig { thread_count: 1, use_caller: false }).unwrap();
    }
    registry.start_all();

    let accept_pool = registry.get("accept").unwrap();
    let io_pool = registry.get("io").unwrap();
    let io_reactor = io_pool.as_reactor().cloned().expect("the io pool must be reactor-backed");

    let echo_handler: Arc<dyn RequestHandler> = Arc::new(move |_command: u32, body: Vec<u8>| {
        log_echo(mode, &body);
        (200, "ok".to_string(), body)
    });

    let rpc_reactor = io_reactor.clone();
    let server_config = imrt_runtime::config::TcpServerConfig {
        address: vec!["0.0.0.0:8020".to_string()],
        ..Default::default()
    };
    let server = Arc::new(TcpServer::new(
        server_config,
        accept_pool.scheduler().clone(),
        io_pool.scheduler().clone(),
        Arc::new(move |client: Socket| {
            let stream = RpcStream::accept(client, rpc_reactor.clone(), RpcStreamConfig::default(), Some(echo_handler.clone()), None);
            stream.start();
            // A real application would stash this in a session table keyed
            // by peer; this demo just lets it run until the socket dies.
            std::mem::forget(stream);
        }),
    ));
    for (address, result) in server.bind() {
        if let Err(err) = result {
            tracing::error!(address = %address, error = %err, "failed to bind echo server address");
        }
    }
    server.start();
    tracing::info!("echo server listening on 0.0.0.0:8020");

    let loopback_reactor = io_reactor.clone();
    io_pool.scheduler().schedule_thunk(
        move || {
            let peer = BindSpec::Tcp("127.0.0.1:8020".parse().unwrap());
            let client = RpcStream::new(peer, loopback_reactor, RpcStreamConfig::default(), None, None);
            client.start();
            match client.request(1, b"hello from imrt-demo".to_vec(), 2_000) {
                Ok(response) => {
                    tracing::info!(status = response.status, body = %String::from_utf8_lossy(&response.body), "loopback request completed");
                }
                Err(err) => tracing::warn!(error = %err, "loopback request failed"),
            }
            client.notify(2, b"fire and forget".to_vec());
            std::mem::forget(client);
        },
        None,
    );

    std::thread::sleep(Duration::from_secs(2));
    server.stop();
    registry.stop_all();
}
