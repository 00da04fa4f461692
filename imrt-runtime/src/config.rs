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

//! YAML configuration surface. Only the sections the core consumes are
//! modeled here; an application's own config sections are the
//! application's problem, not this crate's.

use std::{collections::HashMap, path::Path};

use serde::Deserialize;

use crate::error::{RuntimeError, RuntimeResult};

fn default_stack_size() -> usize { 1024 * 1024 }
fn default_connect_timeout_ms() -> u64 { 5_000 }

/// Stack size used for one-shot tasks synthesized from a bare thunk (e.g.
/// `Scheduler::schedule_thunk`), independent of any parsed `Config`.
pub fn default_task_stack_size() -> usize { default_stack_size() }

#[derive(Debug, Clone, Deserialize)]
pub struct CoroutineConfig {
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

impl Default for CoroutineConfig {
    fn default() -> Self { CoroutineConfig { stack_size: default_stack_size() } }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TcpConnectConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub timeout: u64,
}

impl Default for TcpConnectConfig {
    fn default() -> Self { TcpConnectConfig { timeout: default_connect_timeout_ms() } }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TcpConfig {
    #[serde(default)]
    pub connect: TcpConnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub thread_count: usize,
    #[serde(default)]
    pub use_caller: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TcpServerConfig {
    pub address: Vec<String>,
    #[serde(default)]
    pub keepalive: i32,
    #[serde(default = "default_server_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub ssl: u8,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub accept_worker: Option<String>,
    pub io_worker: Option<String>,
    pub process_worker: Option<String>,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

fn default_server_timeout() -> u64 { 240_000 }

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coroutine: CoroutineConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub workers: HashMap<String, WorkerConfig>,
    #[serde(default)]
    pub servers: Vec<TcpServerConfig>,
}

impl Config {
    pub fn load_from_str(yaml: &str) -> RuntimeResult<Config> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RuntimeError::Protocol(format!("invalid config yaml: {e}")))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> RuntimeResult<Config> {
        let text = std::fs::read_to_string(path)?;
        Self::load_from_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_with_empty_yaml() {
        let config = Config::load_from_str("{}").unwrap();
        assert_eq!(config.coroutine.stack_size, 1024 * 1024);
        assert_eq!(config.tcp.connect.timeout, 5_000);
        assert!(config.workers.is_empty());
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_config_parses_workers_and_servers() {
        let yaml = r#"
coroutine:
  stack_size: 65536
tcp:
  connect:
    timeout: 1000
workers:
  io:
    thread_count: 4
    use_caller: false
servers:
  - address: ["0.0.0.0:8080"]
    timeout: 1000
    accept_worker: io
"#;
        let config = Config::load_from_str(yaml).unwrap();
        assert_eq!(config.coroutine.stack_size, 65536);
        assert_eq!(config.tcp.connect.timeout, 1000);
        assert_eq!(config.workers["io"].thread_count, 4);
        assert_eq!(config.servers[0].address[0], "0.0.0.0:8080");
    }
}
