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

//! Socket wrapper and the accept-loop server built on top of it.

pub mod socket;
pub mod tcp_server;
pub mod tls;

pub use socket::{BindSpec, Socket};
pub use tcp_server::{TcpServer, TcpServerHandlers};
pub use tls::{TlsAcceptor, TlsConnector};
