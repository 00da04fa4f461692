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

//! Length-framed RPC transport: [`message`] defines the wire format,
//! [`stream`] drives a reader/writer pair of tasks over a [`crate::net::Socket`]
//! with correlation IDs, per-call timeouts, and (for client streams)
//! auto-reconnect.

pub mod message;
pub mod stream;

pub use message::{RpcMessage, SequenceId, MAX_BODY_DEFAULT, MAX_BODY_HARD_CAP};
pub use stream::{NotifyHandler, RequestHandler, RpcResponse, RpcStream, RpcStreamConfig, StreamState};
