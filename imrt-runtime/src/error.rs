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

//! The closed set of error kinds the core recognises. Syscall errors are
//! returned unchanged from intercepted wrappers (as `errno`, not through
//! this enum) — `RuntimeError` is for the layers above raw I/O: `Socket`,
//! `TcpServer`, and the RPC transport.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("syscall failed: {0}")]
    Syscall(#[from] io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("stream is not connected")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    /// `errno` a caller should see for this error if it has to be reported
    /// through a POSIX-shaped return value.
    pub fn as_errno(&self) -> i32 {
        match self {
            RuntimeError::Syscall(e) => e.raw_os_error().unwrap_or(libc::EIO),
            RuntimeError::Timeout => libc::ETIMEDOUT,
            RuntimeError::Cancelled => libc::ECANCELED,
            RuntimeError::NotConnected => libc::ENOTCONN,
            RuntimeError::Protocol(_) => libc::EPROTO,
            RuntimeError::ContractViolation(_) => libc::EINVAL,
        }
    }
}
