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

//! The bit-exact frame layout of an RPC message and its encode/decode over
//! a [`Socket`]. No framing version byte or magic number: peers agree on
//! the layout out-of-band, by construction of this crate.

use crate::error::{RuntimeError, RuntimeResult};
use crate::net::socket::Socket;

pub const MAX_BODY_DEFAULT: u32 = 4 * 1024 * 1024;
pub const MAX_BODY_HARD_CAP: u32 = 16 * 1024 * 1024;

pub type SequenceId = u32;

const KIND_REQUEST: u8 = 0x01;
const KIND_RESPONSE: u8 = 0x02;
const KIND_NOTIFY: u8 = 0x03;

/// One frame on an RPC stream. `Request`/`Notify` carry a command and an
/// opaque body; `Response` additionally carries a status code and a short
/// status string. The wire sequence-number field is present for every kind
/// but is always zero for `Notify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    Request { command: u32, seq: SequenceId, body: Vec<u8> },
    Response { command: u32, seq: SequenceId, status: u32, status_text: String, body: Vec<u8> },
    Notify { command: u32, body: Vec<u8> },
}

impl RpcMessage {
    pub fn command(&self) -> u32 {
        match self {
            RpcMessage::Request { command, .. } => *command,
            RpcMessage::Response { command, .. } => *command,
            RpcMessage::Notify { command, .. } => *command,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            RpcMessage::Request { body, .. } => body,
            RpcMessage::Response { body, .. } => body,
            RpcMessage::Notify { body, .. } => body,
        }
    }

    /// Serializes this message, rejecting a body that exceeds
    /// `max_body.min(MAX_BODY_HARD_CAP)`.
    pub fn encode(&self, max_body: u32) -> RuntimeResult<Vec<u8>> {
        let cap = max_body.min(MAX_BODY_HARD_CAP);
        let body = self.body();
        if body.len() as u64 > cap as u64 {
            return Err(RuntimeError::Protocol(format!("body of {} bytes exceeds max_body {cap}", body.len())));
        }
        let mut out = Vec::with_capacity(13 + body.len());
        match self {
            RpcMessage::Request { command, seq, body } => {
                out.push(KIND_REQUEST);
                out.extend_from_slice(&command.to_be_bytes());
                out.extend_from_slice(&seq.to_be_bytes());
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(body);
            }
            RpcMessage::Response { command, seq, status, status_text, body } => {
                out.push(KIND_RESPONSE);
                out.extend_from_slice(&command.to_be_bytes());
                out.extend_from_slice(&seq.to_be_bytes());
                out.extend_from_slice(&status.to_be_bytes());
                let status_bytes = status_text.as_bytes();
                let status_len = status_bytes.len().min(u16::MAX as usize) as u16;
                out.extend_from_slice(&status_len.to_be_bytes());
                out.extend_from_slice(&status_bytes[..status_len as usize]);
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(body);
            }
            RpcMessage::Notify { command, body } => {
                out.push(KIND_NOTIFY);
                out.extend_from_slice(&command.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(body);
            }
        }
        Ok(out)
    }

    /// Reads exactly one frame from `socket`, suspending the current task on
    /// each would-block read (via [`Socket::recv`]'s interception). Returns
    /// `ProtocolError` for an unknown kind or an oversize body length, and
    /// `NotConnected` if the peer closes mid-frame.
    pub fn decode(socket: &Socket, max_body: u32) -> RuntimeResult<RpcMessage> {
        let cap = max_body.min(MAX_BODY_HARD_CAP);

        let mut kind_buf = [0u8; 1];
        read_exact(socket, &mut kind_buf)?;
        let mut command_buf = [0u8; 4];
        read_exact(socket, &mut command_buf)?;
        let command = u32::from_be_bytes(command_buf);
        let mut seq_buf = [0u8; 4];
        read_exact(socket, &mut seq_buf)?;
        let seq = u32::from_be_bytes(seq_buf);

        match kind_buf[0] {
            KIND_REQUEST => Ok(RpcMessage::Request { command, seq, body: read_body(socket, cap)? }),
            KIND_NOTIFY => Ok(RpcMessage::Notify { command, body: read_body(socket, cap)? }),
            KIND_RESPONSE => {
                let mut status_buf = [0u8; 4];
                read_exact(socket, &mut status_buf)?;
                let status = u32::from_be_bytes(status_buf);
                let mut len_buf = [0u8; 2];
                read_exact(socket, &mut len_buf)?;
                let status_len = u16::from_be_bytes(len_buf) as usize;
                let mut status_bytes = vec![0u8; status_len];
                read_exact(socket, &mut status_bytes)?;
                let status_text = String::from_utf8(status_bytes)
                    .map_err(|e| RuntimeError::Protocol(format!("status text is not utf-8: {e}")))?;
                Ok(RpcMessage::Response { command, seq, status, status_text, body: read_body(socket, cap)? })
            }
            other => Err(RuntimeError::Protocol(format!("unknown rpc message kind {other:#04x}"))),
        }
    }
}

fn read_body(socket: &Socket, cap: u32) -> RuntimeResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read_exact(socket, &mut len_buf)?;
    let body_len = u32::from_be_bytes(len_buf);
    if body_len > cap {
        return Err(RuntimeError::Protocol(format!("body length {body_len} exceeds max_body {cap}")));
    }
    let mut body = vec![0u8; body_len as usize];
    read_exact(socket, &mut body)?;
    Ok(body)
}

fn read_exact(socket: &Socket, buf: &mut [u8]) -> RuntimeResult<()> {
    let mut off = 0;
    while off < buf.len() {
        let n = socket.recv(&mut buf[off..])?;
        if n == 0 {
            return Err(RuntimeError::NotConnected);
        }
        off += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::socketpair_for_test;

    #[test]
    fn test_encode_request_frame_layout() {
        let msg = RpcMessage::Request { command: 7, seq: 1, body: b"hello".to_vec() };
        let bytes = msg.encode(MAX_BODY_DEFAULT).unwrap();
        assert_eq!(bytes[0], KIND_REQUEST);
        assert_eq!(&bytes[1..5], &7u32.to_be_bytes());
        assert_eq!(&bytes[5..9], &1u32.to_be_bytes());
        assert_eq!(&bytes[9..13], &5u32.to_be_bytes());
        assert_eq!(&bytes[13..], b"hello");
    }

    #[test]
    fn test_encode_notify_has_zero_sequence_number() {
        let msg = RpcMessage::Notify { command: 3, body: vec![] };
        let bytes = msg.encode(MAX_BODY_DEFAULT).unwrap();
        assert_eq!(bytes[0], KIND_NOTIFY);
        assert_eq!(&bytes[5..9], &0u32.to_be_bytes());
    }

    #[test]
    fn test_encode_rejects_oversize_body() {
        let msg = RpcMessage::Notify { command: 1, body: vec![0u8; 10] };
        assert!(msg.encode(4).is_err());
    }

    #[test]
    fn test_decode_reads_request_written_over_a_socket() {
        let (a, b) = socketpair_for_test();
        let msg = RpcMessage::Request { command: 42, seq: 9, body: b"payload".to_vec() };
        a.write_all(&msg.encode(MAX_BODY_DEFAULT).unwrap()).unwrap();
        match RpcMessage::decode(&b, MAX_BODY_DEFAULT).unwrap() {
            RpcMessage::Request { command, seq, body } => {
                assert_eq!(command, 42);
                assert_eq!(seq, 9);
                assert_eq!(body, b"payload");
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_response_round_trips_status_text() {
        let (a, b) = socketpair_for_test();
        let msg = RpcMessage::Response { command: 7, seq: 1, status: 200, status_text: "ok".into(), body: b"hello".to_vec() };
        a.write_all(&msg.encode(MAX_BODY_DEFAULT).unwrap()).unwrap();
        match RpcMessage::decode(&b, MAX_BODY_DEFAULT).unwrap() {
            RpcMessage::Response { status, status_text, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(status_text, "ok");
                assert_eq!(body, b"hello");
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_body_over_the_configured_cap() {
        let (a, b) = socketpair_for_test();
        let oversized = RpcMessage::Notify { command: 1, body: vec![0u8; 100] };
        a.write_all(&oversized.encode(1000).unwrap()).unwrap();
        assert!(RpcMessage::decode(&b, 10).is_err());
    }
}
