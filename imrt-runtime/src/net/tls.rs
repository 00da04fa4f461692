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

//! The optional TLS layer a [`Socket`](super::socket::Socket) can be
//! upgraded into. `TlsAcceptor`/`TlsConnector` build the shared, reusable
//! `rustls` configs (one per listening server / outbound client, not one
//! per connection); `TlsSession` drives the handshake and then the
//! steady-state encrypt/decrypt over the socket's own fd, using the same
//! intercepted [`crate::io`] read/write primitives a plain `Socket` uses —
//! a `WANT_READ`/`WANT_WRITE` from rustls costs nothing extra here, because
//! the read/write it retries on already suspend the current task instead of
//! blocking the worker.

use std::fs::File;
use std::io::{self, BufReader};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Once};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use crate::error::{RuntimeError, RuntimeResult};

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

/// `rustls` 0.23 requires an explicit process-wide crypto provider before
/// any config is built. Installing it is idempotent by construction, but
/// `rustls` panics on a second *conflicting* install, so this is only ever
/// called through `Once`.
fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn load_certs(path: &str) -> RuntimeResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(RuntimeError::Syscall)?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RuntimeError::Protocol(format!("failed to parse certificate file {path:?}: {e}")))
}

fn load_private_key(path: &str) -> RuntimeResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(RuntimeError::Syscall)?;
    let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RuntimeError::Protocol(format!("failed to parse private key file {path:?}: {e}")))?;
    keys.into_iter()
        .next()
        .map(PrivateKeyDer::Pkcs8)
        .ok_or_else(|| RuntimeError::Protocol(format!("no pkcs8 private key found in {path:?}")))
}

/// Builds the shared `rustls::ServerConfig` a `TcpServerConfig{ssl: 1, ..}`
/// entry resolves to. One `TlsAcceptor` is built per listening server and
/// reused across every accepted connection — the expensive part (parsing
/// the cert chain, validating the key pair) happens once at bind time, not
/// per handshake.
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<rustls::ServerConfig>,
}

impl TlsAcceptor {
    pub fn from_files(cert_file: &str, key_file: &str) -> RuntimeResult<TlsAcceptor> {
        ensure_crypto_provider();
        let certs = load_certs(cert_file)?;
        let key = load_private_key(key_file)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| RuntimeError::Protocol(format!("invalid tls certificate/key pair: {e}")))?;
        Ok(TlsAcceptor { config: Arc::new(config) })
    }
}

/// Builds the shared `rustls::ClientConfig` an outbound TLS connection
/// handshakes with. `with_platform_roots` trusts the system root store
/// (via `rustls-native-certs`, matching how most TLS clients in the wild
/// are configured); `with_no_verification` skips certificate validation
/// entirely and exists for tests and for connecting to a peer authenticated
/// some other way — it is never selected by config alone.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<rustls::ClientConfig>,
}

impl TlsConnector {
    pub fn with_platform_roots() -> RuntimeResult<TlsConnector> {
        ensure_crypto_provider();
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            tracing::warn!(error = %err, "failed to load a native root certificate");
        }
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        let config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        Ok(TlsConnector { config: Arc::new(config) })
    }

    /// Skips server-certificate verification. Grounded on the test-only
    /// "accept any cert" connectors used to exercise a TLS handshake against
    /// a self-signed certificate without provisioning a trusted CA.
    pub fn with_no_verification() -> RuntimeResult<TlsConnector> {
        ensure_crypto_provider();
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification))
            .with_no_client_auth();
        Ok(TlsConnector { config: Arc::new(config) })
    }
}

#[derive(Debug)]
struct NoServerVerification;

impl rustls::client::danger::ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::ECDSA_SHA1_Legacy,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// A `std::io::Read`/`Write` view of a raw fd through the intercepted
/// `crate::io` wrappers, letting `rustls::Connection::{read_tls,write_tls}`
/// drive a socket the same cooperative way every other module in this crate
/// does. Carries no state of its own; the fd is owned by the `Socket` that
/// holds this session.
struct FdIo(RawFd);

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { crate::io::recv(self.0, buf, 0) }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { crate::io::send(self.0, buf, 0) }
    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

/// The server/client split of `rustls::Connection`: both sides expose the
/// same handshake and record-layer operations, just on distinct types, so
/// this matches on `self` once per call rather than forcing every caller to.
enum TlsSide {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsSide {
    fn is_handshaking(&self) -> bool {
        match self {
            TlsSide::Server(c) => c.is_handshaking(),
            TlsSide::Client(c) => c.is_handshaking(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            TlsSide::Server(c) => c.wants_read(),
            TlsSide::Client(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsSide::Server(c) => c.wants_write(),
            TlsSide::Client(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, io: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            TlsSide::Server(c) => c.read_tls(io),
            TlsSide::Client(c) => c.read_tls(io),
        }
    }

    fn write_tls(&mut self, io: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            TlsSide::Server(c) => c.write_tls(io),
            TlsSide::Client(c) => c.write_tls(io),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSide::Server(c) => c.process_new_packets(),
            TlsSide::Client(c) => c.process_new_packets(),
        }
    }

    fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        use io::Write;
        match self {
            TlsSide::Server(c) => c.writer().write(buf),
            TlsSide::Client(c) => c.writer().write(buf),
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use io::Read;
        match self {
            TlsSide::Server(c) => c.reader().read(buf),
            TlsSide::Client(c) => c.reader().read(buf),
        }
    }
}

/// One TLS session bound to a socket's fd. Owned by the `Socket` it
/// upgrades; every `send`/`recv` through the socket is routed through here
/// instead of the raw fd once a session is installed.
pub(crate) struct TlsSession {
    side: TlsSide,
}

impl TlsSession {
    pub(crate) fn accept(fd: RawFd, acceptor: &TlsAcceptor) -> RuntimeResult<TlsSession> {
        let conn = rustls::ServerConnection::new(acceptor.config.clone())
            .map_err(|e| RuntimeError::Protocol(format!("failed to start tls server handshake: {e}")))?;
        let mut session = TlsSession { side: TlsSide::Server(conn) };
        session.complete_handshake(fd)?;
        Ok(session)
    }

    pub(crate) fn connect(fd: RawFd, connector: &TlsConnector, server_name: &str) -> RuntimeResult<TlsSession> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| RuntimeError::Protocol(format!("invalid tls server name {server_name:?}: {e}")))?;
        let conn = rustls::ClientConnection::new(connector.config.clone(), name)
            .map_err(|e| RuntimeError::Protocol(format!("failed to start tls client handshake: {e}")))?;
        let mut session = TlsSession { side: TlsSide::Client(conn) };
        session.complete_handshake(fd)?;
        Ok(session)
    }

    /// Drives the record layer until the handshake completes: write pending
    /// ciphertext whenever rustls wants to, read more whenever rustls wants
    /// to, hand new bytes to `process_new_packets`, repeat. Every read/write
    /// here goes through `FdIo`, so a socket with no data ready suspends the
    /// calling task via the same interception path `Socket::send`/`recv` use
    /// — no separate reactor re-arming logic is needed for `WANT_READ`/
    /// `WANT_WRITE`.
    fn complete_handshake(&mut self, fd: RawFd) -> RuntimeResult<()> {
        let mut io = FdIo(fd);
        while self.side.is_handshaking() {
            if self.side.wants_write() {
                self.side.write_tls(&mut io).map_err(RuntimeError::Syscall)?;
            }
            if self.side.wants_read() {
                let n = self.side.read_tls(&mut io).map_err(RuntimeError::Syscall)?;
                if n == 0 {
                    return Err(RuntimeError::NotConnected);
                }
                self.side
                    .process_new_packets()
                    .map_err(|e| RuntimeError::Protocol(format!("tls handshake failed: {e}")))?;
            }
        }
        // The handshake can finish with a final flight still queued for the
        // peer (e.g. the server's session ticket); flush it before handing
        // control back so the first plaintext read/write doesn't race it.
        while self.side.wants_write() {
            self.side.write_tls(&mut io).map_err(RuntimeError::Syscall)?;
        }
        Ok(())
    }

    pub(crate) fn send(&mut self, fd: RawFd, buf: &[u8]) -> RuntimeResult<usize> {
        let n = self.side.write_plaintext(buf).map_err(RuntimeError::Syscall)?;
        let mut io = FdIo(fd);
        while self.side.wants_write() {
            self.side.write_tls(&mut io).map_err(RuntimeError::Syscall)?;
        }
        Ok(n)
    }

    pub(crate) fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> RuntimeResult<usize> {
        let mut io = FdIo(fd);
        loop {
            match self.side.read_plaintext(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(RuntimeError::Syscall(e)),
            }
            if !self.side.wants_read() {
                // No plaintext buffered and rustls has nothing more to read
                // either: the peer has nothing more to say right now.
                return Ok(0);
            }
            let n = self.side.read_tls(&mut io).map_err(RuntimeError::Syscall)?;
            if n == 0 {
                return Ok(0);
            }
            self.side
                .process_new_packets()
                .map_err(|e| RuntimeError::Protocol(format!("tls record error: {e}")))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::socketpair_for_test;
    use std::thread;

    // A fixed self-signed cert/key pair (2048-bit RSA, CN=localhost, valid
    // 100 years) generated once for this test suite so it doesn't depend on
    // a certificate-generation crate or the network at test time.
    const TEST_CERT: &str = include_str!("../../testdata/tls/test_cert.pem");
    const TEST_KEY: &str = include_str!("../../testdata/tls/test_key.pem");

    fn write_temp(contents: &str, suffix: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("imrt-tls-test-{:?}-{suffix}", thread::current().id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_handshake_and_plaintext_roundtrip_over_a_socketpair() {
        let cert_path = write_temp(TEST_CERT, "cert.pem");
        let key_path = write_temp(TEST_KEY, "key.pem");
        let acceptor = TlsAcceptor::from_files(cert_path.to_str().unwrap(), key_path.to_str().unwrap()).unwrap();
        let connector = TlsConnector::with_no_verification().unwrap();

        let (client_sock, server_sock) = socketpair_for_test();
        let client_fd = client_sock.fd();
        let server_fd = server_sock.fd();

        let server_thread = thread::spawn(move || {
            let mut session = TlsSession::accept(server_fd, &acceptor).unwrap();
            let mut buf = [0u8; 64];
            let n = session.recv(server_fd, &mut buf).unwrap();
            session.send(server_fd, &buf[..n]).unwrap();
        });

        let mut client = TlsSession::connect(client_fd, &connector, "localhost").unwrap();
        client.send(client_fd, b"hello over tls").unwrap();
        let mut response = [0u8; 64];
        let n = client.recv(client_fd, &mut response).unwrap();
        assert_eq!(&response[..n], b"hello over tls");

        server_thread.join().unwrap();
        std::fs::remove_file(cert_path).ok();
        std::fs::remove_file(key_path).ok();
    }
}
