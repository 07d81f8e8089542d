// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Non-blocking TLS client socket for the tunnel carrier.
//!
//! One [`TlsSocket`] carries the whole session: HTTP during login, framed
//! PPP after tunnel promotion. It is operated in two styles:
//!
//! - **blocking style** during login: [`TlsSocket::send_all`] and
//!   [`TlsSocket::recv_some`] park on a private poll until the socket is
//!   ready or a deadline passes;
//! - **non-blocking style** on the event loop: [`TlsSocket::recv`] and
//!   [`TlsSocket::send`] never block and return [`IoStatus::Retry`] to
//!   request a readiness wait.
//!
//! Call [`TlsSocket::detach_waiter`] before handing the socket to the event
//! loop; after that the stream belongs to the loop's poll and the blocking
//! helpers are unavailable.
//!
//! # Certificate policy
//!
//! Verification runs against the bundled `webpki-roots` anchors plus an
//! optional user CA bundle. When the verifier rejects the chain, a
//! user-supplied callback receives the DER chain and an error bitmask and
//! may override the rejection; decisions are cached by leaf fingerprint so
//! a reconnect does not re-prompt. The SHA-256 fingerprint of the leaf is
//! frozen when the socket reaches `Ready` and must match on every
//! reconnect of the carrier (the portal client enforces this).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, ClientConnection, RootCertStore};

use crate::config::TlsSettings;
use crate::error::{Error, Result};
use crate::net::endpoint::Endpoint;

// ============================================================================
// Constants
// ============================================================================

/// Token for the private readiness poll (single registration).
const WAIT_TOKEN: Token = Token(0);

/// Upper bound on plaintext buffered inside rustls before backpressure.
const TLS_BUFFER_LIMIT: usize = 64 * 1024;

/// Attempts to flush a close_notify before giving up.
const CLOSE_NOTIFY_ATTEMPTS: usize = 8;

/// Verify bitmask bits handed to the confirmation callback.
pub const CERT_EXPIRED: u32 = 0x0001;
/// Certificate revoked.
pub const CERT_REVOKED: u32 = 0x0002;
/// Certificate does not match the firewall host name.
pub const CERT_NAME_MISMATCH: u32 = 0x0004;
/// Chain does not end in a configured trust anchor.
pub const CERT_NOT_TRUSTED: u32 = 0x0008;
/// Any other verification failure.
pub const CERT_OTHER: u32 = 0x0100;

// ============================================================================
// Public result types
// ============================================================================

/// Readiness a suspended operation is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Want {
    /// The socket must become readable.
    Read,
    /// The socket must become writable.
    Write,
}

/// Outcome of a non-blocking `recv`/`send`.
#[derive(Debug, PartialEq, Eq)]
pub enum IoStatus {
    /// `n` bytes were transferred.
    Done(usize),
    /// Nothing happened; retry once the socket is ready.
    Retry(Want),
    /// The peer closed the connection.
    Eof,
}

/// Lifecycle phase of the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No connection.
    Closed,
    /// TCP connect in progress.
    Connecting,
    /// TLS handshake in progress.
    Handshaking,
    /// Operational.
    Ready,
    /// close_notify issued.
    Closing,
}

/// Certificate confirmation callback.
///
/// Receives the presented chain (leaf first) and the verify bitmask; a
/// `true` return accepts the chain despite the failure.
pub type ConfirmCert = Arc<dyn Fn(&[CertificateDer<'static>], u32) -> bool + Send + Sync>;

// ============================================================================
// Verifier
// ============================================================================

/// State shared between the verifier (inside rustls) and the socket.
#[derive(Default)]
struct VerifyShared {
    /// Bitmask of the last verification (0 = clean).
    mask: AtomicU32,

    /// The callback (or its absence) rejected the chain.
    declined: AtomicBool,

    /// Cached verdicts by leaf SHA-256, so reconnects do not re-prompt.
    decisions: Mutex<HashMap<[u8; 32], bool>>,
}

/// Delegates to the webpki verifier and consults the user callback on
/// failure.
struct OverrideVerifier {
    inner: Arc<WebPkiServerVerifier>,
    confirm: Option<ConfirmCert>,
    check_hostname: bool,
    shared: Arc<VerifyShared>,
}

impl std::fmt::Debug for VerifyShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyShared")
            .field("mask", &self.mask.load(Ordering::Relaxed))
            .finish()
    }
}

impl std::fmt::Debug for OverrideVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverrideVerifier")
            .field("check_hostname", &self.check_hostname)
            .field("has_confirm", &self.confirm.is_some())
            .finish()
    }
}

/// Map a rustls verification error onto the callback bitmask.
fn verify_bitmask(err: &rustls::Error) -> u32 {
    match err {
        rustls::Error::InvalidCertificate(cert_err) => match cert_err {
            CertificateError::Expired | CertificateError::NotValidYet => CERT_EXPIRED,
            CertificateError::Revoked => CERT_REVOKED,
            CertificateError::NotValidForName
            | CertificateError::NotValidForNameContext { .. } => CERT_NAME_MISMATCH,
            CertificateError::UnknownIssuer => CERT_NOT_TRUSTED,
            _ => CERT_OTHER,
        },
        _ => CERT_OTHER,
    }
}

/// SHA-256 over a DER certificate.
pub fn sha256_fingerprint(der: &[u8]) -> [u8; 32] {
    let digest = ring::digest::digest(&ring::digest::SHA256, der);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

impl ServerCertVerifier for OverrideVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let outcome = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );

        let err = match outcome {
            Ok(verified) => {
                self.shared.mask.store(0, Ordering::Relaxed);
                return Ok(verified);
            }
            Err(err) => err,
        };

        let mask = verify_bitmask(&err);
        self.shared.mask.store(mask, Ordering::Relaxed);

        // Name mismatch alone is acceptable when host-name binding was
        // switched off at construction.
        if mask == CERT_NAME_MISMATCH && !self.check_hostname {
            return Ok(ServerCertVerified::assertion());
        }

        let fingerprint = sha256_fingerprint(end_entity.as_ref());
        if let Some(&verdict) = self.shared.decisions.lock().get(&fingerprint) {
            if verdict {
                return Ok(ServerCertVerified::assertion());
            }
            self.shared.declined.store(true, Ordering::Relaxed);
            return Err(err);
        }

        let Some(confirm) = &self.confirm else {
            self.shared.declined.store(true, Ordering::Relaxed);
            return Err(err);
        };

        let mut chain: Vec<CertificateDer<'static>> =
            Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.clone().into_owned());
        chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));

        let accepted = confirm(&chain, mask);
        self.shared.decisions.lock().insert(fingerprint, accepted);

        if accepted {
            log::warn!("certificate accepted by override (mask=0x{:04x})", mask);
            Ok(ServerCertVerified::assertion())
        } else {
            self.shared.declined.store(true, Ordering::Relaxed);
            Err(err)
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Builds [`TlsSocket`]s from one certificate policy.
///
/// Kept around for the session so carrier reconnects reuse the same
/// configuration and decision cache.
#[derive(Clone, Debug)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
    shared: Arc<VerifyShared>,
}

impl TlsConnector {
    /// Build a connector from the TLS settings and an optional certificate
    /// confirmation callback.
    pub fn new(settings: &TlsSettings, confirm: Option<ConfirmCert>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &settings.ca_file {
            let pem = std::fs::read(path)?;
            let mut reader = io::BufReader::new(pem.as_slice());
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert?;
                roots
                    .add(cert)
                    .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            }
            log::info!("trust anchors loaded from {}", path.display());
        }

        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let shared = Arc::new(VerifyShared::default());
        let verifier = Arc::new(OverrideVerifier {
            inner,
            confirm,
            check_hostname: settings.check_hostname,
            shared: Arc::clone(&shared),
        });

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
            shared,
        })
    }

    /// Connect and handshake within `timeout`.
    pub fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<TlsSocket> {
        let deadline = Instant::now() + timeout;
        let addr = endpoint.resolve()?;

        log::debug!("connecting to {} ({})", endpoint, addr);
        self.shared.declined.store(false, Ordering::Relaxed);

        let stream = TcpStream::connect(addr)?;
        let server_name = ServerName::try_from(endpoint.host().to_string())
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let mut conn = ClientConnection::new(Arc::clone(&self.config), server_name)?;
        conn.set_buffer_limit(Some(TLS_BUFFER_LIMIT));

        let mut socket = TlsSocket {
            stream,
            conn,
            phase: Phase::Connecting,
            waiter: Some(Waiter::new()?),
            peer_addr: addr,
            fingerprint: None,
            verify_mask: 0,
        };

        socket.finish_connect(deadline)?;
        socket.handshake(deadline).map_err(|e| {
            if self.shared.declined.load(Ordering::Relaxed) {
                Error::CertificateUntrusted
            } else {
                e
            }
        })?;

        socket.verify_mask = self.shared.mask.load(Ordering::Relaxed);
        log::info!(
            "tls ready: version={} cipher={}",
            socket.version().unwrap_or_else(|| "?".into()),
            socket.cipher().unwrap_or_else(|| "?".into()),
        );
        Ok(socket)
    }
}

// ============================================================================
// Readiness waiter
// ============================================================================

/// Private poll used for deadline waits while the socket is operated in
/// blocking style. Dropped (via `detach_waiter`) before the event loop
/// takes over the stream.
#[derive(Debug)]
struct Waiter {
    poll: Poll,
    events: Events,
    registered: bool,
}

impl Waiter {
    fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(4),
            registered: false,
        })
    }

    /// Park until the stream is ready for `want` or `timeout` passes.
    /// Returns false on timeout.
    fn wait(&mut self, stream: &mut TcpStream, want: Want, timeout: Duration) -> io::Result<bool> {
        let interest = match want {
            Want::Read => Interest::READABLE,
            Want::Write => Interest::WRITABLE,
        };

        if self.registered {
            self.poll.registry().reregister(stream, WAIT_TOKEN, interest)?;
        } else {
            self.poll.registry().register(stream, WAIT_TOKEN, interest)?;
            self.registered = true;
        }

        self.events.clear();
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(!self.events.is_empty())
    }
}

// ============================================================================
// Socket
// ============================================================================

/// The TLS carrier socket.
pub struct TlsSocket {
    stream: TcpStream,
    conn: ClientConnection,
    phase: Phase,
    waiter: Option<Waiter>,
    peer_addr: SocketAddr,
    fingerprint: Option<[u8; 32]>,
    verify_mask: u32,
}

impl TlsSocket {
    // ========================================================================
    // Getters
    // ========================================================================

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Negotiated cipher suite; only while Ready.
    pub fn cipher(&self) -> Option<String> {
        if self.phase != Phase::Ready {
            return None;
        }
        self.conn
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }

    /// Negotiated protocol version; only while Ready.
    pub fn version(&self) -> Option<String> {
        if self.phase != Phase::Ready {
            return None;
        }
        self.conn.protocol_version().map(|v| format!("{:?}", v))
    }

    /// Peer certificate chain (DER, leaf first); only while Ready.
    pub fn peer_certs(&self) -> Option<&[CertificateDer<'static>]> {
        if self.phase != Phase::Ready {
            return None;
        }
        self.conn.peer_certificates()
    }

    /// SHA-256 of the leaf certificate, frozen at handshake completion.
    pub fn fingerprint(&self) -> Option<[u8; 32]> {
        self.fingerprint
    }

    /// Verify bitmask frozen at handshake completion (0 = clean chain).
    pub fn verify_mask(&self) -> u32 {
        self.verify_mask
    }

    /// Mutable stream access for event-loop poll registration.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Drop the private poll; the stream is the event loop's from now on.
    pub fn detach_waiter(&mut self) {
        self.waiter = None;
    }

    // ========================================================================
    // Connect / handshake
    // ========================================================================

    fn wait(&mut self, want: Want, timeout: Duration) -> Result<bool> {
        let waiter = self
            .waiter
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::other("waiter detached")))?;
        Ok(waiter.wait(&mut self.stream, want, timeout)?)
    }

    fn remaining(deadline: Instant, what: &'static str) -> Result<Duration> {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(what));
        }
        Ok(deadline - now)
    }

    /// Wait out the non-blocking TCP connect.
    fn finish_connect(&mut self, deadline: Instant) -> Result<()> {
        loop {
            let timeout = Self::remaining(deadline, "tcp connect")?;
            self.wait(Want::Write, timeout)?;

            if let Some(err) = self.stream.take_error()? {
                return Err(Error::Io(err));
            }
            match self.stream.peer_addr() {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => continue,
                Err(e) if e.raw_os_error() == Some(libc_einprogress()) => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.phase = Phase::Handshaking;
        Ok(())
    }

    /// Drive the TLS handshake to completion before `deadline`.
    fn handshake(&mut self, deadline: Instant) -> Result<()> {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut self.stream) {
                    Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        let timeout = Self::remaining(deadline, "tls handshake")?;
                        self.wait(Want::Write, timeout)?;
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
                continue;
            }

            let timeout = Self::remaining(deadline, "tls handshake")?;
            self.wait(Want::Read, timeout)?;
            match self.conn.read_tls(&mut self.stream) {
                Ok(0) => return Err(Error::Io(io::ErrorKind::UnexpectedEof.into())),
                Ok(_) => {
                    self.conn.process_new_packets().map_err(Error::Tls)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        // Flush whatever the handshake still has queued (session tickets,
        // finished message).
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let timeout = Self::remaining(deadline, "tls handshake")?;
                    self.wait(Want::Write, timeout)?;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        self.phase = Phase::Ready;
        self.fingerprint = self
            .conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|leaf| sha256_fingerprint(leaf.as_ref()));
        Ok(())
    }

    // ========================================================================
    // Non-blocking I/O (event loop)
    // ========================================================================

    /// Non-blocking read of decrypted bytes.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<IoStatus> {
        match self.read_plaintext(buf) {
            PlainRead::Data(n) => return Ok(IoStatus::Done(n)),
            PlainRead::Closed => return Ok(IoStatus::Eof),
            PlainRead::Empty => {}
        }

        match self.conn.read_tls(&mut self.stream) {
            Ok(0) => return Ok(IoStatus::Eof),
            Ok(_) => {
                self.conn.process_new_packets().map_err(Error::Tls)?;
                // Alerts and key updates may want a write back.
                self.flush_tls_writes()?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(IoStatus::Retry(Want::Read));
            }
            Err(e) => return Err(Error::Io(e)),
        }

        match self.read_plaintext(buf) {
            PlainRead::Data(n) => Ok(IoStatus::Done(n)),
            PlainRead::Closed => Ok(IoStatus::Eof),
            PlainRead::Empty => Ok(IoStatus::Retry(Want::Read)),
        }
    }

    /// Non-blocking write of plaintext bytes.
    ///
    /// `Done(n)` reports how much was accepted; the TLS records are pushed
    /// towards the kernel as far as the socket allows.
    pub fn send(&mut self, buf: &[u8]) -> Result<IoStatus> {
        // Push pending records first so the buffer limit frees up.
        if !self.flush_tls_writes()? && self.conn.wants_write() {
            return Ok(IoStatus::Retry(Want::Write));
        }

        let n = self
            .conn
            .writer()
            .write(buf)
            .map_err(|e| Error::Io(e))?;
        if n == 0 {
            return Ok(IoStatus::Retry(Want::Write));
        }

        self.flush_tls_writes()?;
        Ok(IoStatus::Done(n))
    }

    /// True when rustls still holds records waiting for a writable socket.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Write queued TLS records until done or the socket pushes back.
    /// Returns true when nothing remains queued.
    fn flush_tls_writes(&mut self) -> Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.stream) {
                Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(true)
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> PlainRead {
        match self.conn.reader().read(buf) {
            Ok(0) => PlainRead::Closed,
            Ok(n) => PlainRead::Data(n),
            Err(_) => PlainRead::Empty,
        }
    }

    // ========================================================================
    // Blocking-style I/O (login path)
    // ========================================================================

    /// Write all of `data`, parking on readiness, within `timeout`.
    pub fn send_all(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut offset = 0;

        while offset < data.len() {
            match self.send(&data[offset..])? {
                IoStatus::Done(n) => offset += n,
                IoStatus::Retry(want) => {
                    let timeout = Self::remaining(deadline, "tls send")?;
                    self.wait(want, timeout)?;
                }
                IoStatus::Eof => {
                    return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
                }
            }
        }
        Ok(())
    }

    /// Read some decrypted bytes, parking on readiness, within `timeout`.
    /// Returns 0 on a clean peer close.
    pub fn recv_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.recv(buf)? {
                IoStatus::Done(n) => return Ok(n),
                IoStatus::Eof => return Ok(0),
                IoStatus::Retry(want) => {
                    let timeout = Self::remaining(deadline, "tls recv")?;
                    if !self.wait(want, timeout)? {
                        return Err(Error::Timeout("tls recv"));
                    }
                }
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Graceful shutdown: send close_notify, retrying through a bounded
    /// number of write suspensions.
    pub fn close_notify(&mut self) {
        if self.phase != Phase::Ready {
            return;
        }
        self.phase = Phase::Closing;
        self.conn.send_close_notify();

        for _ in 0..CLOSE_NOTIFY_ATTEMPTS {
            match self.conn.write_tls(&mut self.stream) {
                Ok(_) if !self.conn.wants_write() => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.waiter.is_some() {
                        let _ = self.wait(Want::Write, Duration::from_millis(100));
                    } else {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        self.phase = Phase::Closed;
    }
}

enum PlainRead {
    Data(usize),
    Empty,
    Closed,
}

impl Drop for TlsSocket {
    fn drop(&mut self) {
        // Graceful if Ready, abort otherwise (the stream drop resets).
        if self.phase == Phase::Ready {
            self.close_notify();
        }
    }
}

impl std::fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("peer_addr", &self.peer_addr)
            .field("phase", &self.phase)
            .field("verify_mask", &self.verify_mask)
            .finish()
    }
}

/// EINPROGRESS differs per platform; `peer_addr` may surface it while the
/// connect is still pending.
fn libc_einprogress() -> i32 {
    #[cfg(unix)]
    {
        115 // Linux EINPROGRESS; BSDs use 36 but report NotConnected instead
    }
    #[cfg(not(unix))]
    {
        10036 // WSAEINPROGRESS
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_bitmask_mapping() {
        let err = rustls::Error::InvalidCertificate(CertificateError::Expired);
        assert_eq!(verify_bitmask(&err), CERT_EXPIRED);

        let err = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        assert_eq!(verify_bitmask(&err), CERT_NOT_TRUSTED);

        let err = rustls::Error::InvalidCertificate(CertificateError::NotValidForName);
        assert_eq!(verify_bitmask(&err), CERT_NAME_MISMATCH);

        let err = rustls::Error::General("boom".into());
        assert_eq!(verify_bitmask(&err), CERT_OTHER);
    }

    #[test]
    fn test_sha256_fingerprint_known_vector() {
        // SHA-256("abc")
        let fp = sha256_fingerprint(b"abc");
        assert_eq!(
            fp[..4],
            [0xba, 0x78, 0x16, 0xbf],
        );
        assert_eq!(fp.len(), 32);
    }

    #[test]
    fn test_connector_builds_with_bundled_roots() {
        let connector = TlsConnector::new(&TlsSettings::strict(), None);
        assert!(connector.is_ok());
    }

    #[test]
    fn test_connect_refused_maps_to_io_error() {
        let connector = TlsConnector::new(&TlsSettings::strict(), None).unwrap();
        // Port 1 on loopback is almost certainly closed; accept either a
        // refused error or a timeout.
        let result = connector.connect(
            &Endpoint::new("127.0.0.1", 1),
            Duration::from_millis(500),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_decision_cache_prevents_reprompt() {
        let shared = VerifyShared::default();
        shared.decisions.lock().insert([7u8; 32], true);
        assert_eq!(shared.decisions.lock().get(&[7u8; 32]), Some(&true));
    }
}
