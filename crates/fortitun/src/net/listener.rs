// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local loopback listener for external clients.
//!
//! Binds `127.0.0.1:port` (port 0 asks the OS for an ephemeral port; the
//! assigned value is what the `listening` event reports). SO_REUSEADDR is
//! deliberately left off so a second instance cannot squat the port;
//! SO_EXCLUSIVEADDRUSE would be preferable where available but is not
//! portable.

use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

/// Pending-connection backlog; the event loop gates accepts itself, the
/// kernel queue only has to absorb bursts.
const LISTEN_BACKLOG: i32 = 16;

/// Non-blocking loopback TCP listener.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to `127.0.0.1:port` without SO_REUSEADDR.
    pub fn bind(port: u16) -> io::Result<Self> {
        let addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], port));

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr()?;
        let inner = TcpListener::from_std(std_listener);

        log::debug!("listener bound on {}", local_addr);
        Ok(Self { inner, local_addr })
    }

    /// The bound address, with the OS-assigned port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one pending connection; `None` when none is queued.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.inner.accept() {
            Ok((stream, peer)) => Ok(Some((stream, peer))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Mutable access for poll registration.
    pub fn source(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = Listener::bind(0).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert!(listener.local_addr().ip().is_loopback());
    }

    #[test]
    fn test_accept_returns_none_without_client() {
        let listener = Listener::bind(0).unwrap();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn test_accept_pending_connection() {
        let listener = Listener::bind(0).unwrap();
        let addr = listener.local_addr();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        // The connect completes against the kernel queue; poll briefly for
        // the accept side to observe it.
        let mut accepted = None;
        for _ in 0..50 {
            if let Some(pair) = listener.accept().unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let (_stream, peer) = accepted.expect("no connection accepted");
        assert!(peer.ip().is_loopback());
    }

    #[test]
    fn test_second_bind_same_port_fails() {
        let listener = Listener::bind(0).unwrap();
        let port = listener.local_addr().port();

        // No SO_REUSEADDR: the port is exclusively held.
        assert!(Listener::bind(port).is_err());
    }
}
