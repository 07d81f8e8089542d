// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel control surface.
//!
//! [`Tunnel::start`] takes the promoted TLS socket, binds the local
//! listener and spawns the event-loop thread; the returned handle lets
//! the caller wait for the listener, read the traffic counters and
//! terminate the session.
//!
//! ```no_run
//! use fortitun::config::TunnelConfig;
//! use fortitun::net::Endpoint;
//! use fortitun::tunnel::Tunnel;
//! # fn demo(socket: fortitun::net::TlsSocket) -> fortitun::Result<()> {
//! let tunnel = Tunnel::start(
//!     socket,
//!     Endpoint::new("192.168.1.10", 3389),
//!     0, // let the OS pick the local port
//!     TunnelConfig::default(),
//!     None,
//! )?;
//!
//! let local = tunnel.wait_listening(std::time::Duration::from_secs(30));
//! println!("point your client at {:?}", local);
//!
//! tunnel.terminate();
//! tunnel.join()?;
//! # Ok(())
//! # }
//! ```

pub mod event_loop;
pub mod forwarder;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::net::endpoint::Endpoint;
use crate::net::listener::Listener;
use crate::net::tls::TlsSocket;
use crate::util::Counters;
use event_loop::Tunneler;

// ============================================================================
// Listening event
// ============================================================================

/// One-shot event carrying the listener's bound address. The control
/// thread waits on it; the event loop sets it when the tunnel reaches
/// Running (or cancels it when the loop exits first).
#[derive(Default)]
pub(crate) struct ListeningEvent {
    state: Mutex<ListeningState>,
    cond: Condvar,
}

#[derive(Default)]
struct ListeningState {
    addr: Option<SocketAddr>,
    done: bool,
}

impl ListeningEvent {
    pub(crate) fn set(&self, addr: SocketAddr) {
        let mut state = self.state.lock();
        state.addr = Some(addr);
        state.done = true;
        self.cond.notify_all();
    }

    /// Wake waiters without an address (the tunnel never came up).
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        state.done = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<SocketAddr> {
        let mut state = self.state.lock();
        if !state.done {
            let _ = self.cond.wait_for(&mut state, timeout);
        }
        state.addr
    }

    fn peek(&self) -> Option<SocketAddr> {
        self.state.lock().addr
    }
}

// ============================================================================
// Tunnel handle
// ============================================================================

/// Handle to a running tunnel session.
pub struct Tunnel {
    thread: Option<JoinHandle<Result<()>>>,
    terminate: Arc<AtomicBool>,
    listening: Arc<ListeningEvent>,
    counters: Arc<Counters>,
}

impl Tunnel {
    /// Bind the local listener and start the event-loop thread.
    ///
    /// `socket` must be the TLS carrier already promoted to tunnel mode.
    /// `local_port` 0 asks the OS for an ephemeral port; the assigned
    /// value is surfaced through [`wait_listening`].
    ///
    /// [`wait_listening`]: Tunnel::wait_listening
    pub fn start(
        socket: TlsSocket,
        remote: Endpoint,
        local_port: u16,
        config: TunnelConfig,
        fallback_dns: Option<Ipv4Addr>,
    ) -> Result<Self> {
        let listener = Listener::bind(local_port).map_err(|e| {
            log::error!("listener error on 127.0.0.1:{}: {}", local_port, e);
            Error::Io(e)
        })?;

        let terminate = Arc::new(AtomicBool::new(false));
        let listening = Arc::new(ListeningEvent::default());
        let counters = Counters::new_shared();

        let tunneler = Tunneler::new(
            socket,
            listener,
            remote,
            config,
            fallback_dns,
            Arc::clone(&terminate),
            Arc::clone(&listening),
            Arc::clone(&counters),
        )?;

        let thread = std::thread::Builder::new()
            .name("fortitun-tunnel".to_string())
            .spawn(move || tunneler.run())
            .map_err(Error::Io)?;

        Ok(Self {
            thread: Some(thread),
            terminate,
            listening,
            counters,
        })
    }

    /// Block until the tunnel is listening (returns the bound address)
    /// or `timeout` passes / the tunnel dies (returns `None`).
    pub fn wait_listening(&self, timeout: Duration) -> Option<SocketAddr> {
        self.listening.wait(timeout)
    }

    /// The local endpoint, once listening.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.listening.peek()
    }

    /// Carrier traffic totals as `(sent, received)` bytes.
    pub fn counters(&self) -> (u64, u64) {
        self.counters.snapshot()
    }

    /// Request termination. Idempotent; the loop runs its shutdown
    /// ordering (RST forwarders, close the link) and exits.
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    /// Wait for the event loop to finish and collect its result.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(Error::Io(std::io::Error::other("tunnel thread panicked")))),
            None => Ok(()),
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.terminate();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listening_event_set_and_wait() {
        let event = Arc::new(ListeningEvent::default());
        let waiter = Arc::clone(&event);

        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        event.set("127.0.0.1:4567".parse().unwrap());

        let addr = handle.join().unwrap();
        assert_eq!(addr.unwrap().port(), 4567);
    }

    #[test]
    fn test_listening_event_timeout() {
        let event = ListeningEvent::default();
        let start = std::time::Instant::now();
        assert!(event.wait(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_listening_event_cancel_wakes_without_addr() {
        let event = Arc::new(ListeningEvent::default());
        let waiter = Arc::clone(&event);

        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        event.cancel();

        assert!(handle.join().unwrap().is_none());
    }
}
