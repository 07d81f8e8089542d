// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Port forwarder: one external TCP connection bridged to one in-tunnel
//! TCP connection.
//!
//! ```text
//!  external socket --recv--> forward queue --tcp_write--> PCB (tunnel)
//!  external socket <--send-- reply queue  <--Received---- PCB (tunnel)
//! ```
//!
//! # State machine
//!
//! ```text
//!  Ready --accept+dns--> Connecting --connected--> Connected
//!    |                       |  \                     |
//!    |                 (dns fail) (connect timer)  (either side EOF,
//!    v                       v        v             disconnect())
//!  Failed <---------------- Failed  Disconnecting <---+
//!                                      |
//!                        (queues drained or flush timers)
//!                                      v
//!                                 Disconnected
//! ```
//!
//! Both queues are bounded at 16 chunks of one external read each; the
//! event loop only selects the external socket for read while the
//! forward queue has room, and for write while the reply queue holds
//! data. `forwarded_bytes` counts bytes handed to the stack but not yet
//! acknowledged, which lets shutdown distinguish "drained" from "queue
//! empty but still un-acked".

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use crate::config::TunnelConfig;
use crate::net::endpoint::Endpoint;
use crate::stack::tcp::{PcbEvent, WriteError};
use crate::stack::{NetStack, PcbHandle, Resolution};
use crate::util::ChunkQueue;

// ============================================================================
// Constants
// ============================================================================

/// One external read per tick.
const READ_CHUNK: usize = 2048;

/// Chunk bound per queue.
const QUEUE_CHUNKS: usize = 16;

/// Byte capacity backing the chunk bound.
const QUEUE_CAPACITY: usize = QUEUE_CHUNKS * READ_CHUNK;

/// Budget for draining a queue after one side went away.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// State
// ============================================================================

/// Forwarder lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwarderState {
    /// Constructed, nothing started.
    Ready,
    /// DNS and/or TCP connect in flight.
    Connecting,
    /// Both sides open, data moving.
    Connected,
    /// One side gone; draining queues.
    Disconnecting,
    /// Done; resources released, ready to be reaped.
    Disconnected,
    /// DNS or connect failure; terminal.
    Failed,
}

impl ForwarderState {
    /// Reapable states.
    pub fn is_terminal(self) -> bool {
        matches!(self, ForwarderState::Disconnected | ForwarderState::Failed)
    }
}

/// One bridged connection.
pub struct Forwarder {
    state: ForwarderState,
    socket: TcpStream,
    peer: SocketAddr,
    remote: Endpoint,

    pcb: Option<PcbHandle>,
    dns_token: Option<u32>,

    /// external -> internal
    forward_queue: ChunkQueue,
    /// internal -> external
    reply_queue: ChunkQueue,

    /// Bytes handed to `tcp_write` and not yet acknowledged.
    forwarded_bytes: usize,

    /// External socket still usable for writes.
    external_open: bool,

    connect_deadline: Option<Instant>,
    forward_flush_deadline: Option<Instant>,
    reply_flush_deadline: Option<Instant>,

    connect_timeout: Duration,
}

impl Forwarder {
    /// Wrap an accepted external connection and start the internal
    /// connect: DNS first, then `tcp_open` on resolution.
    pub fn open(
        socket: TcpStream,
        peer: SocketAddr,
        remote: Endpoint,
        config: &TunnelConfig,
        stack: &mut NetStack,
        now: Instant,
    ) -> Self {
        let mut forwarder = Self {
            state: ForwarderState::Ready,
            socket,
            peer,
            remote,
            pcb: None,
            dns_token: None,
            forward_queue: ChunkQueue::new(QUEUE_CAPACITY),
            reply_queue: ChunkQueue::new(QUEUE_CAPACITY),
            forwarded_bytes: 0,
            external_open: true,
            connect_deadline: None,
            forward_flush_deadline: None,
            reply_flush_deadline: None,
            connect_timeout: config.connect_timeout(),
        };

        forwarder.configure_socket(config);
        forwarder.start_connect(stack, now);
        forwarder
    }

    fn configure_socket(&mut self, config: &TunnelConfig) {
        if config.tcp_nodelay {
            if let Err(e) = self.socket.set_nodelay(true) {
                log::warn!("set_nodelay failed: {}", e);
            }
        }
        if let Some(interval) = config.keep_alive() {
            let sock = socket2::SockRef::from(&self.socket);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(interval)
                .with_interval(interval);
            if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
                log::warn!("set_tcp_keepalive failed: {}", e);
            }
        }
    }

    fn start_connect(&mut self, stack: &mut NetStack, now: Instant) {
        log::debug!("forwarder for {} connecting to {}", self.peer, self.remote);
        self.connect_deadline = Some(now + self.connect_timeout);

        match stack.dns_resolve(self.remote.host(), now) {
            Ok(Resolution::Ready(addr)) => {
                self.state = ForwarderState::Connecting;
                self.open_pcb(addr, stack, now);
            }
            Ok(Resolution::Pending(token)) => {
                self.state = ForwarderState::Connecting;
                self.dns_token = Some(token);
            }
            Err(e) => {
                log::error!("cannot resolve {}: {}", self.remote.host(), e);
                self.fail();
            }
        }
    }

    fn open_pcb(&mut self, addr: std::net::Ipv4Addr, stack: &mut NetStack, now: Instant) {
        match stack.tcp_open(addr, self.remote.port(), now) {
            Ok(handle) => self.pcb = Some(handle),
            Err(e) => {
                log::error!("tcp open to {} failed: {}", self.remote, e);
                self.fail();
            }
        }
    }

    fn fail(&mut self) {
        self.state = ForwarderState::Failed;
        self.connect_deadline = None;
        self.forward_queue.clear();
        self.reply_queue.clear();
    }

    // ========================================================================
    // Getters / readiness predicates
    // ========================================================================

    /// Current state.
    pub fn state(&self) -> ForwarderState {
        self.state
    }

    /// PCB handle, while one is allocated.
    pub fn pcb_handle(&self) -> Option<PcbHandle> {
        self.pcb
    }

    /// Pending DNS token, while resolution is in flight.
    pub fn dns_token(&self) -> Option<u32> {
        self.dns_token
    }

    /// External peer address (for logs).
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Mutable socket access for poll registration.
    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Bytes written to the stack and not yet acknowledged.
    pub fn forwarded_bytes(&self) -> usize {
        self.forwarded_bytes
    }

    /// Select the external socket for read? Only while connected and the
    /// forward queue has a free chunk slot.
    pub fn can_receive_data(&self) -> bool {
        self.state == ForwarderState::Connected
            && self.forward_queue.chunk_count() < QUEUE_CHUNKS
    }

    /// Select the external socket for write? Whenever replies wait and
    /// the socket is still writable.
    pub fn has_data_to_reply(&self) -> bool {
        matches!(
            self.state,
            ForwarderState::Connected | ForwarderState::Disconnecting
        ) && self.external_open
            && !self.reply_queue.is_empty()
    }

    // ========================================================================
    // External socket servicing
    // ========================================================================

    /// The external socket is readable: read in bounded chunks until the
    /// socket runs dry or the forward queue fills. Draining fully
    /// matters with an edge-triggered poll; the queue bound still
    /// suspends reading under backpressure (the socket is then dropped
    /// from the read set until a chunk drains).
    pub fn handle_readable(&mut self, stack: &mut NetStack, now: Instant) {
        while self.can_receive_data() {
            let mut buf = [0u8; READ_CHUNK];
            match self.socket.read(&mut buf) {
                Ok(0) => {
                    log::debug!("external peer {} closed", self.peer);
                    self.external_eof(stack, now);
                    return;
                }
                Ok(n) => {
                    if !self.forward_queue.push(buf[..n].to_vec()) {
                        // can_receive_data keeps this from happening;
                        // losing external bytes would corrupt the stream.
                        log::error!("forward queue overflow, disconnecting {}", self.peer);
                        self.external_eof(stack, now);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("external read error from {}: {}", self.peer, e);
                    self.external_eof(stack, now);
                    return;
                }
            }
        }
    }

    /// The external socket is writable: drain the reply queue.
    pub fn handle_writable(&mut self, stack: &mut NetStack, now: Instant) {
        if !self.has_data_to_reply() {
            return;
        }

        let mut delivered = 0usize;
        let mut error = false;

        loop {
            let outcome = {
                let Some(block) = self.reply_queue.peek(usize::MAX) else {
                    break;
                };
                self.socket.write(block.data)
            };

            match outcome {
                Ok(0) => {
                    error = true;
                    break;
                }
                Ok(n) => {
                    self.reply_queue.advance(n);
                    delivered += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("external write error to {}: {}", self.peer, e);
                    error = true;
                    break;
                }
            }
        }

        // The window grows only as replies actually leave towards the
        // external client.
        if delivered > 0 {
            if let Some(pcb) = self.pcb {
                stack.tcp_recved(pcb, delivered, now);
            }
        }

        if error {
            self.external_eof(stack, now);
        }
    }

    /// External side is gone: close the internal connection gracefully
    /// and keep draining replies for a bounded time. A half-closed
    /// external peer can still receive them; a write error finishes the
    /// job early.
    fn external_eof(&mut self, stack: &mut NetStack, now: Instant) {
        match self.state {
            ForwarderState::Connected => {
                self.state = ForwarderState::Disconnecting;
                if let Some(pcb) = self.pcb.take() {
                    stack.tcp_close(pcb, now);
                }
                self.reply_flush_deadline = Some(now + FLUSH_TIMEOUT);
            }
            ForwarderState::Connecting => {
                // The client gave up before the tunnel side came up.
                if let Some(pcb) = self.pcb.take() {
                    stack.tcp_abort(pcb, now);
                }
                self.fail();
            }
            ForwarderState::Disconnecting => {
                self.external_open = false;
                self.reply_queue.clear();
            }
            _ => {}
        }
    }

    // ========================================================================
    // Internal (stack) side
    // ========================================================================

    /// Route one PCB event from the stack.
    pub fn on_pcb_event(&mut self, event: PcbEvent, stack: &mut NetStack, now: Instant) {
        match event {
            PcbEvent::Connected => {
                if self.state == ForwarderState::Connecting {
                    log::debug!("{} connected to {}", self.peer, self.remote);
                    self.state = ForwarderState::Connected;
                    self.connect_deadline = None;
                }
            }

            PcbEvent::Received(data) => {
                if !self.external_open {
                    // Nowhere to reply to; release the window and move on.
                    if let Some(pcb) = self.pcb {
                        stack.tcp_recved(pcb, data.len(), now);
                    }
                    return;
                }
                let len = data.len();
                if !self.reply_queue.push(data) {
                    // The receive window is sized below the queue
                    // capacity, so this indicates accounting gone wrong.
                    log::error!("reply queue overflow ({} bytes), aborting", len);
                    self.abort(stack, now);
                }
            }

            PcbEvent::Sent(n) => {
                self.forwarded_bytes = self.forwarded_bytes.saturating_sub(n);
            }

            PcbEvent::PeerClosed => {
                if self.state == ForwarderState::Connected {
                    log::debug!("{} closed by remote", self.remote);
                    self.state = ForwarderState::Disconnecting;
                    self.forward_flush_deadline = Some(now + FLUSH_TIMEOUT);
                }
            }

            PcbEvent::Closed => {
                self.pcb = None;
                self.forward_queue.clear();
                if self.state == ForwarderState::Connected {
                    self.state = ForwarderState::Disconnecting;
                }
            }

            PcbEvent::Error(fault) => {
                match self.state {
                    ForwarderState::Connecting => {
                        log::error!("connect to {} failed: {:?}", self.remote, fault);
                        self.pcb = None;
                        self.fail();
                    }
                    ForwarderState::Connected | ForwarderState::Disconnecting => {
                        log::debug!("{} errored: {:?}", self.remote, fault);
                        self.pcb = None;
                        self.forward_queue.clear();
                        self.state = ForwarderState::Disconnecting;
                    }
                    _ => {
                        self.pcb = None;
                    }
                }
            }
        }
    }

    /// Route a DNS completion. A forwarder that already failed (connect
    /// timer during resolution) ignores it.
    pub fn on_dns(&mut self, token: u32, result: Result<std::net::Ipv4Addr, crate::stack::dns::DnsError>, stack: &mut NetStack, now: Instant) {
        if self.dns_token != Some(token) {
            return;
        }
        self.dns_token = None;

        if self.state != ForwarderState::Connecting {
            // Late callback after a timeout or teardown: no-op.
            return;
        }

        match result {
            Ok(addr) => self.open_pcb(addr, stack, now),
            Err(e) => {
                log::error!("cannot resolve {}: {}", self.remote.host(), e);
                self.fail();
            }
        }
    }

    /// Push forward-queue data into the stack while the send buffer has
    /// room. Runs every tick from the event loop.
    pub fn forward(&mut self, stack: &mut NetStack, now: Instant) {
        let Some(pcb) = self.pcb else {
            return;
        };
        if !matches!(
            self.state,
            ForwarderState::Connected | ForwarderState::Disconnecting
        ) {
            return;
        }

        let mut wrote = false;
        loop {
            if !stack.can_accept_payload(pcb) {
                break;
            }
            let (data, more) = {
                let Some(block) = self.forward_queue.peek(usize::MAX) else {
                    break;
                };
                (block.data.to_vec(), block.more)
            };

            match stack.tcp_write(pcb, &data, more, now) {
                Ok(n) => {
                    self.forward_queue.advance(n);
                    self.forwarded_bytes += n;
                    wrote = true;
                    if n < data.len() {
                        break;
                    }
                }
                Err(WriteError::Full) => break,
                Err(WriteError::Closed) => {
                    self.forward_queue.clear();
                    break;
                }
            }
        }

        if wrote && self.forward_queue.is_empty() {
            stack.tcp_flush(pcb, now);
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Explicit disconnect; same path as an external EOF. Idempotent.
    pub fn disconnect(&mut self, stack: &mut NetStack, now: Instant) {
        if self.state == ForwarderState::Connected {
            self.external_eof(stack, now);
        }
    }

    /// Abort with RST; used during tunnel shutdown.
    pub fn abort(&mut self, stack: &mut NetStack, now: Instant) {
        if let Some(pcb) = self.pcb.take() {
            stack.tcp_abort(pcb, now);
        }
        self.forward_queue.clear();
        self.reply_queue.clear();
        if !self.state.is_terminal() {
            self.state = ForwarderState::Disconnecting;
        }
    }

    /// Timers and terminal-state detection; runs every tick.
    pub fn tick(&mut self, stack: &mut NetStack, now: Instant) {
        match self.state {
            ForwarderState::Connecting => {
                if self.connect_deadline.is_some_and(|d| now >= d) {
                    log::error!("timeout connecting to {}", self.remote);
                    self.connect_deadline = None;
                    if let Some(pcb) = self.pcb.take() {
                        stack.tcp_abort(pcb, now);
                        self.state = ForwarderState::Disconnecting;
                    } else {
                        // Still waiting on DNS: fail outright; the late
                        // callback will find the state changed.
                        self.fail();
                    }
                }
            }

            ForwarderState::Disconnecting => {
                if self.forward_flush_deadline.is_some_and(|d| now >= d) {
                    self.forward_flush_deadline = None;
                    self.forward_queue.clear();
                }
                if self.reply_flush_deadline.is_some_and(|d| now >= d) {
                    self.reply_flush_deadline = None;
                    self.reply_queue.clear();
                }

                // Forward side finished: close the internal connection
                // once everything queued went into the stack.
                if self.forward_queue.is_empty() {
                    if let Some(pcb) = self.pcb.take() {
                        stack.tcp_close(pcb, now);
                    }
                }

                if self.forward_queue.is_empty() && self.reply_queue.is_empty() {
                    log::debug!("forwarder for {} disconnected", self.peer);
                    self.release();
                }
            }

            _ => {}
        }
    }

    /// Earliest pending deadline, for the loop's poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.connect_deadline,
            self.forward_flush_deadline,
            self.reply_flush_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn release(&mut self) {
        self.state = ForwarderState::Disconnected;
        self.connect_deadline = None;
        self.forward_flush_deadline = None;
        self.reply_flush_deadline = None;
        self.forward_queue.clear();
        self.reply_queue.clear();
        // The socket itself is dropped with the forwarder when reaped.
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("peer", &self.peer)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("forward_queued", &self.forward_queue.len())
            .field("reply_queued", &self.reply_queue.len())
            .field("forwarded_bytes", &self.forwarded_bytes)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ipv4::{build_ipv4, parse_ipv4, PROTO_TCP};
    use crate::stack::tcp::{
        build_tcp, parse_tcp, FLAG_ACK, FLAG_PSH, FLAG_RST, FLAG_SYN,
    };
    use crate::stack::StackEvent;
    use std::net::Ipv4Addr;

    const OUR: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
    const GW: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 1);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    /// A connected local socket pair: (mio stream for the forwarder,
    /// std stream playing the external client).
    fn socket_pair() -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (TcpStream::from_std(accepted), peer, client)
    }

    fn make_stack() -> NetStack {
        let mut stack = NetStack::new();
        stack.configure(OUR, GW, 1400, None);
        stack
    }

    fn make_forwarder(stack: &mut NetStack, now: Instant) -> (Forwarder, std::net::TcpStream) {
        let (stream, peer, client) = socket_pair();
        let forwarder = Forwarder::open(
            stream,
            peer,
            Endpoint::new("192.168.1.10", 3389),
            &TunnelConfig::default(),
            stack,
            now,
        );
        (forwarder, client)
    }

    /// Connection facts captured while establishing the PCB.
    struct Established {
        /// The PCB's local (tunnel-side) port, from its SYN.
        port: u16,
        /// Sequence the peer sends next (its ISS + 1).
        peer_seq: u32,
        /// Acknowledgment number the peer uses (our ISS + 1).
        peer_ack: u32,
    }

    /// Answer the forwarder's SYN so its PCB reaches Established, then
    /// route the Connected event.
    fn establish(forwarder: &mut Forwarder, stack: &mut NetStack, now: Instant) -> Established {
        let out = stack.take_output();
        assert_eq!(out.len(), 1);
        let (_, payload) = parse_ipv4(&out[0]).unwrap();
        let syn = parse_tcp(OUR, REMOTE, payload).unwrap();
        assert_eq!(syn.flags & FLAG_SYN, FLAG_SYN);

        let synack = build_tcp(
            REMOTE,
            OUR,
            3389,
            syn.src_port,
            7000,
            syn.seq.wrapping_add(1),
            FLAG_SYN | FLAG_ACK,
            8192,
            Some(1460),
            b"",
        );
        stack.input(&build_ipv4(REMOTE, OUR, PROTO_TCP, 1, &synack), now);

        route_events(forwarder, stack, now);
        assert_eq!(forwarder.state(), ForwarderState::Connected);
        let _ = stack.take_output(); // the handshake-completing ACK

        Established {
            port: syn.src_port,
            peer_seq: 7001,
            peer_ack: syn.seq.wrapping_add(1),
        }
    }

    fn route_events(forwarder: &mut Forwarder, stack: &mut NetStack, now: Instant) {
        let mut events = Vec::new();
        while let Some(event) = stack.poll_event() {
            events.push(event);
        }
        for event in events {
            match event {
                StackEvent::Tcp(_, event) => forwarder.on_pcb_event(event, stack, now),
                StackEvent::Dns(token, result) => forwarder.on_dns(token, result, stack, now),
            }
        }
    }

    #[test]
    fn test_open_with_ip_literal_goes_connecting() {
        let now = Instant::now();
        let mut stack = make_stack();
        let (forwarder, _client) = make_forwarder(&mut stack, now);

        assert_eq!(forwarder.state(), ForwarderState::Connecting);
        assert!(forwarder.pcb_handle().is_some());
        assert!(forwarder.dns_token().is_none());
        // A SYN left through the stack.
        assert_eq!(stack.take_output().len(), 1);
    }

    #[test]
    fn test_connected_after_synack() {
        let now = Instant::now();
        let mut stack = make_stack();
        let (mut forwarder, _client) = make_forwarder(&mut stack, now);
        let _ = establish(&mut forwarder, &mut stack, now);
        assert!(forwarder.can_receive_data());
    }

    #[test]
    fn test_external_bytes_forwarded_into_stack() {
        use std::io::Write as _;

        let now = Instant::now();
        let mut stack = make_stack();
        let (mut forwarder, mut client) = make_forwarder(&mut stack, now);
        let _ = establish(&mut forwarder, &mut stack, now);

        // The RDP connection-request prefix.
        client.write_all(&[0x03, 0x00, 0x00]).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        forwarder.handle_readable(&mut stack, now);
        forwarder.forward(&mut stack, now);

        let out = stack.take_output();
        assert!(!out.is_empty());
        let (_, payload) = parse_ipv4(&out[0]).unwrap();
        let seg = parse_tcp(OUR, REMOTE, payload).unwrap();
        assert_eq!(seg.payload, &[0x03, 0x00, 0x00]);
        assert_eq!(seg.flags & FLAG_PSH, FLAG_PSH);
        assert_eq!(forwarder.forwarded_bytes(), 3);
    }

    #[test]
    fn test_replies_reach_external_socket_and_grow_window() {
        use std::io::Read as _;

        let now = Instant::now();
        let mut stack = make_stack();
        let (mut forwarder, mut client) = make_forwarder(&mut stack, now);
        let conn = establish(&mut forwarder, &mut stack, now);

        let data = build_tcp(
            REMOTE,
            OUR,
            3389,
            conn.port,
            conn.peer_seq,
            conn.peer_ack,
            FLAG_ACK | FLAG_PSH,
            8192,
            None,
            b"server says hi",
        );
        stack.input(&build_ipv4(REMOTE, OUR, PROTO_TCP, 2, &data), now);
        route_events(&mut forwarder, &mut stack, now);

        assert!(forwarder.has_data_to_reply());
        forwarder.handle_writable(&mut stack, now);

        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"server says hi");
        assert!(!forwarder.has_data_to_reply());
    }

    #[test]
    fn test_external_eof_disconnects_gracefully() {
        let now = Instant::now();
        let mut stack = make_stack();
        let (mut forwarder, client) = make_forwarder(&mut stack, now);
        let _ = establish(&mut forwarder, &mut stack, now);

        drop(client); // external peer closes
        std::thread::sleep(Duration::from_millis(50));
        forwarder.handle_readable(&mut stack, now);

        assert_eq!(forwarder.state(), ForwarderState::Disconnecting);
        // The stack got a close: a FIN should be on the wire.
        let out = stack.take_output();
        assert!(!out.is_empty());

        // With queues empty the next tick releases everything.
        forwarder.tick(&mut stack, now);
        assert_eq!(forwarder.state(), ForwarderState::Disconnected);
        assert!(forwarder.state().is_terminal());
    }

    #[test]
    fn test_connect_timer_during_dns_fails_and_late_dns_is_noop() {
        let now = Instant::now();
        let mut stack = NetStack::new();
        stack.configure(OUR, GW, 1400, Some(Ipv4Addr::new(10, 8, 0, 53)));

        let (stream, peer, _client) = socket_pair();
        let mut forwarder = Forwarder::open(
            stream,
            peer,
            Endpoint::new("slow.internal", 3389),
            &TunnelConfig::default(),
            &mut stack,
            now,
        );
        assert_eq!(forwarder.state(), ForwarderState::Connecting);
        let token = forwarder.dns_token().unwrap();

        // Connect timer fires while DNS is still out.
        forwarder.tick(&mut stack, now + Duration::from_secs(11));
        assert_eq!(forwarder.state(), ForwarderState::Failed);

        // The late callback must not allocate or mutate anything.
        forwarder.on_dns(token, Ok(REMOTE), &mut stack, now + Duration::from_secs(12));
        assert_eq!(forwarder.state(), ForwarderState::Failed);
        assert!(forwarder.pcb_handle().is_none());
    }

    #[test]
    fn test_internal_reset_tears_down() {
        let now = Instant::now();
        let mut stack = make_stack();
        let (mut forwarder, _client) = make_forwarder(&mut stack, now);
        let conn = establish(&mut forwarder, &mut stack, now);

        let rst = build_tcp(
            REMOTE, OUR, 3389, conn.port, conn.peer_seq, 0, FLAG_RST, 0, None, b"",
        );
        stack.input(&build_ipv4(REMOTE, OUR, PROTO_TCP, 3, &rst), now);
        route_events(&mut forwarder, &mut stack, now);

        assert_eq!(forwarder.state(), ForwarderState::Disconnecting);
        forwarder.tick(&mut stack, now);
        assert_eq!(forwarder.state(), ForwarderState::Disconnected);
    }

    #[test]
    fn test_abort_for_shutdown() {
        let now = Instant::now();
        let mut stack = make_stack();
        let (mut forwarder, _client) = make_forwarder(&mut stack, now);
        let _ = establish(&mut forwarder, &mut stack, now);

        forwarder.abort(&mut stack, now);
        // The RST is queued for the wire.
        let out = stack.take_output();
        assert_eq!(out.len(), 1);
        let (_, payload) = parse_ipv4(&out[0]).unwrap();
        let seg = parse_tcp(OUR, REMOTE, payload).unwrap();
        assert_eq!(seg.flags & FLAG_RST, FLAG_RST);

        forwarder.tick(&mut stack, now);
        assert_eq!(forwarder.state(), ForwarderState::Disconnected);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let now = Instant::now();
        let mut stack = make_stack();
        let (mut forwarder, _client) = make_forwarder(&mut stack, now);
        let _ = establish(&mut forwarder, &mut stack, now);

        forwarder.disconnect(&mut stack, now);
        assert_eq!(forwarder.state(), ForwarderState::Disconnecting);
        forwarder.disconnect(&mut stack, now);
        assert_eq!(forwarder.state(), ForwarderState::Disconnecting);
    }
}
