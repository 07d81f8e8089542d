// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedded single-threaded IPv4/TCP stack bound to the PPP interface.
//!
//! The stack is a value owned by the tunnel, not a global; several
//! tunnels in one process get one stack each. Everything runs on the
//! event-loop thread: input processing, timers and event delivery are all
//! synchronous calls, and no operation is legal from another thread.
//!
//! ```text
//!             tcp_open/write/close/...        poll_event()
//!                      |                           ^
//!                      v                           |
//!   input(ip) --> +---------------------------------------+
//!                 |  PCB arena (index + generation)       |
//!                 |  DNS resolver  |  ICMP echo           |
//!                 +---------------------------------------+
//!                      |
//!                      v
//!                 take_output()  -- IPv4 packets for the PPP link
//! ```
//!
//! Cross-references use [`PcbHandle`] (slot index plus generation) so a
//! handle left behind by a reaped connection is detected instead of
//! aliasing a new one.
//!
//! Initial sequence numbers, ephemeral ports and DNS query ids come from
//! the platform CSPRNG; predictable values here would make connections
//! spoofable from elsewhere in the VPN.

pub mod dns;
pub mod ipv4;
pub mod tcp;

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ring::rand::{SecureRandom, SystemRandom};

use dns::{DnsError, DnsResolver, DNS_PORT};
use ipv4::{
    build_ipv4, build_udp, icmp_echo_reply, parse_ipv4, parse_udp, PROTO_ICMP, PROTO_TCP,
    PROTO_UDP,
};
use tcp::{build_tcp, parse_tcp, PcbEvent, TcpPcb, WriteError, FLAG_ACK, FLAG_FIN, FLAG_RST, FLAG_SYN};

// ============================================================================
// Constants
// ============================================================================

/// PCB arena ceiling; well above the 32-forwarder limit.
const MAX_PCBS: usize = 64;

/// Bottom of the ephemeral port range.
const EPHEMERAL_MIN: u16 = 49152;

/// IPv4 + TCP fixed header overhead, for MSS derivation.
const IP_TCP_OVERHEAD: usize = 40;

// ============================================================================
// Public types
// ============================================================================

/// Reference to a PCB slot; the generation detects reuse after reaping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PcbHandle {
    index: usize,
    gen: u32,
}

/// Events drained by the tunnel loop and routed to the owning forwarder.
#[derive(Debug, PartialEq, Eq)]
pub enum StackEvent {
    /// TCP event for the PCB behind `handle`.
    Tcp(PcbHandle, PcbEvent),
    /// An asynchronous DNS resolution finished.
    Dns(u32, Result<Ipv4Addr, DnsError>),
}

/// Outcome of starting a resolution.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Answered synchronously (IP literal).
    Ready(Ipv4Addr),
    /// A query is in flight; a [`StackEvent::Dns`] with this token
    /// follows.
    Pending(u32),
}

/// Stack-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// The interface is not configured yet (link not up).
    NotConfigured,
    /// The PCB arena is exhausted.
    NoSlots,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "interface not configured"),
            Self::NoSlots => write!(f, "no free pcb slots"),
        }
    }
}

impl std::error::Error for StackError {}

// ============================================================================
// Stack
// ============================================================================

#[derive(Debug)]
struct Slot {
    gen: u32,
    pcb: Option<TcpPcb>,
}

/// The embedded stack instance.
pub struct NetStack {
    configured: bool,
    addr: Ipv4Addr,
    gateway: Ipv4Addr,
    mss: u16,

    slots: Vec<Slot>,
    dns: DnsResolver,

    events: VecDeque<StackEvent>,
    output: Vec<Vec<u8>>,
    ip_ident: u16,
    rng: SystemRandom,
}

impl NetStack {
    /// An unconfigured stack; [`configure`] it once the link is up.
    ///
    /// [`configure`]: NetStack::configure
    pub fn new() -> Self {
        Self {
            configured: false,
            addr: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            mss: 1460,
            slots: Vec::new(),
            dns: DnsResolver::new(),
            events: VecDeque::new(),
            output: Vec::new(),
            ip_ident: 0,
            rng: SystemRandom::new(),
        }
    }

    /// Bind the interface parameters the PPP link negotiated.
    pub fn configure(
        &mut self,
        addr: Ipv4Addr,
        gateway: Ipv4Addr,
        mtu: usize,
        nameserver: Option<Ipv4Addr>,
    ) {
        self.addr = addr;
        self.gateway = gateway;
        self.mss = (mtu.saturating_sub(IP_TCP_OVERHEAD)).clamp(536, 1460) as u16;
        if let Some(server) = nameserver {
            self.dns.add_server(server);
        }
        self.configured = true;
        log::debug!(
            "stack configured: addr={} gw={} mss={} dns={:?}",
            addr,
            gateway,
            self.mss,
            self.dns.servers()
        );
    }

    /// Append a further nameserver (the IPCP secondary); the resolver
    /// fails over to it when the primary stops answering.
    pub fn add_nameserver(&mut self, server: Ipv4Addr) {
        self.dns.add_server(server);
    }

    /// True once [`configure`] ran.
    ///
    /// [`configure`]: NetStack::configure
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Interface address.
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    // ========================================================================
    // Data plane
    // ========================================================================

    /// Process one IPv4 packet delivered by the PPP link.
    pub fn input(&mut self, packet: &[u8], now: Instant) {
        let Some((header, payload)) = parse_ipv4(packet) else {
            log::trace!("undecodable ip packet dropped");
            return;
        };
        if header.dst != self.addr {
            log::trace!("packet for {} is not ours, dropped", header.dst);
            return;
        }

        match header.protocol {
            PROTO_TCP => self.input_tcp(header.src, payload, now),
            PROTO_UDP => self.input_udp(header.src, payload),
            PROTO_ICMP => {
                if let Some(reply) = icmp_echo_reply(payload) {
                    let packet = self.wrap(header.src, PROTO_ICMP, &reply);
                    self.output.push(packet);
                }
            }
            other => {
                log::trace!("ip protocol {} dropped", other);
            }
        }
    }

    fn input_tcp(&mut self, src: Ipv4Addr, payload: &[u8], now: Instant) {
        let Some(seg) = parse_tcp(src, self.addr, payload) else {
            log::trace!("undecodable tcp segment dropped");
            return;
        };

        let slot = self.slots.iter().position(|slot| {
            slot.pcb.as_ref().is_some_and(|pcb| {
                pcb.local_port() == seg.dst_port && pcb.remote() == (src, seg.src_port)
            })
        });

        match slot {
            Some(index) => {
                if let Some(pcb) = self.slots[index].pcb.as_mut() {
                    pcb.handle_segment(&seg, now);
                }
                self.pump(index, now);
            }
            None => {
                // No matching connection: answer with RST per RFC 793.
                if seg.flags & FLAG_RST != 0 {
                    return;
                }
                let rst = if seg.flags & FLAG_ACK != 0 {
                    build_tcp(
                        self.addr, src, seg.dst_port, seg.src_port, seg.ack, 0, FLAG_RST, 0,
                        None, b"",
                    )
                } else {
                    let mut ack = seg.seq.wrapping_add(seg.payload.len() as u32);
                    if seg.flags & FLAG_SYN != 0 {
                        ack = ack.wrapping_add(1);
                    }
                    if seg.flags & FLAG_FIN != 0 {
                        ack = ack.wrapping_add(1);
                    }
                    build_tcp(
                        self.addr,
                        src,
                        seg.dst_port,
                        seg.src_port,
                        0,
                        ack,
                        FLAG_RST | FLAG_ACK,
                        0,
                        None,
                        b"",
                    )
                };
                let packet = self.wrap(src, PROTO_TCP, &rst);
                self.output.push(packet);
            }
        }
    }

    fn input_udp(&mut self, src: Ipv4Addr, payload: &[u8]) {
        let Some(datagram) = parse_udp(src, self.addr, payload) else {
            return;
        };
        if datagram.src_port != DNS_PORT {
            return;
        }
        if let Some((token, result)) = self.dns.handle_datagram(datagram.dst_port, datagram.payload)
        {
            self.events.push_back(StackEvent::Dns(token, result));
        }
    }

    /// Drain outbound IPv4 packets for the PPP link.
    pub fn take_output(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.output)
    }

    /// Next pending event.
    pub fn poll_event(&mut self) -> Option<StackEvent> {
        self.events.pop_front()
    }

    // ========================================================================
    // TCP user API
    // ========================================================================

    /// Open a connection; the SYN is queued immediately.
    pub fn tcp_open(
        &mut self,
        remote: Ipv4Addr,
        port: u16,
        now: Instant,
    ) -> Result<PcbHandle, StackError> {
        if !self.configured {
            return Err(StackError::NotConfigured);
        }

        let index = match self.slots.iter().position(|s| s.pcb.is_none()) {
            Some(index) => index,
            None if self.slots.len() < MAX_PCBS => {
                self.slots.push(Slot { gen: 0, pcb: None });
                self.slots.len() - 1
            }
            None => return Err(StackError::NoSlots),
        };

        let iss = self.random_u32();
        let local_port = self.alloc_port();
        let pcb = TcpPcb::new(self.addr, local_port, remote, port, iss, self.mss);

        log::debug!(
            "tcp open {}:{} -> {}:{} (slot {})",
            self.addr,
            local_port,
            remote,
            port,
            index
        );
        self.slots[index].pcb = Some(pcb);
        let handle = PcbHandle {
            index,
            gen: self.slots[index].gen,
        };
        self.pump(index, now);
        Ok(handle)
    }

    /// Append payload to the connection's send buffer.
    ///
    /// `more = true` marks that further data follows immediately, so
    /// segments may coalesce without PSH. Emission happens on the spot;
    /// `Full` asks the caller to retry after a `Sent` event.
    pub fn tcp_write(
        &mut self,
        handle: PcbHandle,
        data: &[u8],
        more: bool,
        now: Instant,
    ) -> Result<usize, WriteError> {
        let Some(pcb) = self.pcb_mut(handle) else {
            return Err(WriteError::Closed);
        };
        let n = pcb.write(data, more)?;
        self.pump(handle.index, now);
        Ok(n)
    }

    /// Force out pending segments with PSH.
    pub fn tcp_flush(&mut self, handle: PcbHandle, now: Instant) {
        if let Some(pcb) = self.pcb_mut(handle) {
            pcb.flush();
            self.pump(handle.index, now);
        }
    }

    /// Begin an orderly close.
    pub fn tcp_close(&mut self, handle: PcbHandle, now: Instant) {
        if let Some(pcb) = self.pcb_mut(handle) {
            pcb.close();
            self.pump(handle.index, now);
        }
    }

    /// Send RST and free the PCB immediately.
    pub fn tcp_abort(&mut self, handle: PcbHandle, _now: Instant) {
        let Some(pcb) = self.pcb_mut(handle) else {
            return;
        };
        let (remote_ip, _) = pcb.remote();
        if let Some(rst) = pcb.abort() {
            let packet = self.wrap(remote_ip, PROTO_TCP, &rst);
            self.output.push(packet);
        }
        self.free_slot(handle.index);
    }

    /// Grow the receive window after the user consumed `n` bytes.
    pub fn tcp_recved(&mut self, handle: PcbHandle, n: usize, now: Instant) {
        if let Some(pcb) = self.pcb_mut(handle) {
            pcb.recved(n);
            self.pump(handle.index, now);
        }
    }

    /// True while the send buffer has room (false for stale handles).
    pub fn can_accept_payload(&self, handle: PcbHandle) -> bool {
        self.pcb(handle).is_some_and(TcpPcb::can_accept_payload)
    }

    /// True while unsent payload or a queued FIN is pending.
    pub fn has_unsent(&self, handle: PcbHandle) -> bool {
        self.pcb(handle).is_some_and(TcpPcb::has_unsent)
    }

    /// True while the handle refers to a live PCB.
    pub fn is_alive(&self, handle: PcbHandle) -> bool {
        self.pcb(handle).is_some()
    }

    // ========================================================================
    // DNS user API
    // ========================================================================

    /// Install a fallback nameserver from configuration; the
    /// IPCP-provided ones (set via [`configure`]) win.
    ///
    /// [`configure`]: NetStack::configure
    pub fn set_fallback_dns(&mut self, server: Ipv4Addr) {
        if !self.dns.configured() {
            self.dns.add_server(server);
        }
    }

    /// Resolve a name inside the tunnel.
    pub fn dns_resolve(&mut self, name: &str, now: Instant) -> Result<Resolution, DnsError> {
        if let Ok(literal) = name.parse::<Ipv4Addr>() {
            return Ok(Resolution::Ready(literal));
        }
        if !self.configured {
            return Err(DnsError::NotConfigured);
        }
        let Some(server) = self.dns.server() else {
            return Err(DnsError::NotConfigured);
        };

        let id = (self.random_u32() & 0xFFFF) as u16;
        let src_port = self.alloc_port();
        let (token, payload) = self.dns.start(name, id, src_port, now)?;

        let datagram = build_udp(self.addr, server, src_port, DNS_PORT, &payload);
        let packet = self.wrap(server, PROTO_UDP, &datagram);
        self.output.push(packet);
        Ok(Resolution::Pending(token))
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Run every due timer (retransmission, TimeWait, DNS retry).
    pub fn poll_timers(&mut self, now: Instant) {
        for index in 0..self.slots.len() {
            if let Some(pcb) = self.slots[index].pcb.as_mut() {
                pcb.on_timer(now);
                self.pump(index, now);
            }
        }

        let (retransmit, expired) = self.dns.on_timer(now);
        for (_token, payload, src_port, server) in retransmit {
            let datagram = build_udp(self.addr, server, src_port, DNS_PORT, &payload);
            let packet = self.wrap(server, PROTO_UDP, &datagram);
            self.output.push(packet);
        }
        for token in expired {
            self.events
                .push_back(StackEvent::Dns(token, Err(DnsError::ServerUnreachable)));
        }
    }

    /// Time until the next scheduled timer, if any. The event loop must
    /// not sleep past this.
    pub fn sleep_time(&self, now: Instant) -> Option<Duration> {
        let mut next: Option<Instant> = None;
        for slot in &self.slots {
            if let Some(deadline) = slot.pcb.as_ref().and_then(TcpPcb::next_deadline) {
                next = Some(next.map_or(deadline, |n| n.min(deadline)));
            }
        }
        if let Some(deadline) = self.dns.next_deadline() {
            next = Some(next.map_or(deadline, |n| n.min(deadline)));
        }
        next.map(|deadline| deadline.saturating_duration_since(now))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn pcb(&self, handle: PcbHandle) -> Option<&TcpPcb> {
        let slot = self.slots.get(handle.index)?;
        if slot.gen != handle.gen {
            return None;
        }
        slot.pcb.as_ref()
    }

    fn pcb_mut(&mut self, handle: PcbHandle) -> Option<&mut TcpPcb> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.gen != handle.gen {
            return None;
        }
        slot.pcb.as_mut()
    }

    /// Emit segments, publish events, reap the slot when terminal.
    fn pump(&mut self, index: usize, now: Instant) {
        let Some(pcb) = self.slots[index].pcb.as_mut() else {
            return;
        };
        let (remote_ip, _) = pcb.remote();
        let segments = pcb.emit(now);

        let mut events = Vec::new();
        while let Some(event) = pcb.poll_event() {
            events.push(event);
        }
        let closed = pcb.is_closed();

        for segment in segments {
            let packet = self.wrap(remote_ip, PROTO_TCP, &segment);
            self.output.push(packet);
        }

        let handle = PcbHandle {
            index,
            gen: self.slots[index].gen,
        };
        for event in events {
            self.events.push_back(StackEvent::Tcp(handle, event));
        }

        if closed {
            self.free_slot(index);
        }
    }

    fn free_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if slot.pcb.take().is_some() {
            slot.gen = slot.gen.wrapping_add(1);
        }
    }

    fn wrap(&mut self, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
        self.ip_ident = self.ip_ident.wrapping_add(1);
        build_ipv4(self.addr, dst, protocol, self.ip_ident, payload)
    }

    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        if self.rng.fill(&mut bytes).is_err() {
            // SystemRandom failing is effectively unheard of; fall back to
            // a time-derived value rather than panicking mid-session.
            return std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0x5EED_5EED, |d| d.subsec_nanos());
        }
        u32::from_be_bytes(bytes)
    }

    fn alloc_port(&self) -> u16 {
        loop {
            let candidate = EPHEMERAL_MIN + (self.random_u32() % 16384) as u16;
            let tcp_used = self.slots.iter().any(|slot| {
                slot.pcb
                    .as_ref()
                    .is_some_and(|pcb| pcb.local_port() == candidate)
            });
            let dns_used = self.dns.ports_in_use().any(|p| p == candidate);
            if !tcp_used && !dns_used {
                return candidate;
            }
        }
    }
}

impl Default for NetStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetStack")
            .field("configured", &self.configured)
            .field("addr", &self.addr)
            .field("live_pcbs", &self.slots.iter().filter(|s| s.pcb.is_some()).count())
            .field("queued_output", &self.output.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
