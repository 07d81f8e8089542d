// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PPP link driving LCP and IPCP to the open state.
//!
//! The Fortigate speaks plain PPP inside the framed TLS stream. This
//! module owns both control protocols and the framed output queue:
//!
//! ```text
//!      input bytes              output frames
//!          |                          ^
//!          v                          |
//!   +-------------+           +-------------+
//!   | FrameDecoder|           |  ChunkQueue |
//!   +------+------+           +------+------+
//!          |                         ^
//!          v                         |
//!   +-----------------------------------------+
//!   |   LCP fsm  ->  IPCP fsm  ->  LinkUp     |
//!   |   keep-alive / terminate / echo reply   |
//!   +-----------------------------------------+
//!          |
//!          v
//!     IPv4 payloads (to the embedded stack)
//! ```
//!
//! # Fortinet constraints
//!
//! The peer completes negotiation only when ACCM, protocol-field
//! compression and address/control compression are absent from our
//! Configure-Request; the request carries the Magic-Number option and
//! nothing else. IPCP requests 0.0.0.0 for the address and for both
//! RFC 1877 nameserver options and adopts whatever the Configure-Nak
//! supplies; a rejected nameserver option is simply dropped from the
//! retry.
//!
//! # Keep-alive
//!
//! While the network phase is up, 60 s of transmit silence triggers an
//! LCP Discard-Request. The peer silently discards it; an Echo-Request
//! would be tolerated just as well, the only point is to keep traffic
//! on the wire.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ring::rand::{SecureRandom, SystemRandom};

use crate::ppp::frame::{self, FrameDecoder, FramingError};
use crate::ppp::packet::{
    code, encode_control, encode_option, encode_ppp, ipcp_opt, lcp_opt, parse_control, parse_ppp,
    ConfOption, OptionIter, PROTO_IPCP, PROTO_IPV4, PROTO_LCP,
};
use crate::util::ChunkQueue;

// ============================================================================
// Constants
// ============================================================================

/// Restart timer for configure/terminate retransmission.
const RESTART_INTERVAL: Duration = Duration::from_secs(3);

/// Configure-Request attempts before declaring negotiation failed.
const MAX_CONFIGURE: u32 = 10;

/// Terminate-Request attempts before forcing the link dead.
const MAX_TERMINATE: u32 = 2;

/// Transmit silence that triggers a keep-alive.
const KEEPALIVE_SILENCE: Duration = Duration::from_secs(60);

/// Capacity of the framed output queue.
const OUT_QUEUE_CAPACITY: usize = 32 * 1024;

/// Default MTU when the peer does not announce an MRU.
const DEFAULT_MTU: usize = 1500;

// ============================================================================
// Public types
// ============================================================================

/// PPP phases (RFC 1661 §3.2; no authentication on this link).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PppPhase {
    /// Link not started or fully torn down.
    Dead,
    /// LCP negotiating.
    Establish,
    /// LCP open, IPCP negotiating or open.
    Network,
    /// Terminate-Request sent, waiting for the Ack.
    Terminate,
}

/// Parameters of an established network phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkUp {
    /// Address assigned to this side.
    pub addr: Ipv4Addr,
    /// Peer (gateway) address from its Configure-Request.
    pub gateway: Ipv4Addr,
    /// Primary nameserver supplied by IPCP, if any.
    pub dns: Option<Ipv4Addr>,
    /// Secondary nameserver supplied by IPCP, if any.
    pub dns2: Option<Ipv4Addr>,
    /// Usable MTU for IP packets on the link.
    pub mtu: usize,
}

/// Link lifecycle events drained by the tunnel loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// IPCP completed; the interface is usable.
    Up(LinkUp),
    /// The link reached a terminal state.
    Down(&'static str),
}

/// PPP-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PppError {
    /// Malformed or unexpected control traffic.
    Protocol(&'static str),
    /// LCP or IPCP did not converge.
    NegotiationFailed,
}

impl fmt::Display for PppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(what) => write!(f, "protocol violation: {}", what),
            Self::NegotiationFailed => write!(f, "negotiation failed"),
        }
    }
}

impl std::error::Error for PppError {}

// ============================================================================
// Negotiation sub-machine
// ============================================================================

/// Per-protocol negotiation state (RFC 1661 §4.2, reduced to the states a
/// client on a fresh link can reach).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NegState {
    /// Not started.
    Closed,
    /// Our request is out, peer's not yet seen.
    ReqSent,
    /// Our request acked, peer's not yet seen.
    AckRcvd,
    /// Peer's request acked, ours still outstanding.
    AckSent,
    /// Both directions agreed.
    Opened,
    /// Shut down (by peer terminate or failure).
    Stopped,
}

#[derive(Debug)]
struct Negotiation {
    state: NegState,
    /// Identifier of our outstanding Configure-Request.
    id: u8,
    /// Configure-Request transmissions so far.
    retries: u32,
    /// Retransmit deadline while a request is outstanding.
    deadline: Option<Instant>,
}

impl Negotiation {
    fn new() -> Self {
        Self {
            state: NegState::Closed,
            id: 0,
            retries: 0,
            deadline: None,
        }
    }

    fn is_open(&self) -> bool {
        self.state == NegState::Opened
    }

    /// Our request is still awaiting an Ack.
    fn request_outstanding(&self) -> bool {
        matches!(self.state, NegState::ReqSent | NegState::AckSent)
    }
}

// ============================================================================
// Link
// ============================================================================

/// The PPP link: framing, LCP, IPCP, keep-alive, output queue.
pub struct PppLink {
    phase: PppPhase,
    decoder: FrameDecoder,
    out_queue: ChunkQueue,
    dropped_frames: u64,
    last_transmit: Instant,

    /// Our LCP magic number.
    magic: [u8; 4],
    next_id: u8,

    lcp: Negotiation,
    ipcp: Negotiation,

    term_retries: u32,
    term_deadline: Option<Instant>,

    /// Peer's announced MRU, bounding our MTU.
    peer_mru: Option<u16>,

    /// Address/DNS we are asking for (0.0.0.0 until a Nak teaches us).
    requested_addr: Ipv4Addr,
    requested_dns: Ipv4Addr,
    requested_dns2: Ipv4Addr,
    dns_rejected: bool,
    dns2_rejected: bool,

    /// Peer address learned from its Configure-Request.
    peer_addr: Ipv4Addr,

    events: VecDeque<LinkEvent>,
}

impl PppLink {
    /// Create a link in phase Dead.
    pub fn new(now: Instant) -> Self {
        let mut magic = [0u8; 4];
        // A zero magic is reserved; an all-zero fill from a broken RNG
        // would also be rejected by the peer.
        if SystemRandom::new().fill(&mut magic).is_err() || magic == [0; 4] {
            magic = [0xA5, 0x5A, 0x3C, 0xC3];
        }

        Self {
            phase: PppPhase::Dead,
            decoder: FrameDecoder::new(),
            out_queue: ChunkQueue::new(OUT_QUEUE_CAPACITY),
            dropped_frames: 0,
            last_transmit: now,
            magic,
            next_id: 0,
            lcp: Negotiation::new(),
            ipcp: Negotiation::new(),
            term_retries: 0,
            term_deadline: None,
            peer_mru: None,
            requested_addr: Ipv4Addr::UNSPECIFIED,
            requested_dns: Ipv4Addr::UNSPECIFIED,
            requested_dns2: Ipv4Addr::UNSPECIFIED,
            dns_rejected: false,
            dns2_rejected: false,
            peer_addr: Ipv4Addr::UNSPECIFIED,
            events: VecDeque::new(),
        }
    }

    // ========================================================================
    // Getters
    // ========================================================================

    /// Current PPP phase.
    pub fn phase(&self) -> PppPhase {
        self.phase
    }

    /// True when IPCP is open and IPv4 may flow.
    pub fn is_up(&self) -> bool {
        self.phase == PppPhase::Network && self.ipcp.is_open()
    }

    /// True when the link reached its terminal phase.
    pub fn dead(&self) -> bool {
        self.phase == PppPhase::Dead
    }

    /// Frames dropped because the output queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Framed bytes awaiting transmission.
    pub fn out_queue(&mut self) -> &mut ChunkQueue {
        &mut self.out_queue
    }

    /// True when the output queue holds data for the carrier.
    pub fn must_transmit(&self) -> bool {
        !self.out_queue.is_empty()
    }

    /// Next pending lifecycle event.
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start LCP negotiation.
    pub fn open(&mut self, now: Instant) {
        if self.phase != PppPhase::Dead {
            return;
        }
        log::debug!("ppp link opening");
        self.phase = PppPhase::Establish;
        self.lcp.state = NegState::ReqSent;
        self.send_lcp_request(now);
    }

    /// Begin graceful shutdown: Terminate-Request, then wait for the Ack.
    /// Idempotent while terminating.
    pub fn close(&mut self, now: Instant) {
        match self.phase {
            PppPhase::Dead | PppPhase::Terminate => {}
            _ => {
                log::debug!("ppp link closing");
                self.phase = PppPhase::Terminate;
                self.term_retries = 1;
                self.term_deadline = Some(now + RESTART_INTERVAL);
                let id = self.take_id();
                self.enqueue(PROTO_LCP, &encode_control(code::TERMINATE_REQUEST, id, b""), now);
            }
        }
    }

    // ========================================================================
    // Input
    // ========================================================================

    /// Feed decrypted carrier bytes; returns the IPv4 payloads addressed
    /// to the embedded stack. Framing violations are fatal.
    pub fn input(&mut self, data: &[u8], now: Instant) -> Result<Vec<Vec<u8>>, FramingError> {
        let payloads = self.decoder.feed(data)?;
        let mut ipv4 = Vec::new();

        for payload in payloads {
            let Some(packet) = parse_ppp(&payload) else {
                log::warn!("ppp packet without ff03 prefix, dropped");
                continue;
            };

            match packet.protocol {
                PROTO_LCP => self.handle_lcp(packet.payload, now),
                PROTO_IPCP => self.handle_ipcp(packet.payload, now),
                PROTO_IPV4 => {
                    if self.is_up() {
                        ipv4.push(packet.payload.to_vec());
                    } else {
                        log::trace!("ipv4 before link up, dropped");
                    }
                }
                other => {
                    log::debug!("rejecting unknown ppp protocol 0x{:04x}", other);
                    if self.lcp.is_open() {
                        let mut data = other.to_be_bytes().to_vec();
                        data.extend_from_slice(packet.payload);
                        let id = self.take_id();
                        self.enqueue(
                            PROTO_LCP,
                            &encode_control(code::PROTOCOL_REJECT, id, &data),
                            now,
                        );
                    }
                }
            }
        }

        Ok(ipv4)
    }

    /// Queue one IPv4 packet for transmission. Returns false when the
    /// link is not up or the output queue is full (the packet is dropped;
    /// TCP-level flow control recovers user data).
    pub fn send_ipv4(&mut self, packet: &[u8], now: Instant) -> bool {
        if !self.is_up() {
            return false;
        }
        self.enqueue(PROTO_IPV4, packet, now)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Run retransmission and keep-alive timers.
    pub fn tick(&mut self, now: Instant) {
        // Terminate retransmission.
        if self.phase == PppPhase::Terminate {
            if let Some(deadline) = self.term_deadline {
                if now >= deadline {
                    if self.term_retries >= MAX_TERMINATE {
                        log::warn!("terminate-ack never arrived, forcing link down");
                        self.link_down("terminate timeout");
                    } else {
                        self.term_retries += 1;
                        self.term_deadline = Some(now + RESTART_INTERVAL);
                        let id = self.take_id();
                        self.enqueue(
                            PROTO_LCP,
                            &encode_control(code::TERMINATE_REQUEST, id, b""),
                            now,
                        );
                    }
                }
            }
            return;
        }

        // Configure-Request retransmission.
        if self.lcp.request_outstanding() {
            if let Some(deadline) = self.lcp.deadline {
                if now >= deadline {
                    if self.lcp.retries >= MAX_CONFIGURE {
                        log::error!("lcp negotiation failed after {} attempts", MAX_CONFIGURE);
                        self.link_down("lcp negotiation failed");
                        return;
                    }
                    self.send_lcp_request(now);
                }
            }
        }
        if self.ipcp.request_outstanding() {
            if let Some(deadline) = self.ipcp.deadline {
                if now >= deadline {
                    if self.ipcp.retries >= MAX_CONFIGURE {
                        log::error!("ipcp negotiation failed after {} attempts", MAX_CONFIGURE);
                        self.link_down("ipcp negotiation failed");
                        return;
                    }
                    self.send_ipcp_request(now);
                }
            }
        }

        // Keep-alive on transmit silence.
        if self.phase == PppPhase::Network
            && self.lcp.is_open()
            && now.duration_since(self.last_transmit) > KEEPALIVE_SILENCE
        {
            log::trace!("keep-alive discard-request");
            let id = self.take_id();
            let magic = self.magic;
            self.enqueue(
                PROTO_LCP,
                &encode_control(code::DISCARD_REQUEST, id, &magic),
                now,
            );
        }
    }

    /// Earliest deadline the event loop must wake for.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let mut next: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(d) = deadline {
                next = Some(next.map_or(d, |n| n.min(d)));
            }
        };

        consider(self.lcp.deadline);
        consider(self.ipcp.deadline);
        consider(self.term_deadline);
        if self.phase == PppPhase::Network && self.lcp.is_open() {
            consider(Some(self.last_transmit + KEEPALIVE_SILENCE));
        }

        next.map(|d| d.saturating_duration_since(now))
    }

    // ========================================================================
    // LCP
    // ========================================================================

    fn send_lcp_request(&mut self, now: Instant) {
        // Magic-Number only. ACCM, address/control compression and
        // protocol-field compression must stay un-negotiated or the
        // Fortigate never completes.
        let mut options = Vec::new();
        let magic = self.magic;
        encode_option(lcp_opt::MAGIC_NUMBER, &magic, &mut options);

        let id = self.take_id();
        self.lcp.id = id;
        self.lcp.retries += 1;
        self.lcp.deadline = Some(now + RESTART_INTERVAL);
        self.enqueue(
            PROTO_LCP,
            &encode_control(code::CONFIGURE_REQUEST, id, &options),
            now,
        );
    }

    fn handle_lcp(&mut self, payload: &[u8], now: Instant) {
        let Some(packet) = parse_control(payload) else {
            log::warn!("malformed lcp packet, dropped");
            return;
        };

        match packet.code {
            code::CONFIGURE_REQUEST => {
                let mut iter = OptionIter::new(packet.data);
                let options: Vec<ConfOption<'_>> = iter.by_ref().collect();
                if iter.malformed() {
                    log::warn!("malformed lcp options, request dropped");
                    return;
                }

                let rejected: Vec<&ConfOption<'_>> = options
                    .iter()
                    .filter(|o| !matches!(o.kind, lcp_opt::MRU | lcp_opt::MAGIC_NUMBER))
                    .collect();

                if !rejected.is_empty() {
                    let mut data = Vec::new();
                    for option in rejected {
                        encode_option(option.kind, option.data, &mut data);
                    }
                    self.enqueue(
                        PROTO_LCP,
                        &encode_control(code::CONFIGURE_REJECT, packet.id, &data),
                        now,
                    );
                    return;
                }

                for option in &options {
                    if option.kind == lcp_opt::MRU && option.data.len() == 2 {
                        self.peer_mru =
                            Some(u16::from_be_bytes([option.data[0], option.data[1]]));
                    }
                }

                self.enqueue(
                    PROTO_LCP,
                    &encode_control(code::CONFIGURE_ACK, packet.id, packet.data),
                    now,
                );

                match self.lcp.state {
                    NegState::ReqSent => self.lcp.state = NegState::AckSent,
                    NegState::AckRcvd => {
                        self.lcp.state = NegState::Opened;
                        self.lcp_up(now);
                    }
                    _ => {}
                }
            }

            code::CONFIGURE_ACK => {
                if packet.id != self.lcp.id {
                    log::debug!("lcp ack with stale id {}, ignored", packet.id);
                    return;
                }
                self.lcp.deadline = None;
                match self.lcp.state {
                    NegState::ReqSent => self.lcp.state = NegState::AckRcvd,
                    NegState::AckSent => {
                        self.lcp.state = NegState::Opened;
                        self.lcp_up(now);
                    }
                    _ => {}
                }
            }

            code::CONFIGURE_NAK | code::CONFIGURE_REJECT => {
                if packet.id != self.lcp.id {
                    return;
                }
                // The only thing we ask for is the magic; a Nak means a
                // collision, so pick a fresh one and retry.
                if packet.code == code::CONFIGURE_NAK {
                    let _ = SystemRandom::new().fill(&mut self.magic);
                }
                self.send_lcp_request(now);
            }

            code::TERMINATE_REQUEST => {
                self.enqueue(
                    PROTO_LCP,
                    &encode_control(code::TERMINATE_ACK, packet.id, b""),
                    now,
                );
                log::info!("peer terminated the ppp link");
                self.link_down("terminated by peer");
            }

            code::TERMINATE_ACK => {
                if self.phase == PppPhase::Terminate {
                    self.link_down("closed");
                }
            }

            code::ECHO_REQUEST => {
                if self.lcp.is_open() {
                    let mut data = self.magic.to_vec();
                    if packet.data.len() > 4 {
                        data.extend_from_slice(&packet.data[4..]);
                    }
                    self.enqueue(
                        PROTO_LCP,
                        &encode_control(code::ECHO_REPLY, packet.id, &data),
                        now,
                    );
                }
            }

            code::ECHO_REPLY | code::DISCARD_REQUEST => {}

            code::CODE_REJECT | code::PROTOCOL_REJECT => {
                log::debug!("peer rejected code/protocol (lcp code {})", packet.code);
            }

            other => {
                let id = self.take_id();
                self.enqueue(PROTO_LCP, &encode_control(code::CODE_REJECT, id, payload), now);
                log::debug!("code-reject for unknown lcp code {}", other);
            }
        }
    }

    fn lcp_up(&mut self, now: Instant) {
        log::debug!("lcp open, starting ipcp");
        self.phase = PppPhase::Network;
        self.last_transmit = now;
        self.ipcp.state = NegState::ReqSent;
        self.ipcp.retries = 0;
        self.send_ipcp_request(now);
    }

    // ========================================================================
    // IPCP
    // ========================================================================

    fn send_ipcp_request(&mut self, now: Instant) {
        let mut options = Vec::new();
        encode_option(
            ipcp_opt::IP_ADDRESS,
            &self.requested_addr.octets(),
            &mut options,
        );
        if !self.dns_rejected {
            encode_option(
                ipcp_opt::PRIMARY_DNS,
                &self.requested_dns.octets(),
                &mut options,
            );
        }
        if !self.dns2_rejected {
            encode_option(
                ipcp_opt::SECONDARY_DNS,
                &self.requested_dns2.octets(),
                &mut options,
            );
        }

        let id = self.take_id();
        self.ipcp.id = id;
        self.ipcp.retries += 1;
        self.ipcp.deadline = Some(now + RESTART_INTERVAL);
        self.enqueue(
            PROTO_IPCP,
            &encode_control(code::CONFIGURE_REQUEST, id, &options),
            now,
        );
    }

    fn handle_ipcp(&mut self, payload: &[u8], now: Instant) {
        if self.phase != PppPhase::Network && self.phase != PppPhase::Terminate {
            log::trace!("ipcp before lcp open, dropped");
            return;
        }

        let Some(packet) = parse_control(payload) else {
            log::warn!("malformed ipcp packet, dropped");
            return;
        };

        match packet.code {
            code::CONFIGURE_REQUEST => {
                for option in OptionIter::new(packet.data) {
                    if option.kind == ipcp_opt::IP_ADDRESS && option.data.len() == 4 {
                        self.peer_addr = Ipv4Addr::new(
                            option.data[0],
                            option.data[1],
                            option.data[2],
                            option.data[3],
                        );
                    }
                }

                self.enqueue(
                    PROTO_IPCP,
                    &encode_control(code::CONFIGURE_ACK, packet.id, packet.data),
                    now,
                );

                match self.ipcp.state {
                    NegState::ReqSent => self.ipcp.state = NegState::AckSent,
                    NegState::AckRcvd => {
                        self.ipcp.state = NegState::Opened;
                        self.ipcp_up(now);
                    }
                    _ => {}
                }
            }

            code::CONFIGURE_ACK => {
                if packet.id != self.ipcp.id {
                    return;
                }
                self.ipcp.deadline = None;
                match self.ipcp.state {
                    NegState::ReqSent => self.ipcp.state = NegState::AckRcvd,
                    NegState::AckSent => {
                        self.ipcp.state = NegState::Opened;
                        self.ipcp_up(now);
                    }
                    _ => {}
                }
            }

            code::CONFIGURE_NAK => {
                if packet.id != self.ipcp.id {
                    return;
                }
                for option in OptionIter::new(packet.data) {
                    match option.kind {
                        ipcp_opt::IP_ADDRESS if option.data.len() == 4 => {
                            self.requested_addr = Ipv4Addr::new(
                                option.data[0],
                                option.data[1],
                                option.data[2],
                                option.data[3],
                            );
                        }
                        ipcp_opt::PRIMARY_DNS if option.data.len() == 4 => {
                            self.requested_dns = Ipv4Addr::new(
                                option.data[0],
                                option.data[1],
                                option.data[2],
                                option.data[3],
                            );
                        }
                        ipcp_opt::SECONDARY_DNS if option.data.len() == 4 => {
                            self.requested_dns2 = Ipv4Addr::new(
                                option.data[0],
                                option.data[1],
                                option.data[2],
                                option.data[3],
                            );
                        }
                        _ => {}
                    }
                }
                self.send_ipcp_request(now);
            }

            code::CONFIGURE_REJECT => {
                if packet.id != self.ipcp.id {
                    return;
                }
                let mut addr_rejected = false;
                for option in OptionIter::new(packet.data) {
                    match option.kind {
                        ipcp_opt::PRIMARY_DNS => self.dns_rejected = true,
                        ipcp_opt::SECONDARY_DNS => self.dns2_rejected = true,
                        ipcp_opt::IP_ADDRESS => addr_rejected = true,
                        _ => {}
                    }
                }
                if addr_rejected {
                    // Without an address assignment the tunnel is useless.
                    log::error!("peer rejected the ip-address option");
                    self.link_down("ipcp address rejected");
                } else {
                    self.send_ipcp_request(now);
                }
            }

            code::TERMINATE_REQUEST => {
                self.enqueue(
                    PROTO_IPCP,
                    &encode_control(code::TERMINATE_ACK, packet.id, b""),
                    now,
                );
                log::info!("peer terminated ipcp");
                self.link_down("ipcp terminated by peer");
            }

            code::TERMINATE_ACK => {}

            other => {
                log::debug!("ignoring ipcp code {}", other);
            }
        }
    }

    fn ipcp_up(&mut self, now: Instant) {
        let mtu = self
            .peer_mru
            .map_or(DEFAULT_MTU, |mru| usize::from(mru).min(DEFAULT_MTU));
        let dns = if self.requested_dns.is_unspecified() || self.dns_rejected {
            None
        } else {
            Some(self.requested_dns)
        };
        let dns2 = if self.requested_dns2.is_unspecified() || self.dns2_rejected {
            None
        } else {
            Some(self.requested_dns2)
        };

        let up = LinkUp {
            addr: self.requested_addr,
            gateway: self.peer_addr,
            dns,
            dns2,
            mtu,
        };
        log::info!(
            "ppp up: addr={} gw={} dns={:?}/{:?} mtu={}",
            up.addr,
            up.gateway,
            up.dns,
            up.dns2,
            up.mtu
        );
        self.last_transmit = now;
        self.events.push_back(LinkEvent::Up(up));
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn link_down(&mut self, reason: &'static str) {
        if self.phase != PppPhase::Dead {
            self.phase = PppPhase::Dead;
            self.lcp.state = NegState::Stopped;
            self.ipcp.state = NegState::Stopped;
            self.lcp.deadline = None;
            self.ipcp.deadline = None;
            self.term_deadline = None;
            self.events.push_back(LinkEvent::Down(reason));
        }
    }

    fn take_id(&mut self) -> u8 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Wrap, frame and queue one PPP packet. Control frames are
    /// best-effort: a full queue drops the frame and counts it.
    fn enqueue(&mut self, protocol: u16, payload: &[u8], now: Instant) -> bool {
        let ppp = encode_ppp(protocol, payload);
        let framed = match frame::encode(&ppp) {
            Ok(framed) => framed,
            Err(e) => {
                log::error!("frame encode failed: {}", e);
                return false;
            }
        };

        if self.out_queue.push(framed) {
            self.last_transmit = now;
            true
        } else {
            self.dropped_frames += 1;
            log::warn!(
                "ppp output queue full, frame dropped (total {})",
                self.dropped_frames
            );
            false
        }
    }
}

impl fmt::Debug for PppLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PppLink")
            .field("phase", &self.phase)
            .field("lcp", &self.lcp.state)
            .field("ipcp", &self.ipcp.state)
            .field("queued", &self.out_queue.len())
            .field("dropped_frames", &self.dropped_frames)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Drain and de-frame everything the link queued.
    fn drain_frames(link: &mut PppLink) -> Vec<Vec<u8>> {
        let mut wire = Vec::new();
        while let Some(chunk) = link.out_queue().pop_head() {
            wire.extend_from_slice(&chunk);
        }
        FrameDecoder::new().feed(&wire).unwrap()
    }

    /// Wrap a control packet as it would arrive from the peer.
    fn peer_packet(protocol: u16, code: u8, id: u8, data: &[u8]) -> Vec<u8> {
        frame::encode(&encode_ppp(protocol, &encode_control(code, id, data))).unwrap()
    }

    fn find_control(
        frames: &[Vec<u8>],
        protocol: u16,
        code: u8,
    ) -> Option<(u8, Vec<u8>)> {
        for frame in frames {
            let packet = parse_ppp(frame).unwrap();
            if packet.protocol != protocol {
                continue;
            }
            let control = parse_control(packet.payload).unwrap();
            if control.code == code {
                return Some((control.id, control.data.to_vec()));
            }
        }
        None
    }

    /// Drive a link through LCP+IPCP against a scripted peer; returns the
    /// link and the time used.
    fn open_link(now: Instant) -> PppLink {
        let mut link = PppLink::new(now);
        link.open(now);

        let frames = drain_frames(&mut link);
        let (req_id, _) = find_control(&frames, PROTO_LCP, code::CONFIGURE_REQUEST).unwrap();

        // Peer acks our request and sends its own (magic only).
        link.input(
            &peer_packet(PROTO_LCP, code::CONFIGURE_ACK, req_id, &lcp_magic_opts()),
            now,
        )
        .unwrap();
        link.input(
            &peer_packet(PROTO_LCP, code::CONFIGURE_REQUEST, 1, &lcp_magic_opts()),
            now,
        )
        .unwrap();

        // LCP open: the link acked the peer and queued an IPCP request.
        let frames = drain_frames(&mut link);
        assert!(find_control(&frames, PROTO_LCP, code::CONFIGURE_ACK).is_some());
        let (ipcp_id, _) = find_control(&frames, PROTO_IPCP, code::CONFIGURE_REQUEST).unwrap();

        // Peer naks with the real address and both nameservers.
        let mut nak = Vec::new();
        encode_option(ipcp_opt::IP_ADDRESS, &[10, 8, 0, 2], &mut nak);
        encode_option(ipcp_opt::PRIMARY_DNS, &[10, 8, 0, 53], &mut nak);
        encode_option(ipcp_opt::SECONDARY_DNS, &[10, 8, 0, 54], &mut nak);
        link.input(&peer_packet(PROTO_IPCP, code::CONFIGURE_NAK, ipcp_id, &nak), now)
            .unwrap();

        let frames = drain_frames(&mut link);
        let (retry_id, data) =
            find_control(&frames, PROTO_IPCP, code::CONFIGURE_REQUEST).unwrap();
        // The retry echoes the assigned address.
        let addr = OptionIter::new(&data)
            .find(|o| o.kind == ipcp_opt::IP_ADDRESS)
            .unwrap();
        assert_eq!(addr.data, &[10, 8, 0, 2]);

        link.input(&peer_packet(PROTO_IPCP, code::CONFIGURE_ACK, retry_id, &data), now)
            .unwrap();

        // Peer announces its own address.
        let mut peer_req = Vec::new();
        encode_option(ipcp_opt::IP_ADDRESS, &[10, 8, 0, 1], &mut peer_req);
        link.input(
            &peer_packet(PROTO_IPCP, code::CONFIGURE_REQUEST, 2, &peer_req),
            now,
        )
        .unwrap();

        link
    }

    fn lcp_magic_opts() -> Vec<u8> {
        let mut opts = Vec::new();
        encode_option(lcp_opt::MAGIC_NUMBER, &[9, 9, 9, 9], &mut opts);
        opts
    }

    #[test]
    fn test_open_sends_magic_only_request() {
        let now = Instant::now();
        let mut link = PppLink::new(now);
        link.open(now);

        assert_eq!(link.phase(), PppPhase::Establish);
        let frames = drain_frames(&mut link);
        let (_, data) = find_control(&frames, PROTO_LCP, code::CONFIGURE_REQUEST).unwrap();

        let options: Vec<_> = OptionIter::new(&data).collect();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].kind, lcp_opt::MAGIC_NUMBER);
        // Never negotiate ACCM or any compression.
        assert!(options.iter().all(|o| o.kind != lcp_opt::ACCM));
    }

    #[test]
    fn test_full_negotiation_reaches_link_up() {
        let now = Instant::now();
        let mut link = open_link(now);

        assert!(link.is_up());
        match link.poll_event() {
            Some(LinkEvent::Up(up)) => {
                assert_eq!(up.addr, Ipv4Addr::new(10, 8, 0, 2));
                assert_eq!(up.gateway, Ipv4Addr::new(10, 8, 0, 1));
                assert_eq!(up.dns, Some(Ipv4Addr::new(10, 8, 0, 53)));
                assert_eq!(up.dns2, Some(Ipv4Addr::new(10, 8, 0, 54)));
                assert_eq!(up.mtu, 1500);
            }
            other => panic!("expected LinkUp, got {:?}", other),
        }
    }

    #[test]
    fn test_rejected_secondary_dns_dropped_from_retry() {
        let now = Instant::now();
        let mut link = PppLink::new(now);
        link.open(now);
        drain_frames(&mut link);

        // Bring LCP up so IPCP starts.
        let frames = {
            link.input(
                &peer_packet(PROTO_LCP, code::CONFIGURE_ACK, 1, &lcp_magic_opts()),
                now,
            )
            .unwrap();
            link.input(
                &peer_packet(PROTO_LCP, code::CONFIGURE_REQUEST, 1, &lcp_magic_opts()),
                now,
            )
            .unwrap();
            drain_frames(&mut link)
        };
        let (ipcp_id, data) = find_control(&frames, PROTO_IPCP, code::CONFIGURE_REQUEST).unwrap();
        assert!(OptionIter::new(&data).any(|o| o.kind == ipcp_opt::SECONDARY_DNS));

        // Peer rejects the secondary nameserver option only.
        let mut rej = Vec::new();
        encode_option(ipcp_opt::SECONDARY_DNS, &[0, 0, 0, 0], &mut rej);
        link.input(&peer_packet(PROTO_IPCP, code::CONFIGURE_REJECT, ipcp_id, &rej), now)
            .unwrap();

        let frames = drain_frames(&mut link);
        let (_, data) = find_control(&frames, PROTO_IPCP, code::CONFIGURE_REQUEST).unwrap();
        let kinds: Vec<u8> = OptionIter::new(&data).map(|o| o.kind).collect();
        assert!(kinds.contains(&ipcp_opt::IP_ADDRESS));
        assert!(kinds.contains(&ipcp_opt::PRIMARY_DNS));
        assert!(!kinds.contains(&ipcp_opt::SECONDARY_DNS));
    }

    #[test]
    fn test_unsupported_lcp_option_is_rejected() {
        let now = Instant::now();
        let mut link = PppLink::new(now);
        link.open(now);
        drain_frames(&mut link);

        // Peer requests ACCM; the link must Configure-Reject it.
        let mut opts = Vec::new();
        encode_option(lcp_opt::ACCM, &[0, 0, 0, 0], &mut opts);
        link.input(&peer_packet(PROTO_LCP, code::CONFIGURE_REQUEST, 5, &opts), now)
            .unwrap();

        let frames = drain_frames(&mut link);
        let (id, data) = find_control(&frames, PROTO_LCP, code::CONFIGURE_REJECT).unwrap();
        assert_eq!(id, 5);
        let rejected: Vec<_> = OptionIter::new(&data).collect();
        assert_eq!(rejected[0].kind, lcp_opt::ACCM);
    }

    #[test]
    fn test_echo_request_gets_reply_with_our_magic() {
        let now = Instant::now();
        let mut link = open_link(now);
        drain_frames(&mut link);

        link.input(
            &peer_packet(PROTO_LCP, code::ECHO_REQUEST, 9, &[9, 9, 9, 9, 0xAB]),
            now,
        )
        .unwrap();

        let frames = drain_frames(&mut link);
        let (id, data) = find_control(&frames, PROTO_LCP, code::ECHO_REPLY).unwrap();
        assert_eq!(id, 9);
        assert_eq!(data.len(), 5);
        assert_eq!(data[4], 0xAB);
    }

    #[test]
    fn test_keepalive_after_transmit_silence() {
        let now = Instant::now();
        let mut link = open_link(now);
        drain_frames(&mut link);

        // No traffic for 61 seconds.
        let later = now + Duration::from_secs(61);
        link.tick(later);

        let frames = drain_frames(&mut link);
        assert!(find_control(&frames, PROTO_LCP, code::DISCARD_REQUEST).is_some());

        // The keep-alive itself counts as transmission: no second one.
        link.tick(later + Duration::from_secs(1));
        assert!(drain_frames(&mut link).is_empty());
    }

    #[test]
    fn test_peer_terminate_brings_link_down() {
        let now = Instant::now();
        let mut link = open_link(now);
        let _ = link.poll_event();
        drain_frames(&mut link);

        link.input(&peer_packet(PROTO_LCP, code::TERMINATE_REQUEST, 3, b""), now)
            .unwrap();

        let frames = drain_frames(&mut link);
        let (id, _) = find_control(&frames, PROTO_LCP, code::TERMINATE_ACK).unwrap();
        assert_eq!(id, 3);
        assert!(link.dead());
        assert_eq!(link.poll_event(), Some(LinkEvent::Down("terminated by peer")));
    }

    #[test]
    fn test_close_waits_for_terminate_ack() {
        let now = Instant::now();
        let mut link = open_link(now);
        let _ = link.poll_event();
        drain_frames(&mut link);

        link.close(now);
        assert_eq!(link.phase(), PppPhase::Terminate);
        // close is idempotent.
        link.close(now);

        let frames = drain_frames(&mut link);
        let (id, _) = find_control(&frames, PROTO_LCP, code::TERMINATE_REQUEST).unwrap();

        link.input(&peer_packet(PROTO_LCP, code::TERMINATE_ACK, id, b""), now)
            .unwrap();
        assert!(link.dead());
        assert_eq!(link.poll_event(), Some(LinkEvent::Down("closed")));
    }

    #[test]
    fn test_terminate_retry_then_give_up() {
        let now = Instant::now();
        let mut link = open_link(now);
        let _ = link.poll_event();
        link.close(now);
        drain_frames(&mut link);

        // First retry.
        link.tick(now + Duration::from_secs(4));
        assert!(!link.dead());
        let frames = drain_frames(&mut link);
        assert!(find_control(&frames, PROTO_LCP, code::TERMINATE_REQUEST).is_some());

        // Retry budget exhausted.
        link.tick(now + Duration::from_secs(8));
        assert!(link.dead());
    }

    #[test]
    fn test_configure_retransmission_and_failure() {
        let now = Instant::now();
        let mut link = PppLink::new(now);
        link.open(now);
        drain_frames(&mut link);

        // Silent peer: every restart interval resends the request.
        let mut t = now;
        for _ in 0..(MAX_CONFIGURE - 1) {
            t += Duration::from_secs(4);
            link.tick(t);
            let frames = drain_frames(&mut link);
            assert!(
                find_control(&frames, PROTO_LCP, code::CONFIGURE_REQUEST).is_some(),
                "expected a retransmitted configure-request"
            );
        }

        t += Duration::from_secs(4);
        link.tick(t);
        assert!(link.dead());
        assert_eq!(
            link.poll_event(),
            Some(LinkEvent::Down("lcp negotiation failed"))
        );
    }

    #[test]
    fn test_ipv4_gated_on_link_up() {
        let now = Instant::now();
        let mut link = PppLink::new(now);
        link.open(now);
        assert!(!link.send_ipv4(&[0x45, 0x00], now));

        let mut link = open_link(now);
        drain_frames(&mut link);
        assert!(link.send_ipv4(&[0x45, 0x00, 0x00, 0x14], now));

        let frames = drain_frames(&mut link);
        let packet = parse_ppp(&frames[0]).unwrap();
        assert_eq!(packet.protocol, PROTO_IPV4);
        assert_eq!(packet.payload, &[0x45, 0x00, 0x00, 0x14]);
    }

    #[test]
    fn test_inbound_ipv4_delivered_only_when_up() {
        let now = Instant::now();
        let mut link = PppLink::new(now);
        link.open(now);

        let early = frame::encode(&encode_ppp(PROTO_IPV4, &[0x45, 0x00])).unwrap();
        assert!(link.input(&early, now).unwrap().is_empty());

        let mut link = open_link(now);
        let wire = frame::encode(&encode_ppp(PROTO_IPV4, &[0x45, 0x99])).unwrap();
        let delivered = link.input(&wire, now).unwrap();
        assert_eq!(delivered, vec![vec![0x45, 0x99]]);
    }

    #[test]
    fn test_framing_violation_is_fatal() {
        let now = Instant::now();
        let mut link = open_link(now);

        let mut bad = frame::encode(&encode_ppp(PROTO_IPV4, &[0x45])).unwrap();
        bad[2] = 0x00; // corrupt magic
        assert!(link.input(&bad, now).is_err());
        // Still fatal on the next feed.
        let good = frame::encode(&encode_ppp(PROTO_IPV4, &[0x45])).unwrap();
        assert!(link.input(&good, now).is_err());
    }
}
