// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP protocol control blocks for the embedded stack.
//!
//! A deliberately small client-side TCP: active open only, in-order
//! receive (out-of-order segments are dropped and re-acked), go-back-N
//! retransmission with a doubling RTO, explicit receive-window accounting
//! driven by the user's `recved` calls.
//!
//! ```text
//!        SynSent --(SYN|ACK)--> Established --(close)--> FinWait1
//!           |                     |      \                |    \
//!        (RST/timeout)        (peer FIN)  \            (FIN)  (ACK of FIN)
//!           v                     v        \              v       v
//!         Closed              CloseWait     +--------> Closing  FinWait2
//!                                 |                       |       |
//!                              (close)                 (ACK)    (FIN)
//!                                 v                       v       v
//!                              LastAck --(ACK)--> Closed TimeWait-+
//! ```
//!
//! The PCB never touches the wire itself: [`TcpPcb::emit`] returns raw
//! TCP segments and the stack wraps them into IPv4.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::stack::ipv4::{transport_checksum, PROTO_TCP};

// ============================================================================
// Constants
// ============================================================================

/// Send buffer capacity per connection.
pub const SND_BUF_CAPACITY: usize = 8 * 1024;

/// Receive window advertised on a fresh connection.
pub const RCV_WND_DEFAULT: u16 = 16 * 1024;

/// Retransmissions before the connection is declared dead.
const MAX_RETRANSMITS: u32 = 8;

/// Initial retransmission timeout.
const RTO_INITIAL: Duration = Duration::from_secs(1);

/// Ceiling for the doubling RTO.
const RTO_MAX: Duration = Duration::from_secs(32);

/// Linger in TimeWait before the slot is reaped.
const TIME_WAIT_DURATION: Duration = Duration::from_secs(30);

/// TCP header flags.
pub const FLAG_FIN: u8 = 0x01;
/// SYN.
pub const FLAG_SYN: u8 = 0x02;
/// RST.
pub const FLAG_RST: u8 = 0x04;
/// PSH.
pub const FLAG_PSH: u8 = 0x08;
/// ACK.
pub const FLAG_ACK: u8 = 0x10;

// ============================================================================
// Sequence arithmetic
// ============================================================================

/// `a < b` in sequence space.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

// ============================================================================
// Segments
// ============================================================================

/// A parsed TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgment number (valid with [`FLAG_ACK`]).
    pub ack: u32,
    /// Header flags.
    pub flags: u8,
    /// Advertised window.
    pub window: u16,
    /// MSS option if present (SYN segments).
    pub mss: Option<u16>,
    /// Segment payload.
    pub payload: &'a [u8],
}

/// Parse and checksum-verify a TCP segment from an IPv4 payload.
pub fn parse_tcp<'a>(src: Ipv4Addr, dst: Ipv4Addr, data: &'a [u8]) -> Option<TcpSegment<'a>> {
    if data.len() < 20 {
        return None;
    }
    let header_len = usize::from(data[12] >> 4) * 4;
    if header_len < 20 || header_len > data.len() {
        return None;
    }
    if transport_checksum(src, dst, PROTO_TCP, data) != 0 {
        return None;
    }

    // Walk options for MSS (kind 2).
    let mut mss = None;
    let mut cursor = 20;
    while cursor < header_len {
        match data[cursor] {
            0 => break,
            1 => cursor += 1,
            kind => {
                if cursor + 1 >= header_len {
                    break;
                }
                let len = usize::from(data[cursor + 1]);
                if len < 2 || cursor + len > header_len {
                    break;
                }
                if kind == 2 && len == 4 {
                    mss = Some(u16::from_be_bytes([data[cursor + 2], data[cursor + 3]]));
                }
                cursor += len;
            }
        }
    }

    Some(TcpSegment {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: data[13] & 0x3F,
        window: u16::from_be_bytes([data[14], data[15]]),
        mss,
        payload: &data[header_len..],
    })
}

/// Build a TCP segment with checksum; `mss` adds the option (SYN only).
#[allow(clippy::too_many_arguments)]
pub fn build_tcp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    payload: &[u8],
) -> Vec<u8> {
    let header_len = if mss.is_some() { 24 } else { 20 };
    let mut segment = Vec::with_capacity(header_len + payload.len());

    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&ack.to_be_bytes());
    segment.push(((header_len / 4) as u8) << 4);
    segment.push(flags);
    segment.extend_from_slice(&window.to_be_bytes());
    segment.extend_from_slice(&[0, 0]); // checksum placeholder
    segment.extend_from_slice(&[0, 0]); // urgent pointer
    if let Some(mss) = mss {
        segment.push(2);
        segment.push(4);
        segment.extend_from_slice(&mss.to_be_bytes());
    }
    segment.extend_from_slice(payload);

    let cksum = transport_checksum(src, dst, PROTO_TCP, &segment);
    segment[16..18].copy_from_slice(&cksum.to_be_bytes());
    segment
}

// ============================================================================
// PCB
// ============================================================================

/// RFC 793 connection states reachable by an active-open client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    /// SYN sent, waiting for SYN|ACK.
    SynSent,
    /// Fully open.
    Established,
    /// We closed first; FIN in flight.
    FinWait1,
    /// Our FIN acked, peer still open.
    FinWait2,
    /// Simultaneous close; waiting for our FIN's ack.
    Closing,
    /// Both sides done; lingering for stray segments.
    TimeWait,
    /// Peer closed first.
    CloseWait,
    /// Peer closed, then we closed; FIN in flight.
    LastAck,
    /// Terminal.
    Closed,
}

/// Faults that terminate a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpFault {
    /// Peer reset the connection.
    Reset,
    /// Retransmission budget exhausted.
    Timeout,
}

/// Events a PCB reports to its single event sink (the forwarder).
#[derive(Debug, PartialEq, Eq)]
pub enum PcbEvent {
    /// Three-way handshake completed.
    Connected,
    /// In-order payload arrived (window already shrunk by its length).
    Received(Vec<u8>),
    /// `n` previously written bytes were acknowledged.
    Sent(usize),
    /// The peer sent FIN; no more data will arrive.
    PeerClosed,
    /// The connection finished an orderly close.
    Closed,
    /// The connection died.
    Error(TcpFault),
}

/// Result of a write into the send buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteError {
    /// No space in the send buffer; retry after a `Sent` event.
    Full,
    /// The connection no longer accepts data.
    Closed,
}

/// One TCP connection.
#[derive(Debug)]
pub struct TcpPcb {
    state: TcpState,
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,

    /// Effective send MSS (ours, lowered by the peer's SYN option).
    mss: u16,

    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,

    /// Unacked + unsent bytes; the front is `snd_una`.
    send_buf: VecDeque<u8>,
    push_pending: bool,
    fin_queued: bool,
    fin_sent: bool,

    rcv_nxt: u32,
    rcv_wnd: u16,
    ack_pending: bool,

    rto: Duration,
    rto_deadline: Option<Instant>,
    retransmits: u32,
    time_wait_deadline: Option<Instant>,

    events: VecDeque<PcbEvent>,
}

impl TcpPcb {
    /// Create a PCB in SynSent; the SYN leaves on the next [`emit`].
    ///
    /// [`emit`]: TcpPcb::emit
    pub fn new(
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        iss: u32,
        mss: u16,
    ) -> Self {
        Self {
            state: TcpState::SynSent,
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            mss,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            send_buf: VecDeque::new(),
            push_pending: false,
            fin_queued: false,
            fin_sent: false,
            rcv_nxt: 0,
            rcv_wnd: RCV_WND_DEFAULT,
            ack_pending: false,
            rto: RTO_INITIAL,
            rto_deadline: None,
            retransmits: 0,
            time_wait_deadline: None,
            events: VecDeque::new(),
        }
    }

    // ========================================================================
    // Getters
    // ========================================================================

    /// Current connection state.
    pub fn state(&self) -> TcpState {
        self.state
    }

    /// True once the PCB is terminal and can be reaped.
    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Local port the connection is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote address/port.
    pub fn remote(&self) -> (Ipv4Addr, u16) {
        (self.remote_ip, self.remote_port)
    }

    /// True while the send buffer can take more payload.
    pub fn can_accept_payload(&self) -> bool {
        matches!(self.state, TcpState::Established | TcpState::CloseWait)
            && self.send_buf.len() < SND_BUF_CAPACITY
    }

    /// Bytes written but not yet emitted, or a queued FIN.
    pub fn has_unsent(&self) -> bool {
        self.unsent_len() > 0 || (self.fin_queued && !self.fin_sent)
    }

    /// Next pending event for the sink.
    pub fn poll_event(&mut self) -> Option<PcbEvent> {
        self.events.pop_front()
    }

    fn in_flight_data(&self) -> usize {
        let flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
        if self.fin_sent {
            flight.saturating_sub(1)
        } else {
            flight
        }
    }

    fn unsent_len(&self) -> usize {
        self.send_buf.len() - self.in_flight_data()
    }

    // ========================================================================
    // User operations
    // ========================================================================

    /// Append payload to the send buffer. `more = true` suppresses the
    /// PSH hint so consecutive writes coalesce.
    pub fn write(&mut self, data: &[u8], more: bool) -> Result<usize, WriteError> {
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return Err(WriteError::Closed);
        }
        let space = SND_BUF_CAPACITY - self.send_buf.len();
        if space == 0 {
            return Err(WriteError::Full);
        }

        let n = data.len().min(space);
        self.send_buf.extend(&data[..n]);
        if !more {
            self.push_pending = true;
        }
        Ok(n)
    }

    /// Force pending payload out with PSH on the last segment.
    pub fn flush(&mut self) {
        self.push_pending = true;
    }

    /// Begin an orderly close; buffered payload drains before the FIN.
    pub fn close(&mut self) {
        match self.state {
            TcpState::Established | TcpState::CloseWait => {
                self.fin_queued = true;
                self.push_pending = true;
            }
            TcpState::SynSent => {
                self.state = TcpState::Closed;
                self.rto_deadline = None;
            }
            _ => {}
        }
    }

    /// Abort: returns the RST segment to transmit and closes the PCB.
    pub fn abort(&mut self) -> Option<Vec<u8>> {
        if matches!(self.state, TcpState::Closed | TcpState::TimeWait) {
            self.state = TcpState::Closed;
            return None;
        }
        let rst = build_tcp(
            self.local_ip,
            self.remote_ip,
            self.local_port,
            self.remote_port,
            self.snd_nxt,
            self.rcv_nxt,
            FLAG_RST | FLAG_ACK,
            0,
            None,
            b"",
        );
        self.state = TcpState::Closed;
        self.rto_deadline = None;
        Some(rst)
    }

    /// Grow the receive window after the user consumed `n` bytes.
    pub fn recved(&mut self, n: usize) {
        let old = self.rcv_wnd;
        let new = u32::from(self.rcv_wnd) + n as u32;
        self.rcv_wnd = new.min(u32::from(RCV_WND_DEFAULT)) as u16;

        // A window reopening past one segment is worth announcing; tiny
        // increments ride along with the next ACK anyway.
        if old < self.mss && self.rcv_wnd >= self.mss {
            self.ack_pending = true;
        }
    }

    // ========================================================================
    // Segment input
    // ========================================================================

    /// Process one segment addressed to this PCB.
    pub fn handle_segment(&mut self, seg: &TcpSegment<'_>, now: Instant) {
        if self.state == TcpState::Closed {
            return;
        }

        if seg.flags & FLAG_RST != 0 {
            log::debug!("pcb {}->{} reset by peer", self.local_port, self.remote_port);
            self.state = TcpState::Closed;
            self.rto_deadline = None;
            self.events.push_back(PcbEvent::Error(TcpFault::Reset));
            return;
        }

        if self.state == TcpState::SynSent {
            if seg.flags & FLAG_ACK != 0 && seg.ack != self.iss.wrapping_add(1) {
                // Unacceptable ack; the SYN retransmit recovers.
                return;
            }
            if seg.flags & FLAG_SYN != 0 && seg.flags & FLAG_ACK != 0 {
                self.snd_una = seg.ack;
                self.rcv_nxt = seg.seq.wrapping_add(1);
                self.snd_wnd = u32::from(seg.window);
                if let Some(peer_mss) = seg.mss {
                    self.mss = self.mss.min(peer_mss);
                }
                self.state = TcpState::Established;
                self.rto = RTO_INITIAL;
                self.rto_deadline = None;
                self.retransmits = 0;
                self.ack_pending = true;
                self.events.push_back(PcbEvent::Connected);
            }
            return;
        }

        if self.state == TcpState::TimeWait {
            if seg.flags & FLAG_FIN != 0 {
                self.ack_pending = true; // re-ack a retransmitted FIN
            }
            return;
        }

        // Acknowledgment processing.
        if seg.flags & FLAG_ACK != 0 {
            if seq_lt(self.snd_una, seg.ack) && seq_le(seg.ack, self.snd_nxt) {
                let mut acked = seg.ack.wrapping_sub(self.snd_una) as usize;
                let fin_acked = self.fin_sent && seg.ack == self.snd_nxt;
                if fin_acked {
                    acked -= 1;
                }

                self.send_buf.drain(..acked);
                self.snd_una = seg.ack;
                self.retransmits = 0;
                self.rto = RTO_INITIAL;
                self.rto_deadline = if self.snd_una == self.snd_nxt {
                    None
                } else {
                    Some(now + self.rto)
                };

                if acked > 0 {
                    self.events.push_back(PcbEvent::Sent(acked));
                }

                if fin_acked {
                    match self.state {
                        TcpState::FinWait1 => self.state = TcpState::FinWait2,
                        TcpState::Closing => {
                            self.state = TcpState::TimeWait;
                            self.time_wait_deadline = Some(now + TIME_WAIT_DURATION);
                        }
                        TcpState::LastAck => {
                            self.state = TcpState::Closed;
                            self.rto_deadline = None;
                            self.events.push_back(PcbEvent::Closed);
                        }
                        _ => {}
                    }
                }
            }
            self.snd_wnd = u32::from(seg.window);
        }

        // Payload.
        if !seg.payload.is_empty()
            && matches!(
                self.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            )
        {
            if seg.seq == self.rcv_nxt {
                let n = seg.payload.len().min(usize::from(self.rcv_wnd));
                if n > 0 {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(n as u32);
                    self.rcv_wnd -= n as u16;
                    self.events
                        .push_back(PcbEvent::Received(seg.payload[..n].to_vec()));
                }
                self.ack_pending = true;
            } else {
                // Out of order or duplicate: drop, re-ack our position.
                self.ack_pending = true;
            }
        }

        // FIN.
        if seg.flags & FLAG_FIN != 0 {
            let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
            if fin_seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.ack_pending = true;
                match self.state {
                    TcpState::Established => {
                        self.state = TcpState::CloseWait;
                        self.events.push_back(PcbEvent::PeerClosed);
                    }
                    TcpState::FinWait1 => {
                        self.state = TcpState::Closing;
                        self.events.push_back(PcbEvent::PeerClosed);
                    }
                    TcpState::FinWait2 => {
                        self.state = TcpState::TimeWait;
                        self.time_wait_deadline = Some(now + TIME_WAIT_DURATION);
                        self.events.push_back(PcbEvent::PeerClosed);
                    }
                    _ => {}
                }
            }
        }
    }

    // ========================================================================
    // Segment output
    // ========================================================================

    /// Produce the segments this PCB wants on the wire right now.
    pub fn emit(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut segments = Vec::new();

        match self.state {
            TcpState::Closed => return segments,

            TcpState::SynSent => {
                if self.snd_nxt == self.iss {
                    let mss = self.mss;
                    segments.push(self.build(
                        self.iss,
                        0,
                        FLAG_SYN,
                        Some(mss),
                        b"",
                    ));
                    self.snd_nxt = self.iss.wrapping_add(1);
                    self.arm_rto(now);
                }
                return segments;
            }

            _ => {}
        }

        let mut sent_data = false;

        // Payload emission (not after the FIN went out).
        if !self.fin_sent {
            loop {
                let in_flight = self.in_flight_data();
                let unsent = self.send_buf.len() - in_flight;
                let window_avail = (self.snd_wnd as usize).saturating_sub(in_flight);
                let n = unsent.min(window_avail).min(usize::from(self.mss));
                if n == 0 {
                    break;
                }

                let payload: Vec<u8> = self
                    .send_buf
                    .iter()
                    .skip(in_flight)
                    .take(n)
                    .copied()
                    .collect();

                let last = n == unsent;
                let mut flags = FLAG_ACK;
                if self.push_pending && last {
                    flags |= FLAG_PSH;
                }

                let seq = self.snd_nxt;
                let ack = self.rcv_nxt;
                segments.push(self.build(seq, ack, flags, None, &payload));
                self.snd_nxt = self.snd_nxt.wrapping_add(n as u32);
                self.arm_rto(now);
                sent_data = true;

                if last {
                    self.push_pending = false;
                }
            }
        }

        // FIN once the buffer is drained.
        if self.fin_queued && !self.fin_sent && self.unsent_len() == 0 {
            let seq = self.snd_nxt;
            let ack = self.rcv_nxt;
            segments.push(self.build(seq, ack, FLAG_FIN | FLAG_ACK, None, b""));
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
            self.arm_rto(now);
            sent_data = true;

            match self.state {
                TcpState::Established => self.state = TcpState::FinWait1,
                TcpState::CloseWait => self.state = TcpState::LastAck,
                _ => {}
            }
        }

        // Bare ACK when nothing else carried it.
        if self.ack_pending && !sent_data {
            let seq = self.snd_nxt;
            let ack = self.rcv_nxt;
            segments.push(self.build(seq, ack, FLAG_ACK, None, b""));
        }
        if !segments.is_empty() {
            self.ack_pending = false;
        }

        segments
    }

    fn build(
        &self,
        seq: u32,
        ack: u32,
        flags: u8,
        mss: Option<u16>,
        payload: &[u8],
    ) -> Vec<u8> {
        build_tcp(
            self.local_ip,
            self.remote_ip,
            self.local_port,
            self.remote_port,
            seq,
            ack,
            flags,
            self.rcv_wnd,
            mss,
            payload,
        )
    }

    fn arm_rto(&mut self, now: Instant) {
        if self.rto_deadline.is_none() {
            self.rto_deadline = Some(now + self.rto);
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Run retransmission and TimeWait timers.
    pub fn on_timer(&mut self, now: Instant) {
        if self.state == TcpState::TimeWait {
            if let Some(deadline) = self.time_wait_deadline {
                if now >= deadline {
                    self.state = TcpState::Closed;
                    self.events.push_back(PcbEvent::Closed);
                }
            }
            return;
        }

        let Some(deadline) = self.rto_deadline else {
            return;
        };
        if now < deadline {
            return;
        }

        self.retransmits += 1;
        if self.retransmits > MAX_RETRANSMITS {
            log::warn!(
                "pcb {}->{} gave up after {} retransmits",
                self.local_port,
                self.remote_port,
                MAX_RETRANSMITS
            );
            self.state = TcpState::Closed;
            self.rto_deadline = None;
            self.events.push_back(PcbEvent::Error(TcpFault::Timeout));
            return;
        }

        // Go-back-N: rewind and let emit() resend.
        if self.state == TcpState::SynSent {
            self.snd_nxt = self.iss;
        } else {
            self.snd_nxt = self.snd_una;
            self.fin_sent = false;
        }
        self.rto = (self.rto * 2).min(RTO_MAX);
        self.rto_deadline = Some(now + self.rto);
    }

    /// Earliest timer deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.rto_deadline, self.time_wait_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
