// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Full TCP conversations against the embedded stack, playing the remote
//! host by crafting raw IPv4 segments: connect, bidirectional transfer
//! with window accounting, orderly close.

use std::net::Ipv4Addr;
use std::time::Instant;

use fortitun::stack::ipv4::{build_ipv4, parse_ipv4, PROTO_TCP};
use fortitun::stack::tcp::{
    build_tcp, parse_tcp, PcbEvent, TcpSegment, FLAG_ACK, FLAG_FIN, FLAG_PSH, FLAG_SYN,
};
use fortitun::stack::{NetStack, PcbHandle, StackEvent};

const OUR: Ipv4Addr = Ipv4Addr::new(10, 212, 134, 200);
const GW: Ipv4Addr = Ipv4Addr::new(10, 212, 134, 1);
const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const SERVER_PORT: u16 = 3389;

/// The remote side of the conversation.
struct FakeServer {
    port: u16,
    seq: u32,
    ack: u32,
    received: Vec<u8>,
}

impl FakeServer {
    fn new() -> Self {
        Self {
            port: 0,
            seq: 42_000,
            ack: 0,
            received: Vec::new(),
        }
    }

    /// Consume the stack's outbound packets, answer like a TCP server,
    /// and feed the answers back in.
    fn exchange(&mut self, stack: &mut NetStack, now: Instant) {
        for packet in stack.take_output() {
            let (header, payload) = parse_ipv4(&packet).expect("valid ipv4");
            assert_eq!(header.src, OUR);
            assert_eq!(header.dst, SERVER);
            assert_eq!(header.protocol, PROTO_TCP);

            let seg = parse_tcp(OUR, SERVER, payload).expect("valid tcp");
            let mut responses = Vec::new();
            self.react(&seg, &mut responses);
            for response in responses {
                stack.input(&build_ipv4(SERVER, OUR, PROTO_TCP, 99, &response), now);
            }
        }
    }

    fn react(&mut self, seg: &TcpSegment<'_>, out: &mut Vec<Vec<u8>>) {
        if seg.flags & FLAG_SYN != 0 {
            self.port = seg.src_port;
            self.ack = seg.seq.wrapping_add(1);
            out.push(self.segment(FLAG_SYN | FLAG_ACK, b""));
            self.seq = self.seq.wrapping_add(1);
            return;
        }

        let mut advanced = false;
        if !seg.payload.is_empty() {
            self.received.extend_from_slice(seg.payload);
            self.ack = seg.seq.wrapping_add(seg.payload.len() as u32);
            advanced = true;
        }
        if seg.flags & FLAG_FIN != 0 {
            self.ack = self.ack.wrapping_add(1);
            advanced = true;
        }
        if advanced {
            out.push(self.segment(FLAG_ACK, b""));
        }
        if seg.flags & FLAG_FIN != 0 {
            // Close our side too.
            out.push(self.segment(FLAG_FIN | FLAG_ACK, b""));
            self.seq = self.seq.wrapping_add(1);
        }
    }

    /// Send payload from the server towards the client.
    fn send(&mut self, stack: &mut NetStack, data: &[u8], now: Instant) {
        let seg = self.segment(FLAG_ACK | FLAG_PSH, data);
        self.seq = self.seq.wrapping_add(data.len() as u32);
        stack.input(&build_ipv4(SERVER, OUR, PROTO_TCP, 100, &seg), now);
    }

    fn segment(&self, flags: u8, payload: &[u8]) -> Vec<u8> {
        build_tcp(
            SERVER,
            OUR,
            SERVER_PORT,
            self.port,
            self.seq,
            self.ack,
            flags,
            16_384,
            if flags & FLAG_SYN != 0 { Some(1460) } else { None },
            payload,
        )
    }
}

fn drain_events(stack: &mut NetStack) -> Vec<(PcbHandle, PcbEvent)> {
    let mut events = Vec::new();
    while let Some(event) = stack.poll_event() {
        if let StackEvent::Tcp(handle, event) = event {
            events.push((handle, event));
        }
    }
    events
}

fn setup() -> (NetStack, FakeServer, PcbHandle, Instant) {
    let now = Instant::now();
    let mut stack = NetStack::new();
    stack.configure(OUR, GW, 1354, None);

    let handle = stack.tcp_open(SERVER, SERVER_PORT, now).unwrap();
    let mut server = FakeServer::new();
    server.exchange(&mut stack, now);

    let events = drain_events(&mut stack);
    assert!(
        events.iter().any(|(h, e)| *h == handle && *e == PcbEvent::Connected),
        "expected Connected, got {:?}",
        events
    );

    // Let the handshake-completing ACK reach the server.
    server.exchange(&mut stack, now);
    (stack, server, handle, now)
}

#[test]
fn connect_then_transfer_both_ways() {
    let (mut stack, mut server, handle, now) = setup();

    // Client -> server, first bytes of an RDP connection request.
    let n = stack.tcp_write(handle, &[0x03, 0x00, 0x00, 0x13], false, now).unwrap();
    assert_eq!(n, 4);
    server.exchange(&mut stack, now);
    assert_eq!(server.received, [0x03, 0x00, 0x00, 0x13]);

    // The ACK came back: the write is reported sent.
    let events = drain_events(&mut stack);
    assert!(events.iter().any(|(_, e)| *e == PcbEvent::Sent(4)));

    // Server -> client.
    server.send(&mut stack, b"rdp negotiation response", now);
    let events = drain_events(&mut stack);
    let received: Vec<u8> = events
        .into_iter()
        .filter_map(|(_, e)| match e {
            PcbEvent::Received(data) => Some(data),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(received, b"rdp negotiation response");

    stack.tcp_recved(handle, received.len(), now);
}

#[test]
fn bulk_transfer_respects_the_server_window() {
    let (mut stack, mut server, handle, now) = setup();

    // Write more than one MSS worth; the exchange loop acks as it goes.
    let blob: Vec<u8> = (0..6000).map(|i| (i % 251) as u8).collect();
    let mut offset = 0;
    while offset < blob.len() {
        match stack.tcp_write(handle, &blob[offset..], true, now) {
            Ok(n) => offset += n,
            Err(e) => panic!("write failed at {}: {:?}", offset, e),
        }
        server.exchange(&mut stack, now);
        let _ = drain_events(&mut stack);
    }
    stack.tcp_flush(handle, now);
    server.exchange(&mut stack, now);

    assert_eq!(server.received, blob);
}

#[test]
fn orderly_close_completes() {
    let (mut stack, mut server, handle, now) = setup();

    stack.tcp_write(handle, b"bye", false, now).unwrap();
    stack.tcp_close(handle, now);
    server.exchange(&mut stack, now);

    // The server acked data+FIN and sent its own FIN; the stack acks it.
    server.exchange(&mut stack, now);

    let events = drain_events(&mut stack);
    assert!(events.iter().any(|(_, e)| *e == PcbEvent::Sent(3)));
    assert!(events.iter().any(|(_, e)| *e == PcbEvent::PeerClosed));
    assert_eq!(server.received, b"bye");
}

#[test]
fn stale_handle_after_abort_is_inert() {
    let (mut stack, mut server, handle, now) = setup();

    stack.tcp_abort(handle, now);
    server.exchange(&mut stack, now); // the RST reaches the server

    assert!(!stack.is_alive(handle));
    assert!(stack.tcp_write(handle, b"x", false, now).is_err());
    // recved/close/flush on a stale handle are harmless no-ops.
    stack.tcp_recved(handle, 10, now);
    stack.tcp_close(handle, now);
    stack.tcp_flush(handle, now);
}
