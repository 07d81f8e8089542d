// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal in-tunnel DNS resolver.
//!
//! Resolves the remote endpoint's host name through the nameservers the
//! firewall hands out over IPCP (or one from configuration). A-records
//! only, UDP only, a couple of retries per server; when the primary
//! exhausts its retry budget the query fails over to the secondary
//! before giving up. The stack owns the UDP plumbing; this module
//! tracks queries and speaks the wire format.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// DNS server port.
pub const DNS_PORT: u16 = 53;

/// Transmissions per server before moving on (or giving up).
const MAX_ATTEMPTS: u32 = 3;

/// Wait between transmissions.
const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Nameservers kept: primary and secondary.
const MAX_SERVERS: usize = 2;

/// Resolver failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    /// No nameserver is known.
    NotConfigured,
    /// The server never answered.
    ServerUnreachable,
    /// The name does not resolve to an IPv4 address.
    NoSuchName,
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "no dns server configured"),
            Self::ServerUnreachable => write!(f, "dns server unreachable"),
            Self::NoSuchName => write!(f, "no such name"),
        }
    }
}

impl std::error::Error for DnsError {}

// ============================================================================
// Wire format
// ============================================================================

/// Encode an A query with recursion desired.
pub fn encode_query(id: u16, name: &str) -> Option<Vec<u8>> {
    let mut packet = Vec::with_capacity(17 + name.len());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // AN/NS/AR

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    Some(packet)
}

/// Skip a (possibly compressed) name; returns the index after it.
fn skip_name(data: &[u8], mut i: usize) -> Option<usize> {
    loop {
        let len = *data.get(i)?;
        if len == 0 {
            return Some(i + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(i + 2);
        }
        i += 1 + usize::from(len);
    }
}

/// Parse a response; returns the id and the first A record (or the error).
pub fn parse_response(data: &[u8]) -> Option<(u16, Result<Ipv4Addr, DnsError>)> {
    if data.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    if flags & 0x8000 == 0 {
        return None; // not a response
    }
    if flags & 0x000F != 0 {
        return Some((id, Err(DnsError::NoSuchName)));
    }

    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    let ancount = u16::from_be_bytes([data[6], data[7]]);

    let mut i = 12;
    for _ in 0..qdcount {
        i = skip_name(data, i)?;
        i += 4; // qtype + qclass
    }

    for _ in 0..ancount {
        i = skip_name(data, i)?;
        if i + 10 > data.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([data[i], data[i + 1]]);
        let rclass = u16::from_be_bytes([data[i + 2], data[i + 3]]);
        let rdlen = usize::from(u16::from_be_bytes([data[i + 8], data[i + 9]]));
        i += 10;
        if i + rdlen > data.len() {
            return None;
        }
        if rtype == 1 && rclass == 1 && rdlen == 4 {
            let addr = Ipv4Addr::new(data[i], data[i + 1], data[i + 2], data[i + 3]);
            return Some((id, Ok(addr)));
        }
        i += rdlen;
    }

    Some((id, Err(DnsError::NoSuchName)))
}

// ============================================================================
// Resolver
// ============================================================================

#[derive(Debug)]
struct PendingQuery {
    token: u32,
    id: u16,
    src_port: u16,
    name: String,
    attempts: u32,
    /// Index into the server list this query currently targets.
    server: usize,
    deadline: Instant,
}

/// Tracks in-flight queries; the stack transports the datagrams.
#[derive(Debug, Default)]
pub struct DnsResolver {
    /// Primary first, secondary after it.
    servers: Vec<Ipv4Addr>,
    pending: Vec<PendingQuery>,
    next_token: u32,
}

impl DnsResolver {
    /// Resolver with no server configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a nameserver (IPCP-provided or from configuration).
    /// Duplicates are ignored and at most two servers are kept.
    pub fn add_server(&mut self, server: Ipv4Addr) {
        if self.servers.len() < MAX_SERVERS && !self.servers.contains(&server) {
            self.servers.push(server);
        }
    }

    /// The primary nameserver.
    pub fn server(&self) -> Option<Ipv4Addr> {
        self.servers.first().copied()
    }

    /// All configured nameservers, primary first.
    pub fn servers(&self) -> &[Ipv4Addr] {
        &self.servers
    }

    /// True once a nameserver is known.
    pub fn configured(&self) -> bool {
        !self.servers.is_empty()
    }

    /// Register a query; returns the token and the query payload to send.
    /// Fails for names the wire format cannot carry.
    pub fn start(
        &mut self,
        name: &str,
        id: u16,
        src_port: u16,
        now: Instant,
    ) -> Result<(u32, Vec<u8>), DnsError> {
        let payload = encode_query(id, name).ok_or(DnsError::NoSuchName)?;

        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token;
        self.pending.push(PendingQuery {
            token,
            id,
            src_port,
            name: name.to_string(),
            attempts: 1,
            server: 0,
            deadline: now + RETRY_INTERVAL,
        });
        Ok((token, payload))
    }

    /// Match a UDP payload (delivered to `dst_port`) against a pending
    /// query. Returns the token and the result when it matches one.
    pub fn handle_datagram(
        &mut self,
        dst_port: u16,
        payload: &[u8],
    ) -> Option<(u32, Result<Ipv4Addr, DnsError>)> {
        let (id, result) = parse_response(payload)?;
        let index = self
            .pending
            .iter()
            .position(|q| q.src_port == dst_port && q.id == id)?;
        let query = self.pending.swap_remove(index);

        log::debug!("dns {} -> {:?}", query.name, result);
        Some((query.token, result))
    }

    /// Run retry timers. Returns queries to retransmit (token, payload,
    /// src_port, server address) and queries that timed out. A query
    /// that exhausts its attempts on the primary moves to the secondary
    /// before it is declared dead.
    pub fn on_timer(&mut self, now: Instant) -> (Vec<(u32, Vec<u8>, u16, Ipv4Addr)>, Vec<u32>) {
        let mut retransmit = Vec::new();
        let mut expired = Vec::new();
        let servers = self.servers.clone();

        self.pending.retain_mut(|query| {
            if now < query.deadline {
                return true;
            }
            if query.attempts >= MAX_ATTEMPTS {
                if query.server + 1 < servers.len() {
                    query.server += 1;
                    query.attempts = 0;
                    log::debug!(
                        "dns {} failing over to {}",
                        query.name,
                        servers[query.server]
                    );
                } else {
                    log::warn!("dns query for {} timed out", query.name);
                    expired.push(query.token);
                    return false;
                }
            }
            query.attempts += 1;
            query.deadline = now + RETRY_INTERVAL;
            match (servers.get(query.server), encode_query(query.id, &query.name)) {
                (Some(&server), Some(payload)) => {
                    retransmit.push((query.token, payload, query.src_port, server));
                }
                _ => {
                    expired.push(query.token);
                    return false;
                }
            }
            true
        });

        (retransmit, expired)
    }

    /// Earliest retry deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|q| q.deadline).min()
    }

    /// Source ports currently reserved by in-flight queries.
    pub fn ports_in_use(&self) -> impl Iterator<Item = u16> + '_ {
        self.pending.iter().map(|q| q.src_port)
    }
}

// ============================================================================
// Tests
// ============================================================================
