// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The tunnel reactor: one thread owning the TLS carrier, the PPP link,
//! the embedded stack and every forwarder.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Tunneler                               |
//! |  +--------------------------------------------------------+  |
//! |  |                     mio::Poll                           |  |
//! |  |  token 0: TLS carrier (read always, write when queued) |  |
//! |  |  token 1: local listener (gated on capacity)           |  |
//! |  |  token 2+n: forwarder n external socket                |  |
//! |  +--------------------------------------------------------+  |
//! |        |                 |                    |               |
//! |        v                 v                    v               |
//! |   PPP link <------- NetStack <--------- Forwarders           |
//! +--------------------------------------------------------------+
//! ```
//!
//! The carrier socket is read and written here and nowhere else once the
//! tunnel has started; it is not thread-safe. The only cross-thread
//! inputs are the terminate flag and the `listening` event the control
//! surface waits on.
//!
//! # Shutdown ordering
//!
//! 1. terminate observed -> Closing: RST every forwarder, 1 s grace so
//!    the RSTs can leave through the stack;
//! 2. grace over or forwarders gone -> Disconnecting: LCP terminate,
//!    50 s hard deadline;
//! 3. link Dead or deadline -> Stopped. The link is an owned value, so
//!    even a deadline exit drops it cleanly.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};

use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::net::endpoint::Endpoint;
use crate::net::listener::Listener;
use crate::net::tls::{IoStatus, TlsSocket};
use crate::ppp::link::{LinkEvent, PppLink};
use crate::stack::{NetStack, StackEvent};
use crate::tunnel::forwarder::Forwarder;
use crate::tunnel::ListeningEvent;
use crate::util::Counters;

// ============================================================================
// Constants
// ============================================================================

const TUNNEL_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const FORWARDER_TOKEN_BASE: usize = 2;

/// Upper bound for one poll wait.
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Events per poll round.
const MAX_EVENTS: usize = 64;

/// Carrier read buffer.
const TUNNEL_READ_CHUNK: usize = 4096;

/// Grace period for forwarder RSTs to leave before the link closes.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Hard ceiling on waiting for the PPP link to die.
const DISCONNECT_DEADLINE: Duration = Duration::from_secs(50);

/// Global tunnel states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TunnelState {
    /// Link negotiation running.
    Connecting,
    /// Interface up, forwarders serviced.
    Running,
    /// Terminating: waiting for forwarder RSTs to drain.
    Closing,
    /// Link teardown in progress.
    Disconnecting,
    /// Loop exited.
    Stopped,
}

// ============================================================================
// Tunneler
// ============================================================================

/// The reactor. Constructed on the control thread, consumed by `run` on
/// the event-loop thread.
pub(crate) struct Tunneler {
    socket: TlsSocket,
    link: PppLink,
    stack: NetStack,
    listener: Listener,
    forwarders: Vec<Option<Forwarder>>,

    poll: Poll,
    state: TunnelState,

    remote: Endpoint,
    config: TunnelConfig,
    fallback_dns: Option<Ipv4Addr>,

    terminate: Arc<AtomicBool>,
    listening: Arc<ListeningEvent>,
    counters: Arc<Counters>,

    /// Carrier still usable; a dead carrier short-circuits teardown.
    carrier_alive: bool,

    // Registration caches: what each source is currently registered for.
    tunnel_interest: Option<Interest>,
    listener_registered: bool,
    forwarder_interest: Vec<Option<Interest>>,

    grace_deadline: Option<Instant>,
    hard_deadline: Option<Instant>,
}

impl Tunneler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mut socket: TlsSocket,
        listener: Listener,
        remote: Endpoint,
        config: TunnelConfig,
        fallback_dns: Option<Ipv4Addr>,
        terminate: Arc<AtomicBool>,
        listening: Arc<ListeningEvent>,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        // From here on the loop's poll owns the stream.
        socket.detach_waiter();

        Ok(Self {
            socket,
            link: PppLink::new(Instant::now()),
            stack: NetStack::new(),
            listener,
            forwarders: Vec::new(),
            poll: Poll::new()?,
            state: TunnelState::Connecting,
            remote,
            config,
            fallback_dns,
            terminate,
            listening,
            counters,
            carrier_alive: true,
            tunnel_interest: None,
            listener_registered: false,
            forwarder_interest: Vec::new(),
            grace_deadline: None,
            hard_deadline: None,
        })
    }

    /// Run to completion; returns once the tunnel reached Stopped.
    pub(crate) fn run(mut self) -> Result<()> {
        log::info!("starting tunnel to {}", self.remote);
        let mut events = Events::with_capacity(MAX_EVENTS);
        self.link.open(Instant::now());

        let mut result = Ok(());

        while self.state != TunnelState::Stopped {
            let now = Instant::now();

            self.update_registrations();
            let timeout = self.poll_timeout(now);

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                result = Err(Error::Io(e));
                break;
            }

            let now = Instant::now();

            // Readiness-driven work.
            for event in events.iter() {
                match event.token() {
                    TUNNEL_TOKEN => {
                        if event.is_writable() {
                            if let Err(e) = self.pump_tunnel_write(now) {
                                self.carrier_failed(&e);
                            }
                        }
                        if event.is_readable() {
                            if let Err(e) = self.pump_tunnel_read(now) {
                                self.carrier_failed(&e);
                            }
                        }
                    }
                    LISTENER_TOKEN => self.accept_client(now),
                    Token(token) => {
                        let index = token - FORWARDER_TOKEN_BASE;
                        if let Some(Some(forwarder)) = self.forwarders.get_mut(index) {
                            if event.is_readable() {
                                forwarder.handle_readable(&mut self.stack, now);
                            }
                            if event.is_writable() {
                                forwarder.handle_writable(&mut self.stack, now);
                            }
                        }
                    }
                }
            }

            // Internal flows: stack events to forwarders, forward-queue
            // pumping, stack output into the link. The reply flush runs
            // here too so fresh replies go out without waiting for a
            // writability edge on an already-writable socket.
            self.route_stack_events(now);
            for forwarder in self.forwarders.iter_mut().flatten() {
                forwarder.forward(&mut self.stack, now);
                forwarder.handle_writable(&mut self.stack, now);
                forwarder.tick(&mut self.stack, now);
            }

            self.stack.poll_timers(now);
            self.link.tick(now);
            self.drain_stack_output(now);
            self.handle_link_events(now);

            // Push whatever the tick produced towards the carrier.
            if self.carrier_alive && self.link.must_transmit() {
                if let Err(e) = self.pump_tunnel_write(now) {
                    self.carrier_failed(&e);
                }
            }

            self.reap_forwarders();
            self.advance_state(now);
        }

        log::info!("tunnel is down");
        self.listening.cancel();
        self.socket.close_notify();
        result
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn update_registrations(&mut self) {
        // Carrier: read always while alive, write when output is queued.
        let tunnel_interest = if self.carrier_alive {
            let mut interest = Interest::READABLE;
            if self.link.must_transmit() || self.socket.wants_write() {
                interest = interest | Interest::WRITABLE;
            }
            Some(interest)
        } else {
            None
        };
        Self::apply_interest(
            &self.poll,
            self.socket.stream_mut(),
            TUNNEL_TOKEN,
            tunnel_interest,
            &mut self.tunnel_interest,
        );

        // Listener: gated on link state, capacity and a single in-flight
        // connect.
        let accept_wanted = self.state == TunnelState::Running
            && self.link.is_up()
            && self.connected_count() < self.config.clamped_max_clients()
            && !self.any_connecting();
        let listener_interest = if accept_wanted {
            Some(Interest::READABLE)
        } else {
            None
        };
        let mut cache = if self.listener_registered {
            Some(Interest::READABLE)
        } else {
            None
        };
        Self::apply_interest(
            &self.poll,
            self.listener.source(),
            LISTENER_TOKEN,
            listener_interest,
            &mut cache,
        );
        self.listener_registered = cache.is_some();

        // Forwarders, per their flow-control predicates.
        self.forwarder_interest.resize(self.forwarders.len(), None);
        for (index, slot) in self.forwarders.iter_mut().enumerate() {
            let desired = slot.as_mut().and_then(|forwarder| {
                let read = forwarder.can_receive_data();
                let write = forwarder.has_data_to_reply();
                match (read, write) {
                    (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                    (true, false) => Some(Interest::READABLE),
                    (false, true) => Some(Interest::WRITABLE),
                    (false, false) => None,
                }
            });
            if let Some(forwarder) = slot {
                Self::apply_interest(
                    &self.poll,
                    forwarder.socket_mut(),
                    Token(FORWARDER_TOKEN_BASE + index),
                    desired,
                    &mut self.forwarder_interest[index],
                );
            }
        }
    }

    fn apply_interest<S: mio::event::Source>(
        poll: &Poll,
        source: &mut S,
        token: Token,
        desired: Option<Interest>,
        cache: &mut Option<Interest>,
    ) {
        let registry = poll.registry();
        let outcome = match (*cache, desired) {
            (None, Some(interest)) => registry.register(source, token, interest),
            (Some(old), Some(interest)) if old != interest => {
                registry.reregister(source, token, interest)
            }
            (Some(_), None) => registry.deregister(source),
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            log::warn!("poll registration failed for {:?}: {}", token, e);
        } else {
            *cache = desired;
        }
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        let mut timeout = MAX_POLL_TIMEOUT;

        if let Some(sleep) = self.stack.sleep_time(now) {
            timeout = timeout.min(sleep);
        }
        if let Some(sleep) = self.link.next_timeout(now) {
            timeout = timeout.min(sleep);
        }
        for forwarder in self.forwarders.iter().flatten() {
            if let Some(deadline) = forwarder.next_deadline() {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }
        }
        for deadline in [self.grace_deadline, self.hard_deadline].into_iter().flatten() {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }

        timeout
    }

    // ========================================================================
    // Carrier I/O
    // ========================================================================

    fn pump_tunnel_read(&mut self, now: Instant) -> Result<()> {
        let mut buf = [0u8; TUNNEL_READ_CHUNK];
        loop {
            match self.socket.recv(&mut buf)? {
                IoStatus::Done(n) => {
                    self.counters.add_received(n as u64);
                    let packets = self.link.input(&buf[..n], now)?;
                    for packet in packets {
                        self.stack.input(&packet, now);
                    }
                }
                IoStatus::Retry(_) => return Ok(()),
                IoStatus::Eof => {
                    return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            }
        }
    }

    fn pump_tunnel_write(&mut self, _now: Instant) -> Result<()> {
        loop {
            let outcome = {
                let Some(block) = self.link.out_queue().peek(usize::MAX) else {
                    break;
                };
                self.socket.send(block.data)?
            };
            match outcome {
                IoStatus::Done(n) => {
                    self.counters.add_sent(n as u64);
                    self.link.out_queue().advance(n);
                }
                IoStatus::Retry(_) => break,
                IoStatus::Eof => {
                    return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            }
        }
        Ok(())
    }

    fn carrier_failed(&mut self, error: &Error) {
        if self.carrier_alive {
            log::error!("tunnel carrier failed: {}", error);
            self.carrier_alive = false;
            self.terminate.store(true, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // Forwarders
    // ========================================================================

    fn accept_client(&mut self, now: Instant) {
        let accepted = match self.listener.accept() {
            Ok(Some(pair)) => pair,
            Ok(None) => return,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                return;
            }
        };

        let (stream, peer) = accepted;
        log::info!("client {} accepted", peer);
        let forwarder = Forwarder::open(
            stream,
            peer,
            self.remote.clone(),
            &self.config,
            &mut self.stack,
            now,
        );

        match self.forwarders.iter().position(Option::is_none) {
            Some(index) => self.forwarders[index] = Some(forwarder),
            None => self.forwarders.push(Some(forwarder)),
        }
    }

    fn route_stack_events(&mut self, now: Instant) {
        while let Some(event) = self.stack.poll_event() {
            match event {
                StackEvent::Tcp(handle, event) => {
                    let forwarder = self
                        .forwarders
                        .iter_mut()
                        .flatten()
                        .find(|f| f.pcb_handle() == Some(handle));
                    match forwarder {
                        Some(forwarder) => forwarder.on_pcb_event(event, &mut self.stack, now),
                        None => log::trace!("event for reaped pcb dropped"),
                    }
                }
                StackEvent::Dns(token, result) => {
                    let forwarder = self
                        .forwarders
                        .iter_mut()
                        .flatten()
                        .find(|f| f.dns_token() == Some(token));
                    if let Some(forwarder) = forwarder {
                        forwarder.on_dns(token, result, &mut self.stack, now);
                    }
                }
            }
        }
    }

    fn drain_stack_output(&mut self, now: Instant) {
        for packet in self.stack.take_output() {
            if !self.link.send_ipv4(&packet, now) {
                // The link is down or the queue is full; TCP recovers
                // user data, control packets are regenerated by timers.
                log::trace!("ip packet dropped on link input");
            }
        }
    }

    fn handle_link_events(&mut self, now: Instant) {
        while let Some(event) = self.link.poll_event() {
            match event {
                LinkEvent::Up(up) => {
                    log::info!(
                        "tunnel is up: ip={} gw={} mtu={}",
                        up.addr,
                        up.gateway,
                        up.mtu
                    );
                    self.stack.configure(up.addr, up.gateway, up.mtu, up.dns);
                    if let Some(secondary) = up.dns2 {
                        self.stack.add_nameserver(secondary);
                    }
                    if let Some(fallback) = self.fallback_dns {
                        self.stack.set_fallback_dns(fallback);
                    }
                    let _ = now;
                }
                LinkEvent::Down(reason) => {
                    log::info!("ppp link down: {}", reason);
                    if self.state == TunnelState::Connecting || self.state == TunnelState::Running
                    {
                        self.terminate.store(true, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    fn reap_forwarders(&mut self) {
        for (index, slot) in self.forwarders.iter_mut().enumerate() {
            let terminal = slot
                .as_ref()
                .is_some_and(|forwarder| forwarder.state().is_terminal());
            if terminal {
                if let Some(mut forwarder) = slot.take() {
                    if self.forwarder_interest.get(index).copied().flatten().is_some() {
                        let _ = self.poll.registry().deregister(forwarder.socket_mut());
                        self.forwarder_interest[index] = None;
                    }
                    log::debug!("forwarder for {} reaped", forwarder.peer());
                }
            }
        }
    }

    fn connected_count(&self) -> usize {
        use crate::tunnel::forwarder::ForwarderState;
        self.forwarders
            .iter()
            .flatten()
            .filter(|f| f.state() == ForwarderState::Connected)
            .count()
    }

    fn any_connecting(&self) -> bool {
        use crate::tunnel::forwarder::ForwarderState;
        self.forwarders
            .iter()
            .flatten()
            .any(|f| f.state() == ForwarderState::Connecting)
    }

    fn active_count(&self) -> usize {
        self.forwarders.iter().flatten().count()
    }

    // ========================================================================
    // Global state machine
    // ========================================================================

    fn advance_state(&mut self, now: Instant) {
        match self.state {
            TunnelState::Connecting => {
                if self.terminate.load(Ordering::Relaxed) {
                    self.enter_closing(now);
                } else if self.link.is_up() {
                    self.state = TunnelState::Running;
                    let local = self.listener.local_addr();
                    log::info!("listening on {}", local);
                    self.listening.set(local);
                }
            }

            TunnelState::Running => {
                if self.terminate.load(Ordering::Relaxed) {
                    self.enter_closing(now);
                }
            }

            TunnelState::Closing => {
                let grace_over = self.grace_deadline.is_some_and(|d| now >= d);
                if self.active_count() == 0 || grace_over {
                    self.state = TunnelState::Disconnecting;
                    self.link.close(now);
                    self.hard_deadline = Some(now + DISCONNECT_DEADLINE);
                    log::debug!("waiting for ppp link teardown");
                }
            }

            TunnelState::Disconnecting => {
                if self.link.dead() {
                    self.state = TunnelState::Stopped;
                } else if self.hard_deadline.is_some_and(|d| now >= d) {
                    log::warn!("ppp link did not terminate within the deadline");
                    self.state = TunnelState::Stopped;
                }
            }

            TunnelState::Stopped => {}
        }
    }

    fn enter_closing(&mut self, now: Instant) {
        log::debug!("closing tunnel");
        self.state = TunnelState::Closing;

        let mut aborted = 0;
        for forwarder in self.forwarders.iter_mut().flatten() {
            if !forwarder.state().is_terminal() {
                forwarder.abort(&mut self.stack, now);
                aborted += 1;
            }
        }
        // Give the RSTs a moment to leave through the stack and link.
        self.grace_deadline = Some(now + if aborted > 0 { ABORT_GRACE } else { Duration::ZERO });
        self.drain_stack_output(now);
    }
}
