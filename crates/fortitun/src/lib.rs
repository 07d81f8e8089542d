// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # fortitun - SSL-VPN tunnel client for Fortinet firewalls
//!
//! Establishes an SSL-VPN session against a Fortigate, runs PPP inside
//! the Fortinet-framed TLS stream, and forwards a local TCP listener to
//! a single host behind the firewall, so an unmodified application
//! (typically a remote-desktop client) can reach it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fortitun::config::{TlsSettings, TunnelConfig};
//! use fortitun::net::Endpoint;
//! use fortitun::portal::login::{Credentials, LoginPrompts};
//! use fortitun::portal::PortalClient;
//! use fortitun::tunnel::Tunnel;
//! use fortitun::util::Secret;
//!
//! struct Console;
//! impl LoginPrompts for Console {
//!     fn ask_credentials(&mut self) -> Option<Credentials> {
//!         Some(Credentials { username: "alice".into(), password: Secret::from("secret") })
//!     }
//!     fn ask_code(&mut self, _prompt: &str) -> Option<Secret> {
//!         None
//!     }
//! }
//!
//! fn main() -> fortitun::Result<()> {
//!     let firewall = Endpoint::new("fw.example.com", 10443);
//!     let mut portal = PortalClient::open(&firewall, &TlsSettings::strict(), None, None)?;
//!     portal.login(&mut Console)?;
//!
//!     let socket = portal.start_tunnel_mode()?;
//!     let tunnel = Tunnel::start(
//!         socket,
//!         Endpoint::new("192.168.1.10", 3389),
//!         0,
//!         TunnelConfig::default(),
//!         None,
//!     )?;
//!
//!     let local = tunnel.wait_listening(std::time::Duration::from_secs(30));
//!     println!("connect your client to {:?}", local);
//!     // ... run the client ...
//!     tunnel.terminate();
//!     tunnel.join()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                        Control surface                           |
//! |    PortalClient (login, tunnel promotion) | Tunnel (handle)      |
//! +------------------------------------------------------------------+
//! |                     Tunnel event loop (one thread)               |
//! |    TLS carrier | PPP link (LCP/IPCP) | forwarders | listener     |
//! +------------------------------------------------------------------+
//! |                     Embedded IPv4/TCP stack                      |
//! |    PCB arena | DNS resolver | ICMP echo                          |
//! +------------------------------------------------------------------+
//! |                     Wire                                         |
//! |    TLS 1.2/1.3 -> [len|0x5050|len] framing -> PPP -> IPv4/TCP    |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`portal::PortalClient`] | Authenticates and promotes the connection to tunnel mode |
//! | [`tunnel::Tunnel`] | Handle to a running tunnel session |
//! | [`config::TunnelConfig`] | Per-session options (nodelay, clients, timeouts) |
//! | [`net::Endpoint`] | `host:port` pair for either side of the tunnel |
//! | [`error::Error`] | Crate-wide error taxonomy |
//!
//! ## Modules Overview
//!
//! - [`portal`] - SSL-VPN login over the carrier (start here)
//! - [`tunnel`] - event loop, forwarders, control surface
//! - [`ppp`] - Fortinet framing and the LCP/IPCP link
//! - [`stack`] - the embedded single-threaded IPv4/TCP stack
//! - [`net`] - TLS carrier socket, listener, endpoints
//! - [`util`] - chunk queue, counters, secret buffers

/// Tunnel and TLS configuration.
pub mod config;
/// Crate-wide error taxonomy.
pub mod error;
/// Socket-layer building blocks (endpoints, listener, TLS carrier).
pub mod net;
/// SSL-VPN portal login and tunnel promotion.
pub mod portal;
/// Fortinet framing and the PPP link state machine.
pub mod ppp;
/// Embedded IPv4/TCP stack bound to the PPP interface.
pub mod stack;
/// Tunnel event loop, forwarders and control surface.
pub mod tunnel;
/// Shared utilities.
pub mod util;

pub use config::{TlsSettings, TunnelConfig};
pub use error::{Error, Result};
pub use net::Endpoint;
pub use portal::PortalClient;
pub use tunnel::Tunnel;
