// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error taxonomy.
//!
//! Components return typed results at their interfaces; the event loop
//! converts failures into state transitions and the caller sees one of the
//! variants below. No error is ever thrown across a thread boundary; the
//! control surface hands errors back by value.
//!
//! Taxonomy:
//!
//! - transport: [`Error::Io`], [`Error::Dns`]
//! - protocol: [`Error::Tls`], [`Error::Framing`], [`Error::Ppp`],
//!   [`Error::Http`], [`Error::UnexpectedRetCode`]
//! - policy: [`Error::AccessDenied`], [`Error::LoginCancelled`],
//!   [`Error::CertificateUntrusted`], [`Error::FingerprintMismatch`],
//!   [`Error::SamlRedirect`] (a delegation signal, not a failure)
//! - timeout: [`Error::Timeout`]
//!
//! User-visible message formatting is the caller's concern; `Display` here
//! is for logs.

use std::fmt;
use std::io;

use crate::ppp::frame::FramingError;
use crate::ppp::link::PppError;
use crate::portal::http::HttpError;
use crate::stack::dns::DnsError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the crate boundary.
#[derive(Debug)]
pub enum Error {
    /// OS-level socket failure.
    Io(io::Error),

    /// TLS layer failure (handshake, record processing).
    Tls(rustls::Error),

    /// In-tunnel name resolution failure.
    Dns(DnsError),

    /// The server certificate did not verify and the caller declined it.
    CertificateUntrusted,

    /// The carrier certificate changed across a reconnect.
    FingerprintMismatch,

    /// Fortinet framing violation; fatal to the session.
    Framing(FramingError),

    /// PPP negotiation or link failure; fatal to the session.
    Ppp(PppError),

    /// HTTP failure during the portal exchange.
    Http(HttpError),

    /// The portal redirected to an external identity provider. Carries
    /// the absolute URL; the caller is expected to drive it through a
    /// web view and hand the session cookie back.
    SamlRedirect(String),

    /// The firewall denied access; carries the server-provided reason.
    AccessDenied(String),

    /// The credential or code prompt was cancelled.
    LoginCancelled,

    /// The portal answered with a `ret` code outside the known alphabet.
    UnexpectedRetCode(i64),

    /// A bounded operation ran out of time; names the operation.
    Timeout(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Tls(e) => write!(f, "TLS error: {}", e),
            Self::Dns(e) => write!(f, "DNS error: {}", e),
            Self::CertificateUntrusted => write!(f, "server certificate not trusted"),
            Self::FingerprintMismatch => {
                write!(f, "certificate fingerprint mismatch on reconnect")
            }
            Self::Framing(e) => write!(f, "tunnel framing error: {}", e),
            Self::Ppp(e) => write!(f, "ppp link error: {}", e),
            Self::Http(e) => write!(f, "portal http error: {}", e),
            Self::SamlRedirect(url) => {
                write!(f, "saml authentication required at {}", url)
            }
            Self::AccessDenied(msg) => write!(f, "access denied: {}", msg),
            Self::LoginCancelled => write!(f, "login cancelled"),
            Self::UnexpectedRetCode(ret) => {
                write!(f, "unexpected portal return code {}", ret)
            }
            Self::Timeout(what) => write!(f, "timeout during {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Self::Framing(e)
    }
}

impl From<PppError> for Error {
    fn from(e: PppError) -> Self {
        Self::Ppp(e)
    }
}

impl From<HttpError> for Error {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl From<DnsError> for Error {
    fn from(e: DnsError) -> Self {
        Self::Dns(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_contains_cause() {
        let err = Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(err.to_string().contains("refused"));

        let err = Error::AccessDenied("bad user".into());
        assert!(err.to_string().contains("bad user"));
    }

    #[test]
    fn test_timeout_names_operation() {
        let err = Error::Timeout("tls handshake");
        assert!(err.to_string().contains("tls handshake"));
    }
}
