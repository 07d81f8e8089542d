// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Credential buffers that are wiped on drop.
//!
//! Passwords, OTP codes and the form bodies built from them travel through
//! the login path as [`Secret`] values. The backing storage is zeroized
//! when the value is dropped, so a credential does not linger on the heap
//! for the lifetime of the process.

use std::fmt;

use zeroize::Zeroizing;

/// An opaque byte buffer zeroized on drop.
///
/// `Debug` and `Display` never reveal the content.
#[derive(Clone)]
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    /// Wrap the given bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Borrow the secret bytes.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        // Vec::from(String) reuses the allocation, nothing is left behind.
        Self::new(s.into_bytes())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(len={})", self.0.len())
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expose_round_trip() {
        let secret = Secret::from("hunter2");
        assert_eq!(secret.expose(), b"hunter2");
        assert_eq!(secret.len(), 7);
        assert!(!secret.is_empty());
    }

    #[test]
    fn test_debug_does_not_leak() {
        let secret = Secret::from("topsecret");
        let debug = format!("{:?}", secret);
        let display = format!("{}", secret);

        assert!(!debug.contains("topsecret"));
        assert!(!display.contains("topsecret"));
    }
}
