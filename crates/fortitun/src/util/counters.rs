// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel traffic counters.
//!
//! Counts raw bytes sent to and received from the carrier socket. The
//! event-loop thread updates them; any thread may read a snapshot through
//! the shared handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Byte counters for one tunnel session.
#[derive(Debug, Default)]
pub struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl Counters {
    /// Create a zeroed counter pair behind a shared handle.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record `n` bytes written to the carrier.
    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Record `n` bytes read from the carrier.
    pub fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot as `(sent, received)`.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counters = Counters::new_shared();

        counters.add_sent(10);
        counters.add_sent(5);
        counters.add_received(7);

        assert_eq!(counters.snapshot(), (15, 7));
    }

    #[test]
    fn test_counters_shared_across_threads() {
        let counters = Counters::new_shared();
        let clone = Arc::clone(&counters);

        let handle = std::thread::spawn(move || {
            for _ in 0..1000 {
                clone.add_received(1);
            }
        });
        handle.join().unwrap();

        assert_eq!(counters.snapshot().1, 1000);
    }
}
