// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Quantified invariants of the byte queue, checked over randomized
//! operation sequences.

use fortitun::util::ChunkQueue;

#[test]
fn push_either_rejected_or_grows_by_exact_length() {
    let mut queue = ChunkQueue::new(128);

    for round in 0..2000 {
        let len = fastrand::usize(0..48);
        let chunk = vec![round as u8; len];
        let before = queue.len();

        if queue.push(chunk) {
            assert_eq!(queue.len(), before + len);
        } else {
            assert_eq!(queue.len(), before);
            assert!(before + len > queue.capacity());
        }
        assert!(queue.len() <= queue.capacity());

        // Drain a little to keep the sequence interesting.
        if fastrand::u8(0..3) == 0 {
            if let Some(block) = queue.peek(32) {
                let n = fastrand::usize(0..=block.data.len());
                assert!(queue.advance(n));
            }
        }
    }
}

#[test]
fn advance_sequence_lands_on_the_expected_byte() {
    let mut queue = ChunkQueue::new(1024);
    let data: Vec<u8> = (0..=255).collect();
    assert!(queue.push(data.clone()));

    // Any split of k into a1..an with sum k lands on byte k.
    let mut consumed = 0usize;
    while consumed < data.len() {
        let step = fastrand::usize(0..=(data.len() - consumed).min(17));
        assert!(queue.advance(step));
        consumed += step;

        if consumed < data.len() {
            let head = queue.peek(1).unwrap();
            assert_eq!(head.data[0], data[consumed]);
        }
        if step == 0 {
            // advance(0) must be a no-op for any queue state.
            let before = queue.len();
            assert!(queue.advance(0));
            assert_eq!(queue.len(), before);
            // Avoid spinning forever on zero steps.
            assert!(queue.advance(1.min(data.len() - consumed)));
            consumed += 1.min(data.len() - consumed);
        }
    }
    assert!(queue.is_empty());
}

#[test]
fn fifo_order_preserved_across_chunks() {
    let mut queue = ChunkQueue::new(4096);
    let mut expected = Vec::new();

    for i in 0..20u8 {
        let chunk: Vec<u8> = (0..fastrand::usize(1..64)).map(|j| i ^ (j as u8)).collect();
        expected.extend_from_slice(&chunk);
        assert!(queue.push(chunk));
    }

    let mut drained = Vec::new();
    while let Some(block) = queue.peek(fastrand::usize(1..32)) {
        let n = fastrand::usize(1..=block.data.len());
        drained.extend_from_slice(&block.data[..n]);
        assert!(queue.advance(n));
    }

    assert_eq!(drained, expected);
}

#[test]
fn head_never_empty_while_queue_nonempty() {
    let mut queue = ChunkQueue::new(256);
    queue.push(vec![1]);
    queue.push(vec![2, 3]);
    queue.push(vec![4, 5, 6]);

    while !queue.is_empty() {
        let block = queue.peek(usize::MAX).unwrap();
        assert!(!block.data.is_empty());
        assert!(queue.advance(block.data.len()));
    }
    assert!(queue.peek(1).is_none());
}
