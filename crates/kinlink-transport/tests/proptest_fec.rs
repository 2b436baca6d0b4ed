//! Property-based tests for XOR recovery inside the reassembly engine.
//!
//! These tests verify recovery and retransmission behavior across varied
//! frame sizes, loss patterns and arrival orders.

use bytes::Bytes;
use proptest::prelude::*;
use std::collections::BTreeSet;

use kinlink_transport::fec::{group_of, split_message, ParityEncoder, XOR_GROUP_SIZE};
use kinlink_transport::queue::InboundQueues;
use kinlink_transport::video::{ReassemblerConfig, VideoReassembler};
use kinlink_transport::wire::{ParityFragment, VideoFragment};
use kinlink_transport::NO_FRAME;

const BLOCK: usize = 64;

fn message(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn padded(fragments: &[VideoFragment]) -> Bytes {
    fragments.iter().flat_map(|f| f.payload.to_vec()).collect::<Vec<u8>>().into()
}

fn engine() -> (InboundQueues, VideoReassembler) {
    let queues = InboundQueues::new();
    let rx = VideoReassembler::new(ReassemblerConfig::default(), &queues);
    (queues, rx)
}

/// Push frame 0 minus `lost`, all its parity, then the first fragment of
/// frame 1 to trigger recovery.
fn run_with_loss(fragments: &[VideoFragment], lost: &BTreeSet<u32>) -> (InboundQueues, VideoReassembler) {
    let (q, rx) = engine();
    for p in ParityEncoder::new().encode(fragments) {
        q.parity.push(p);
    }
    for f in fragments.iter().filter(|f| !lost.contains(&f.packet_index)) {
        q.video.push(f.clone());
    }
    q.video.push(split_message(1, &[1, 2, 3], BLOCK).remove(0));
    (q, rx)
}

// ─── Single Loss Per Group ───────────────────────────────────────────────────

proptest! {
    /// With every group's parity present, any pattern of at most one loss per
    /// group is repaired byte-for-byte and the settling request is empty.
    #[test]
    fn one_loss_per_group_always_recovers(
        len in 1usize..=40 * BLOCK,
        seed in any::<u8>(),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let fragments = split_message(0, &message(len, seed), BLOCK);
        let count = fragments[0].packet_count;

        let mut lost = BTreeSet::new();
        for pick in &picks {
            let idx = pick.index(count as usize) as u32;
            let clashes = lost.iter().any(|&l| group_of(l) == group_of(idx));
            // Keep at least one fragment so the frame has a collection.
            if !clashes && lost.len() + 1 < count as usize {
                lost.insert(idx);
            }
        }

        let (_q, mut rx) = run_with_loss(&fragments, &lost);
        let out = rx.reassemble(NO_FRAME);

        prop_assert_eq!(out[0].0, 0);
        prop_assert_eq!(out[0].1.payload(), &padded(&fragments));
        prop_assert_eq!(out[0].1.recovered_fragments() as usize, lost.len());
        let requests: Vec<_> = rx.drain_requests().collect();
        prop_assert_eq!(requests.len(), 1);
        prop_assert!(requests[0].missing.is_empty());
    }
}

// ─── Arbitrary Loss ──────────────────────────────────────────────────────────

proptest! {
    /// For any loss pattern, exactly the indices sharing a group with another
    /// loss are requested; everything else is recovered.
    #[test]
    fn request_lists_exactly_multi_loss_groups(
        count in 1u32..=30,
        lost in prop::collection::btree_set(0u32..30, 0..12),
    ) {
        let lost: BTreeSet<u32> = lost.into_iter().filter(|&i| i < count).collect();
        prop_assume!(lost.len() < count as usize);
        let fragments = split_message(0, &message(count as usize * BLOCK, 7), BLOCK);
        prop_assert_eq!(fragments.len() as u32, count);

        let (_q, mut rx) = run_with_loss(&fragments, &lost);
        let out = rx.reassemble(NO_FRAME);

        let expected: Vec<u32> = lost
            .iter()
            .copied()
            .filter(|&i| lost.iter().filter(|&&j| group_of(j) == group_of(i)).count() > 1)
            .collect();
        let requests: Vec<_> = rx.drain_requests().collect();
        prop_assert_eq!(&requests[0].missing, &expected);
        prop_assert_eq!(
            rx.stats().fragments_recovered as usize,
            lost.len() - expected.len()
        );

        let frame0_done = out.iter().any(|(id, _)| *id == 0);
        prop_assert_eq!(frame0_done, expected.is_empty());
    }
}

// ─── Stray Parity ────────────────────────────────────────────────────────────

proptest! {
    /// Parity fragments with arbitrary group index and packet count, arriving
    /// ahead of a frame's genuine parity, never crash the engine and never
    /// yield wrong bytes: every lost fragment is either rebuilt exactly or
    /// requested.
    #[test]
    fn stray_parity_never_corrupts_or_panics(
        count in 1u32..=30,
        lost in prop::collection::btree_set(0u32..30, 0..12),
        strays in prop::collection::vec((any::<u32>(), any::<u32>()), 1..6),
    ) {
        let lost: BTreeSet<u32> = lost.into_iter().filter(|&i| i < count).collect();
        prop_assume!(lost.len() < count as usize);
        let fragments = split_message(0, &message(count as usize * BLOCK, 9), BLOCK);

        let (q, mut rx) = engine();
        for (group_index, packet_count) in strays.into_iter().filter(|&(_, c)| c != count) {
            q.parity.push(ParityFragment {
                frame_id: 0,
                group_index,
                packet_count,
                payload: Bytes::from(vec![0xA5; BLOCK]),
            });
        }
        for p in ParityEncoder::new().encode(&fragments) {
            q.parity.push(p);
        }
        for f in fragments.iter().filter(|f| !lost.contains(&f.packet_index)) {
            q.video.push(f.clone());
        }
        q.video.push(split_message(1, &[1, 2, 3], BLOCK).remove(0));

        let out = rx.reassemble(NO_FRAME);
        let requests: Vec<_> = rx.drain_requests().collect();
        prop_assert_eq!(requests[0].frame_id, 0);
        prop_assert!(requests[0].missing.iter().all(|i| lost.contains(i)));
        prop_assert_eq!(
            rx.stats().fragments_recovered as usize + requests[0].missing.len(),
            lost.len()
        );
        if let Some((_, frame)) = out.iter().find(|(id, _)| *id == 0) {
            prop_assert_eq!(frame.payload(), &padded(&fragments));
        }
    }
}

// ─── Arrival Order ───────────────────────────────────────────────────────────

proptest! {
    /// Without loss, arrival order and duplication never change the output.
    #[test]
    fn any_arrival_order_completes(
        len in 1usize..=20 * BLOCK,
        order in any::<u64>(),
        dupes in 0usize..5,
    ) {
        let fragments = split_message(4, &message(len, 3), BLOCK);
        let mut arrivals: Vec<VideoFragment> = fragments.clone();
        arrivals.extend(fragments.iter().take(dupes).cloned());
        // Deterministic shuffle from the drawn seed.
        let mut state = order | 1;
        for i in (1..arrivals.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            arrivals.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let (q, mut rx) = engine();
        for f in arrivals {
            q.video.push(f);
        }
        let out = rx.reassemble(NO_FRAME);
        prop_assert_eq!(out.len(), 1);
        prop_assert_eq!(out[0].1.payload(), &padded(&fragments));
        prop_assert!(rx.open_frames().is_empty());
    }

    /// Nothing at or below the watermark ever opens a collection.
    #[test]
    fn stale_fragments_never_collected(
        watermark in 0i32..1000,
        below in 0i32..1000,
    ) {
        let frame_id = below.min(watermark);
        let (q, mut rx) = engine();
        for f in split_message(frame_id, &message(3 * BLOCK, 1), BLOCK) {
            q.video.push(f);
        }
        for p in ParityEncoder::new().encode(&split_message(frame_id, &message(BLOCK, 1), BLOCK)) {
            q.parity.push(p);
        }
        prop_assert!(rx.reassemble(watermark).is_empty());
        prop_assert!(rx.open_frames().is_empty());
        prop_assert_eq!(rx.stats().stale_fragments, 4);
    }
}

#[test]
fn group_size_is_five() {
    assert_eq!(XOR_GROUP_SIZE, 5);
}
