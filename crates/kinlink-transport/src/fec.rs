//! # XOR Forward Error Correction
//!
//! Each frame's fragments are partitioned into groups of [`XOR_GROUP_SIZE`]
//! consecutive indices, and the sender emits one parity fragment per group:
//! the byte-wise XOR of every fragment in it. Since XOR of the whole group
//! (parity included) is zero, XOR-ing the parity with all but one member
//! yields the remaining member. One loss per group is repairable; two are not.
//!
//! The receiver side of this lives in [`crate::video`]; the sender-side
//! [`split_message`] and [`ParityEncoder`] are here so tools and tests can
//! produce real traffic.

use bytes::{Bytes, BytesMut};
use std::ops::Range;

use crate::wire::{ParityFragment, VideoFragment};
use crate::FrameId;

/// Fragments covered by one parity fragment.
pub const XOR_GROUP_SIZE: u32 = 5;

// ─── Group Arithmetic ───────────────────────────────────────────────────────

/// Group containing `packet_index`.
#[inline]
pub fn group_of(packet_index: u32) -> u32 {
    packet_index / XOR_GROUP_SIZE
}

/// Number of parity groups for a frame of `packet_count` fragments.
#[inline]
pub fn group_count(packet_count: u32) -> u32 {
    packet_count.div_ceil(XOR_GROUP_SIZE)
}

/// Fragment indices covered by `group`, clipped to `packet_count`.
#[inline]
pub fn group_range(group: u32, packet_count: u32) -> Range<u32> {
    let start = group * XOR_GROUP_SIZE;
    let end = (start + XOR_GROUP_SIZE).min(packet_count);
    start..end
}

/// `dst[i] ^= src[i]` over the common prefix.
///
/// A shorter `src` behaves as if zero-padded.
#[inline]
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

// ─── Sender Side ────────────────────────────────────────────────────────────

/// Split a frame message into fixed-size fragments.
///
/// The last fragment is zero-padded to `payload_size` so every block in the
/// frame has the same length. An empty message still yields one fragment.
///
/// # Panics
///
/// Panics if `payload_size` is zero.
pub fn split_message(frame_id: FrameId, message: &[u8], payload_size: usize) -> Vec<VideoFragment> {
    assert!(payload_size > 0, "payload_size must be > 0");
    let packet_count = message.len().div_ceil(payload_size).max(1) as u32;

    (0..packet_count)
        .map(|i| {
            let start = i as usize * payload_size;
            let end = (start + payload_size).min(message.len());
            let mut block = BytesMut::zeroed(payload_size);
            if start < end {
                block[..end - start].copy_from_slice(&message[start..end]);
            }
            VideoFragment {
                frame_id,
                packet_index: i,
                packet_count,
                payload: block.freeze(),
            }
        })
        .collect()
}

/// Builds one parity fragment per [`XOR_GROUP_SIZE`] group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParityEncoder;

impl ParityEncoder {
    pub fn new() -> Self {
        ParityEncoder
    }

    /// Compute parity for a complete, index-ordered fragment list.
    pub fn encode(&self, fragments: &[VideoFragment]) -> Vec<ParityFragment> {
        let Some(first) = fragments.first() else {
            return Vec::new();
        };
        let packet_count = fragments.len() as u32;
        let block_len = fragments.iter().map(|f| f.payload.len()).max().unwrap_or(0);

        (0..group_count(packet_count))
            .map(|group| {
                let mut parity = BytesMut::zeroed(block_len);
                for idx in group_range(group, packet_count) {
                    xor_into(&mut parity, &fragments[idx as usize].payload);
                }
                ParityFragment {
                    frame_id: first.frame_id,
                    group_index: group,
                    packet_count,
                    payload: parity.freeze(),
                }
            })
            .collect()
    }
}

/// XOR `parity` with `others` to rebuild the one missing group member.
pub fn recover_missing<'a>(parity: &[u8], others: impl IntoIterator<Item = &'a [u8]>) -> Bytes {
    let mut out = BytesMut::from(parity);
    for member in others {
        xor_into(&mut out, member);
    }
    out.freeze()
}
