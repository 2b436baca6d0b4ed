//! # Video Reassembly Engine
//!
//! Pure logic, no I/O. Drains the video and parity queues, keeps one
//! fragment collection per in-flight frame, repairs single losses per XOR
//! group, queues retransmission requests for the rest, and emits completed
//! frames in frame-id order.
//!
//! ## Per pass
//!
//! 1. **Parity**: store every parity fragment above the watermark.
//! 2. **Video**: store every fragment above the watermark. The first fragment
//!    of a new frame triggers recovery on all older open frames, so a lost
//!    fragment waits roughly one frame interval before repair.
//! 3. **Recovery**: a missing index alone in its group is rebuilt from the
//!    group parity; everything else is listed in one retransmission request
//!    per frame (possibly empty, which marks the frame settled).
//! 4. **Completion**: full collections are concatenated and emitted.
//! 5. **Garbage collection**: collections at or below the watermark go.
//!
//! The caller advances the watermark from the emitted frame ids; frames that
//! never complete are skipped once a newer one is delivered.

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use tracing::{debug, trace};

use crate::fec::{group_count, group_of, group_range, recover_missing};
use crate::frame::VideoFrameMessage;
use crate::queue::{DeliveryQueue, InboundQueues};
use crate::stats::ReassemblyStats;
use crate::wire::{ParityFragment, RequestPacket, VideoFragment};
use crate::window::{Claim, FrameWindow};
use crate::FrameId;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Video reassembly parameters.
#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// Slots per frame window (video and parity each). Bounds the number of
    /// frames in flight.
    pub window_depth: usize,
    /// Largest `packet_count` accepted. Bounds the memory of one collection;
    /// the default admits frames of about 6 MB.
    pub max_packet_count: u32,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        ReassemblerConfig {
            window_depth: 64,
            max_packet_count: 4096,
        }
    }
}

// ─── Collections ────────────────────────────────────────────────────────────

/// In-progress assembly buffer for one frame.
#[derive(Debug)]
struct FrameCollection {
    slots: Vec<Option<Bytes>>,
    filled: u32,
    recovered: u32,
    first_arrival: Instant,
}

impl FrameCollection {
    fn new(packet_count: u32) -> Self {
        FrameCollection {
            slots: vec![None; packet_count as usize],
            filled: 0,
            recovered: 0,
            first_arrival: Instant::now(),
        }
    }

    fn packet_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Store a payload. Returns `false` if the slot was already filled.
    fn insert(&mut self, index: u32, payload: Bytes, recovered: bool) -> bool {
        let slot = &mut self.slots[index as usize];
        if slot.is_some() {
            return false;
        }
        *slot = Some(payload);
        self.filled += 1;
        if recovered {
            self.recovered += 1;
        }
        true
    }

    fn is_complete(&self) -> bool {
        self.filled == self.packet_count()
    }

    fn missing(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn into_message(self, frame_id: FrameId) -> VideoFrameMessage {
        let elapsed = self.first_arrival.elapsed();
        let total: usize = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for payload in self.slots.into_iter().flatten() {
            data.extend_from_slice(&payload);
        }
        VideoFrameMessage::new(frame_id, data.freeze()).with_collection(elapsed, self.recovered)
    }
}

/// Parity fragments of one frame, indexed by group.
#[derive(Debug)]
struct ParityCollection {
    packet_count: u32,
    groups: Vec<Option<Bytes>>,
}

impl ParityCollection {
    fn new(packet_count: u32) -> Self {
        ParityCollection {
            packet_count,
            groups: vec![None; group_count(packet_count) as usize],
        }
    }
}

// ─── Reassembler ────────────────────────────────────────────────────────────

/// Video reassembly engine. Owned by the processing thread.
pub struct VideoReassembler {
    video_queue: DeliveryQueue<VideoFragment>,
    parity_queue: DeliveryQueue<ParityFragment>,
    collections: FrameWindow<FrameCollection>,
    parity: FrameWindow<ParityCollection>,
    requests: Vec<RequestPacket>,
    max_packet_count: u32,
    stats: ReassemblyStats,
}

impl VideoReassembler {
    /// Create an engine draining the video and parity queues of `queues`.
    pub fn new(config: ReassemblerConfig, queues: &InboundQueues) -> Self {
        VideoReassembler {
            video_queue: queues.video.clone(),
            parity_queue: queues.parity.clone(),
            collections: FrameWindow::new(config.window_depth),
            parity: FrameWindow::new(config.window_depth),
            requests: Vec::new(),
            max_packet_count: config.max_packet_count,
            stats: ReassemblyStats::default(),
        }
    }

    /// Run one reassembly pass against the delivered-frame watermark.
    ///
    /// Returns completed frames in ascending frame-id order. Retransmission
    /// requests produced by the pass are available from
    /// [`drain_requests`](Self::drain_requests).
    pub fn reassemble(&mut self, last_video_frame_id: FrameId) -> Vec<(FrameId, VideoFrameMessage)> {
        // Parity first so recovery below can use it.
        for fragment in self.parity_queue.drain() {
            self.ingest_parity(fragment, last_video_frame_id);
        }
        for fragment in self.video_queue.drain() {
            self.ingest_video(fragment, last_video_frame_id);
        }

        let completed = self.extract_complete();
        self.collect_garbage(last_video_frame_id);
        self.stats.open_collections = self.collections.len() as u64;
        completed
    }

    fn ingest_parity(&mut self, fragment: ParityFragment, watermark: FrameId) {
        self.stats.parity_received += 1;
        if fragment.frame_id <= watermark {
            self.stats.stale_fragments += 1;
            return;
        }
        let count = fragment.packet_count;
        let disagrees = self
            .collections
            .get(fragment.frame_id)
            .is_some_and(|c| c.packet_count() != count);
        if count == 0
            || count > self.max_packet_count
            || fragment.group_index >= group_count(count)
            || disagrees
        {
            self.stats.invalid_fragments += 1;
            trace!(
                frame_id = fragment.frame_id,
                group = fragment.group_index,
                packet_count = count,
                "invalid parity fragment"
            );
            return;
        }

        match self.parity.claim(fragment.frame_id, || ParityCollection::new(count)) {
            Claim::Superseded => {
                self.stats.stale_fragments += 1;
                return;
            }
            Claim::Evicted(old) => trace!(old, frame_id = fragment.frame_id, "parity window slot reused"),
            Claim::Existing | Claim::Created => {}
        }

        let Some(collection) = self.parity.get_mut(fragment.frame_id) else {
            return;
        };
        if collection.packet_count != count {
            self.stats.invalid_fragments += 1;
            return;
        }
        collection.groups[fragment.group_index as usize] = Some(fragment.payload);
    }

    fn ingest_video(&mut self, fragment: VideoFragment, watermark: FrameId) {
        self.stats.fragments_received += 1;
        let frame_id = fragment.frame_id;
        if frame_id <= watermark {
            self.stats.stale_fragments += 1;
            return;
        }
        if fragment.packet_index >= fragment.packet_count
            || fragment.packet_count > self.max_packet_count
        {
            self.stats.invalid_fragments += 1;
            trace!(
                frame_id,
                index = fragment.packet_index,
                packet_count = fragment.packet_count,
                "invalid video fragment"
            );
            return;
        }

        let count = fragment.packet_count;
        match self.collections.claim(frame_id, || FrameCollection::new(count)) {
            Claim::Existing => {}
            Claim::Superseded => {
                self.stats.stale_fragments += 1;
                return;
            }
            claim => {
                if let Claim::Evicted(old) = claim {
                    self.stats.frames_evicted += 1;
                    debug!(evicted = old, frame_id, "frame window full, evicting oldest frame");
                }
                trace!(frame_id, packet_count = count, "new frame collection");
                for older in self.collections.frame_ids() {
                    if older < frame_id {
                        self.recover(older);
                    }
                }
            }
        }

        let Some(collection) = self.collections.get_mut(frame_id) else {
            return;
        };
        if collection.packet_count() != count {
            self.stats.invalid_fragments += 1;
            return;
        }
        if !collection.insert(fragment.packet_index, fragment.payload, false) {
            self.stats.duplicate_fragments += 1;
        }
    }

    /// Repair what parity can repair in `frame_id`'s collection and queue a
    /// request for the rest.
    fn recover(&mut self, frame_id: FrameId) {
        let Some(collection) = self.collections.get_mut(frame_id) else {
            return;
        };
        let missing = collection.missing();
        let (single, mut unrecoverable): (Vec<u32>, Vec<u32>) = missing
            .iter()
            .copied()
            .partition(|&i| !missing.iter().any(|&j| j != i && group_of(j) == group_of(i)));

        // Parity counted against a different fragment count covers other groups.
        let parity = self
            .parity
            .get(frame_id)
            .filter(|p| p.packet_count == collection.packet_count());
        for index in single {
            let group = group_of(index);
            let Some(parity_payload) = parity.and_then(|p| p.groups.get(group as usize)?.as_ref())
            else {
                unrecoverable.push(index);
                continue;
            };
            let rebuilt = recover_missing(
                parity_payload,
                group_range(group, collection.packet_count())
                    .filter(|&i| i != index)
                    .filter_map(|i| collection.slots[i as usize].as_deref()),
            );
            collection.insert(index, rebuilt, true);
            self.stats.fragments_recovered += 1;
            debug!(frame_id, index, "recovered fragment from parity");
        }

        unrecoverable.sort_unstable();
        if !unrecoverable.is_empty() {
            debug!(frame_id, missing = ?unrecoverable, "requesting retransmission");
        }
        self.stats.requests_sent += 1;
        self.stats.indices_requested += unrecoverable.len() as u64;
        self.requests.push(RequestPacket {
            frame_id,
            missing: unrecoverable,
        });
    }

    fn extract_complete(&mut self) -> Vec<(FrameId, VideoFrameMessage)> {
        let mut completed = Vec::new();
        for frame_id in self.collections.frame_ids() {
            if !self.collections.get(frame_id).is_some_and(FrameCollection::is_complete) {
                continue;
            }
            if let Some(collection) = self.collections.remove(frame_id) {
                self.parity.remove(frame_id);
                let message = collection.into_message(frame_id);
                trace!(
                    frame_id,
                    bytes = message.payload().len(),
                    recovered = message.recovered_fragments(),
                    "frame complete"
                );
                self.stats.frames_completed += 1;
                completed.push((frame_id, message));
            }
        }
        completed
    }

    fn collect_garbage(&mut self, watermark: FrameId) {
        let dropped = self.collections.retain(|id, _| id > watermark);
        if dropped > 0 {
            debug!(dropped, watermark, "dropped superseded incomplete frames");
        }
        self.stats.frames_dropped += dropped as u64;
        self.parity.retain(|id, _| id > watermark);
    }

    /// Drain retransmission requests produced so far.
    pub fn drain_requests(&mut self) -> impl Iterator<Item = RequestPacket> + '_ {
        self.requests.drain(..)
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Frame ids with an open (incomplete) collection, ascending.
    pub fn open_frames(&self) -> Vec<FrameId> {
        self.collections.frame_ids()
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }
}
