//! # Transport Statistics
//!
//! Counters for each receive-side component. All are plain cumulative
//! counters, serializable for JSON dumps and Prometheus export.

use serde::Serialize;

// ─── Demux Stats ────────────────────────────────────────────────────────────

/// Inbound demultiplexer counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DemuxStats {
    /// Datagrams pulled off the socket.
    pub datagrams: u64,
    /// Bytes pulled off the socket.
    pub bytes: u64,
    pub video_routed: u64,
    pub parity_routed: u64,
    pub audio_routed: u64,
    pub floor_routed: u64,
    /// Floor packets dropped because no floor queue is attached.
    pub floor_dropped: u64,
    /// Datagrams carrying another session's id.
    pub session_mismatches: u64,
    /// Datagrams whose header or body failed to parse.
    pub malformed: u64,
}

impl DemuxStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets handed to a queue.
    pub fn routed(&self) -> u64 {
        self.video_routed + self.parity_routed + self.audio_routed + self.floor_routed
    }
}

// ─── Reassembly Stats ───────────────────────────────────────────────────────

/// Video reassembly engine counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReassemblyStats {
    /// Video fragments drained from the queue.
    pub fragments_received: u64,
    /// Parity fragments drained from the queue.
    pub parity_received: u64,
    /// Fragments (either kind) at or below the watermark.
    pub stale_fragments: u64,
    /// Video fragments for an already-filled slot.
    pub duplicate_fragments: u64,
    /// Fragments with an impossible index or a count that disagrees with
    /// their collection.
    pub invalid_fragments: u64,
    /// Fragments rebuilt from parity.
    pub fragments_recovered: u64,
    /// Retransmission requests emitted (including empty ones).
    pub requests_sent: u64,
    /// Fragment indices listed across all requests.
    pub indices_requested: u64,
    /// Frames emitted complete.
    pub frames_completed: u64,
    /// Incomplete frames discarded once the watermark passed them.
    pub frames_dropped: u64,
    /// Collections displaced from the window by a newer frame.
    pub frames_evicted: u64,
    /// Open video collections after the last pass.
    pub open_collections: u64,
}

impl ReassemblyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of requested-or-recovered fragments that parity repaired.
    pub fn recovery_ratio(&self) -> f64 {
        let total = self.fragments_recovered + self.indices_requested;
        if total == 0 {
            0.0
        } else {
            self.fragments_recovered as f64 / total as f64
        }
    }
}

// ─── Audio Stats ────────────────────────────────────────────────────────────

/// Audio collection engine counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioStats {
    /// Fragments drained from the queue.
    pub fragments_received: u64,
    /// Fragments decoded and written to playback.
    pub frames_played: u64,
    /// Fragments at or below the watermark.
    pub stale_fragments: u64,
    /// Fragments dropped because playback had no room.
    pub dropped_backpressure: u64,
    /// Fragments the decoder rejected.
    pub decode_failures: u64,
    /// Samples written to playback.
    pub samples_written: u64,
}

impl AudioStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of received fragments that reached playback.
    pub fn play_ratio(&self) -> f64 {
        if self.fragments_received == 0 {
            0.0
        } else {
            self.frames_played as f64 / self.fragments_received as f64
        }
    }
}
