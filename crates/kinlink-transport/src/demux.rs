//! # Inbound Demultiplexer
//!
//! Drains a non-blocking datagram socket, drops traffic from other sessions,
//! and routes each typed packet onto its delivery queue. Runs on the socket
//! thread; it touches nothing but the queues.

use bytes::Bytes;
use std::io;
use tracing::{debug, trace};

use crate::queue::{DeliveryQueue, InboundQueues};
use crate::socket::DatagramSocket;
use crate::stats::DemuxStats;
use crate::wire::{FloorPacket, PacketParser, SenderPacketType, WireCodec};
use crate::SessionId;

/// Routes inbound datagrams to per-type queues.
pub struct Demultiplexer<P = WireCodec> {
    session_id: SessionId,
    parser: P,
    queues: InboundQueues,
    floor: Option<DeliveryQueue<FloorPacket>>,
    stats: DemuxStats,
}

impl<P: PacketParser> Demultiplexer<P> {
    /// Create a demultiplexer for `session_id` feeding `queues`.
    pub fn new(session_id: SessionId, parser: P, queues: InboundQueues) -> Self {
        Demultiplexer {
            session_id,
            parser,
            queues,
            floor: None,
            stats: DemuxStats::default(),
        }
    }

    /// Route floor packets onto a caller-owned queue. Without one they are
    /// counted and dropped.
    pub fn with_floor_queue(mut self, floor: DeliveryQueue<FloorPacket>) -> Self {
        self.floor = Some(floor);
        self
    }

    /// One polling pass: receive until the socket reports nothing pending.
    ///
    /// Returns the number of packets routed. Socket faults other than
    /// "nothing pending" are returned as-is; packets routed before the fault
    /// stay queued.
    pub fn poll<S: DatagramSocket + ?Sized>(&mut self, socket: &S) -> io::Result<usize> {
        let mut routed = 0;
        while let Some(raw) = socket.try_recv()? {
            if self.route(raw) {
                routed += 1;
            }
        }
        Ok(routed)
    }

    /// Route a single datagram. Returns `false` if it was discarded.
    pub fn route(&mut self, raw: Bytes) -> bool {
        self.stats.datagrams += 1;
        self.stats.bytes += raw.len() as u64;

        let Some(header) = self.parser.parse_header(&raw) else {
            self.stats.malformed += 1;
            trace!(len = raw.len(), "dropping datagram with malformed header");
            return false;
        };

        if header.session_id != self.session_id {
            self.stats.session_mismatches += 1;
            debug!(
                expected = self.session_id,
                got = header.session_id,
                "dropping datagram from another session"
            );
            return false;
        }

        let outcome = match header.packet_type {
            SenderPacketType::Frame => self.parser.parse_video(raw).map(|f| {
                self.queues.video.push(f);
                self.stats.video_routed += 1;
                true
            }),
            SenderPacketType::Fec => self.parser.parse_parity(raw).map(|f| {
                self.queues.parity.push(f);
                self.stats.parity_routed += 1;
                true
            }),
            SenderPacketType::Audio => self.parser.parse_audio(raw).map(|f| {
                self.queues.audio.push(f);
                self.stats.audio_routed += 1;
                true
            }),
            SenderPacketType::Floor => self.parser.parse_floor(raw).map(|floor| match &self.floor {
                Some(queue) => {
                    queue.push(floor);
                    self.stats.floor_routed += 1;
                    true
                }
                None => {
                    self.stats.floor_dropped += 1;
                    false
                }
            }),
        };

        match outcome {
            Some(routed) => routed,
            None => {
                self.stats.malformed += 1;
                trace!(packet_type = ?header.packet_type, "dropping malformed packet body");
                false
            }
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Switch to a new session; traffic for the old one is discarded from
    /// now on.
    pub fn set_session_id(&mut self, session_id: SessionId) {
        self.session_id = session_id;
    }

    pub fn queues(&self) -> &InboundQueues {
        &self.queues
    }

    pub fn stats(&self) -> &DemuxStats {
        &self.stats
    }
}
