//! # Kinlink Wire Format
//!
//! Typed packet records and the [`PacketParser`] seam the demultiplexer and
//! reassembler are written against. [`WireCodec`] is the concrete byte
//! layout spoken by the sender; all integers are little-endian.
//!
//! ## Sender packets
//!
//! ```text
//! +----------------+------+------------------------------------------+
//! | session_id i32 | type | body                                     |
//! +----------------+------+------------------------------------------+
//!   Frame / Fec : frame_id i32 | index i32 | packet_count i32 | payload
//!   Audio       : frame_id i32 | payload_len i32 | payload
//!   Floor       : a f32 | b f32 | c f32 | d f32
//! ```
//!
//! ## Receiver packets
//!
//! ```text
//!   Connect : (header only)
//!   Report  : frame_id i32 | decoder_time_ms f32 | frame_interval_ms f32
//!   Request : frame_id i32 | count i32 | count × packet_index i32
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{FrameId, SessionId};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Largest datagram the sender emits.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Session id (4) + type tag (1).
pub const HEADER_SIZE: usize = 5;

/// Header + frame_id (4) + index (4) + packet_count (4).
pub const FRAGMENT_HEADER_SIZE: usize = HEADER_SIZE + 12;

/// Payload bytes carried by every video and parity fragment.
pub const FRAGMENT_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - FRAGMENT_HEADER_SIZE;

// ─── Packet Types ────────────────────────────────────────────────────────────

/// Type tag of a datagram sent by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SenderPacketType {
    Frame = 0,
    Fec = 1,
    Audio = 2,
    Floor = 3,
}

impl SenderPacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(SenderPacketType::Frame),
            1 => Some(SenderPacketType::Fec),
            2 => Some(SenderPacketType::Audio),
            3 => Some(SenderPacketType::Floor),
            _ => None,
        }
    }
}

/// Type tag of a datagram sent by this receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReceiverPacketType {
    Connect = 0,
    Report = 1,
    Request = 2,
}

impl ReceiverPacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ReceiverPacketType::Connect),
            1 => Some(ReceiverPacketType::Report),
            2 => Some(ReceiverPacketType::Request),
            _ => None,
        }
    }
}

// ─── Header ──────────────────────────────────────────────────────────────────

/// Common prefix of every sender datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderHeader {
    pub session_id: SessionId,
    pub packet_type: SenderPacketType,
}

impl SenderHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.session_id);
        buf.put_u8(self.packet_type as u8);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < HEADER_SIZE {
            return None;
        }
        let session_id = buf.get_i32_le();
        let packet_type = SenderPacketType::from_byte(buf.get_u8())?;
        Some(SenderHeader {
            session_id,
            packet_type,
        })
    }
}

/// Read a non-negative `i32` as `u32`.
fn get_count(buf: &mut impl Buf) -> Option<u32> {
    if buf.remaining() < 4 {
        return None;
    }
    u32::try_from(buf.get_i32_le()).ok()
}

// ─── Sender Records ─────────────────────────────────────────────────────────

/// One fixed-size slice of a video frame message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFragment {
    pub frame_id: FrameId,
    /// Position within the frame, `0..packet_count`.
    pub packet_index: u32,
    /// Total fragments making up the frame.
    pub packet_count: u32,
    pub payload: Bytes,
}

impl VideoFragment {
    /// Encode the body (everything after the header).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.frame_id);
        buf.put_i32_le(self.packet_index as i32);
        buf.put_i32_le(self.packet_count as i32);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode the body. The remaining bytes become the payload (zero-copy).
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let frame_id = buf.get_i32_le();
        let packet_index = get_count(buf)?;
        let packet_count = get_count(buf)?;
        if packet_index >= packet_count {
            return None;
        }
        let payload = buf.split_to(buf.remaining());
        Some(VideoFragment {
            frame_id,
            packet_index,
            packet_count,
            payload,
        })
    }
}

/// XOR of up to [`crate::fec::XOR_GROUP_SIZE`] consecutive fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParityFragment {
    pub frame_id: FrameId,
    /// Group this parity covers: indices `[g·G, min((g+1)·G, packet_count))`.
    pub group_index: u32,
    /// Video fragment count of the frame (not the parity count).
    pub packet_count: u32,
    pub payload: Bytes,
}

impl ParityFragment {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.frame_id);
        buf.put_i32_le(self.group_index as i32);
        buf.put_i32_le(self.packet_count as i32);
        buf.extend_from_slice(&self.payload);
    }

    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let frame_id = buf.get_i32_le();
        let group_index = get_count(buf)?;
        let packet_count = get_count(buf)?;
        if packet_count == 0 {
            return None;
        }
        let payload = buf.split_to(buf.remaining());
        Some(ParityFragment {
            frame_id,
            group_index,
            packet_count,
            payload,
        })
    }
}

/// One independently decodable audio unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFragment {
    pub frame_id: FrameId,
    pub payload: Bytes,
}

impl AudioFragment {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.frame_id);
        buf.put_i32_le(self.payload.len() as i32);
        buf.extend_from_slice(&self.payload);
    }

    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let frame_id = buf.get_i32_le();
        let len = get_count(buf)? as usize;
        if buf.remaining() < len {
            return None;
        }
        let payload = buf.split_to(len);
        Some(AudioFragment { frame_id, payload })
    }
}

/// Floor plane estimate forwarded to the caller untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloorPacket {
    /// Plane `a·x + b·y + c·z + d = 0`.
    pub plane: [f32; 4],
}

impl FloorPacket {
    pub fn encode(&self, buf: &mut impl BufMut) {
        for v in self.plane {
            buf.put_f32_le(v);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 16 {
            return None;
        }
        let mut plane = [0f32; 4];
        for v in plane.iter_mut() {
            *v = buf.get_f32_le();
        }
        Some(FloorPacket { plane })
    }
}

// ─── Receiver Records ───────────────────────────────────────────────────────

/// Retransmission request for the fragments parity could not repair.
///
/// An empty `missing` list is legal and marks the frame as settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    pub frame_id: FrameId,
    pub missing: Vec<u32>,
}

impl RequestPacket {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.frame_id);
        buf.put_i32_le(self.missing.len() as i32);
        for &idx in &self.missing {
            buf.put_i32_le(idx as i32);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let frame_id = buf.get_i32_le();
        let count = get_count(buf)? as usize;
        if buf.remaining() < count * 4 {
            return None;
        }
        let mut missing = Vec::with_capacity(count);
        for _ in 0..count {
            missing.push(get_count(buf)?);
        }
        Some(RequestPacket { frame_id, missing })
    }
}

/// Per-frame feedback the sender uses to summarise receiver health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportPacket {
    pub frame_id: FrameId,
    pub decoder_time_ms: f32,
    pub frame_interval_ms: f32,
}

impl ReportPacket {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.frame_id);
        buf.put_f32_le(self.decoder_time_ms);
        buf.put_f32_le(self.frame_interval_ms);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 12 {
            return None;
        }
        Some(ReportPacket {
            frame_id: buf.get_i32_le(),
            decoder_time_ms: buf.get_f32_le(),
            frame_interval_ms: buf.get_f32_le(),
        })
    }
}

// ─── Parser Seam ────────────────────────────────────────────────────────────

/// Turns raw datagrams into typed records, and receiver records into bytes.
///
/// Every `parse_*` returns `None` for malformed input; the caller treats
/// that as protocol noise.
pub trait PacketParser {
    fn parse_header(&self, raw: &[u8]) -> Option<SenderHeader>;
    fn parse_video(&self, raw: Bytes) -> Option<VideoFragment>;
    fn parse_parity(&self, raw: Bytes) -> Option<ParityFragment>;
    fn parse_audio(&self, raw: Bytes) -> Option<AudioFragment>;
    fn parse_floor(&self, raw: Bytes) -> Option<FloorPacket>;
    fn encode_request(&self, session_id: SessionId, request: &RequestPacket) -> Bytes;
}

// ─── WireCodec ──────────────────────────────────────────────────────────────

/// The sender's little-endian byte layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

impl WireCodec {
    /// Strip and check the header, returning the body.
    fn body(raw: Bytes, expected: SenderPacketType) -> Option<Bytes> {
        let mut buf = raw;
        let header = SenderHeader::decode(&mut buf)?;
        if header.packet_type != expected {
            return None;
        }
        Some(buf)
    }

    fn receiver_header(session_id: SessionId, ty: ReceiverPacketType, cap: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + cap);
        buf.put_i32_le(session_id);
        buf.put_u8(ty as u8);
        buf
    }

    pub fn encode_connect(&self, session_id: SessionId) -> Bytes {
        Self::receiver_header(session_id, ReceiverPacketType::Connect, 0).freeze()
    }

    pub fn encode_report(&self, session_id: SessionId, report: &ReportPacket) -> Bytes {
        let mut buf = Self::receiver_header(session_id, ReceiverPacketType::Report, 12);
        report.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a receiver datagram's header.
    pub fn parse_receiver_header(&self, raw: &[u8]) -> Option<(SessionId, ReceiverPacketType)> {
        let mut buf = raw;
        if buf.remaining() < HEADER_SIZE {
            return None;
        }
        let session_id = buf.get_i32_le();
        let ty = ReceiverPacketType::from_byte(buf.get_u8())?;
        Some((session_id, ty))
    }

    pub fn parse_request(&self, raw: &[u8]) -> Option<RequestPacket> {
        match self.parse_receiver_header(raw)? {
            (_, ReceiverPacketType::Request) => RequestPacket::decode(&mut &raw[HEADER_SIZE..]),
            _ => None,
        }
    }

    pub fn parse_report(&self, raw: &[u8]) -> Option<ReportPacket> {
        match self.parse_receiver_header(raw)? {
            (_, ReceiverPacketType::Report) => ReportPacket::decode(&mut &raw[HEADER_SIZE..]),
            _ => None,
        }
    }

    // Sender-side encoders, used by tools and tests that play the sender.

    pub fn encode_video(&self, session_id: SessionId, fragment: &VideoFragment) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + fragment.payload.len());
        SenderHeader {
            session_id,
            packet_type: SenderPacketType::Frame,
        }
        .encode(&mut buf);
        fragment.encode(&mut buf);
        buf.freeze()
    }

    pub fn encode_parity(&self, session_id: SessionId, fragment: &ParityFragment) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + fragment.payload.len());
        SenderHeader {
            session_id,
            packet_type: SenderPacketType::Fec,
        }
        .encode(&mut buf);
        fragment.encode(&mut buf);
        buf.freeze()
    }

    pub fn encode_audio(&self, session_id: SessionId, fragment: &AudioFragment) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 8 + fragment.payload.len());
        SenderHeader {
            session_id,
            packet_type: SenderPacketType::Audio,
        }
        .encode(&mut buf);
        fragment.encode(&mut buf);
        buf.freeze()
    }

    pub fn encode_floor(&self, session_id: SessionId, floor: &FloorPacket) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 16);
        SenderHeader {
            session_id,
            packet_type: SenderPacketType::Floor,
        }
        .encode(&mut buf);
        floor.encode(&mut buf);
        buf.freeze()
    }
}

impl PacketParser for WireCodec {
    fn parse_header(&self, raw: &[u8]) -> Option<SenderHeader> {
        SenderHeader::decode(&mut &raw[..])
    }

    fn parse_video(&self, raw: Bytes) -> Option<VideoFragment> {
        VideoFragment::decode(&mut Self::body(raw, SenderPacketType::Frame)?)
    }

    fn parse_parity(&self, raw: Bytes) -> Option<ParityFragment> {
        ParityFragment::decode(&mut Self::body(raw, SenderPacketType::Fec)?)
    }

    fn parse_audio(&self, raw: Bytes) -> Option<AudioFragment> {
        AudioFragment::decode(&mut Self::body(raw, SenderPacketType::Audio)?)
    }

    fn parse_floor(&self, raw: Bytes) -> Option<FloorPacket> {
        FloorPacket::decode(&mut Self::body(raw, SenderPacketType::Floor)?)
    }

    fn encode_request(&self, session_id: SessionId, request: &RequestPacket) -> Bytes {
        let mut buf = Self::receiver_header(
            session_id,
            ReceiverPacketType::Request,
            8 + request.missing.len() * 4,
        );
        request.encode(&mut buf);
        buf.freeze()
    }
}
