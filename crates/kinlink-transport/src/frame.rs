//! # Video Frame Messages
//!
//! A completed frame is the index-ordered concatenation of its fragment
//! payloads. The leading bytes describe the encoded color and depth frames;
//! whatever follows them is padding from the last fixed-size block.
//!
//! ```text
//! frame_time_stamp f32 | keyframe u8 | color_size i32 | color | depth_size i32 | depth | pad
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;

use crate::FrameId;

/// A reassembled video frame, delivered in frame-id order.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrameMessage {
    frame_id: FrameId,
    payload: Bytes,
    collection_time: Duration,
    recovered_fragments: u32,
}

impl VideoFrameMessage {
    pub fn new(frame_id: FrameId, payload: Bytes) -> Self {
        VideoFrameMessage {
            frame_id,
            payload,
            collection_time: Duration::ZERO,
            recovered_fragments: 0,
        }
    }

    pub(crate) fn with_collection(mut self, collection_time: Duration, recovered: u32) -> Self {
        self.collection_time = collection_time;
        self.recovered_fragments = recovered;
        self
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Concatenated fragment payloads, padding included.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Time from the first fragment's arrival to completion.
    pub fn collection_time(&self) -> Duration {
        self.collection_time
    }

    /// Fragments rebuilt from parity rather than received.
    pub fn recovered_fragments(&self) -> u32 {
        self.recovered_fragments
    }

    /// Split the payload into its encoded color and depth frames.
    pub fn contents(&self) -> Option<FrameContents> {
        FrameContents::decode(&mut self.payload.clone())
    }
}

/// Encoded color and depth frames carried by one video frame message.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameContents {
    /// Capture time in seconds since the sender started.
    pub frame_time_stamp: f32,
    pub keyframe: bool,
    pub color_frame: Bytes,
    pub depth_frame: Bytes,
}

impl FrameContents {
    fn take_sized(buf: &mut Bytes) -> Option<Bytes> {
        if buf.remaining() < 4 {
            return None;
        }
        let len = usize::try_from(buf.get_i32_le()).ok()?;
        if buf.remaining() < len {
            return None;
        }
        Some(buf.split_to(len))
    }

    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < 5 {
            return None;
        }
        let frame_time_stamp = buf.get_f32_le();
        let keyframe = buf.get_u8() != 0;
        let color_frame = Self::take_sized(buf)?;
        let depth_frame = Self::take_sized(buf)?;
        Some(FrameContents {
            frame_time_stamp,
            keyframe,
            color_frame,
            depth_frame,
        })
    }

    /// Sender-side message construction.
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(13 + self.color_frame.len() + self.depth_frame.len());
        buf.put_f32_le(self.frame_time_stamp);
        buf.put_u8(self.keyframe as u8);
        buf.put_i32_le(self.color_frame.len() as i32);
        buf.extend_from_slice(&self.color_frame);
        buf.put_i32_le(self.depth_frame.len() as i32);
        buf.extend_from_slice(&self.depth_frame);
        buf.freeze()
    }
}
