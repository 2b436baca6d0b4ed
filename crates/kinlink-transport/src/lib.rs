//! # kinlink-transport
//!
//! Receive-side transport for a real-time audio/video link carried over
//! unreliable datagrams.
//!
//! Fixed-size video fragments are reassembled into frames with XOR parity
//! recovery and retransmission requests for whatever parity cannot repair.
//! Audio fragments are ordered, decoded and written into a bounded playback
//! ring. Nothing in this crate blocks or owns a thread; the
//! `kinlink-receiver` crate drives it from a socket thread and a processing
//! thread.
//!
//! ## Crate structure
//!
//! - [`wire`]: Typed packet records, `PacketParser` seam, `WireCodec` layout
//! - [`fec`]: XOR group arithmetic, fragmenter, parity encoder
//! - [`window`]: Fixed-depth frame arena indexed by `frame_id mod depth`
//! - [`queue`]: Lock-free delivery queues between the two threads
//! - [`socket`]: Non-blocking datagram socket seam
//! - [`demux`]: Inbound demultiplexer
//! - [`frame`]: Reassembled video frame messages
//! - [`video`]: Video reassembly engine
//! - [`audio`]: Audio collection engine, decoders, playback seam
//! - [`stats`]: Per-component counters

pub mod audio;
pub mod demux;
pub mod fec;
pub mod frame;
pub mod queue;
pub mod socket;
pub mod stats;
pub mod video;
pub mod wire;
pub mod window;

/// Monotonically increasing frame identifier assigned by the sender.
pub type FrameId = i32;

/// Session identifier agreed at connection setup.
pub type SessionId = i32;

/// Watermark value before any frame has been delivered.
pub const NO_FRAME: FrameId = -1;
