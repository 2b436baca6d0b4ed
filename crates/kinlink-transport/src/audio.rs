//! # Audio Collection Engine
//!
//! Audio fragments are self-contained: one fragment decodes to one fixed-size
//! block of interleaved samples. Each pass drains the audio queue, orders it
//! by frame id and feeds the playback buffer until it runs out of room.
//! Whatever does not fit is dropped; late audio is worth less than low
//! latency.

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::queue::{DeliveryQueue, InboundQueues};
use crate::stats::AudioStats;
use crate::wire::AudioFragment;
use crate::FrameId;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Fixed decode geometry shared by the decoder and the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one decoded block.
    pub samples_per_frame: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            sample_rate: 48_000,
            channels: 2,
            samples_per_frame: 960,
        }
    }
}

impl AudioConfig {
    /// Interleaved samples in one decoded block.
    pub fn block_len(&self) -> usize {
        self.samples_per_frame * self.channels as usize
    }
}

/// Audio payload encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// Interleaved little-endian `i16`.
    #[default]
    Pcm,
    Opus,
}

// ─── Decoders ───────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is {got} bytes, expected {expected}")]
    Length { expected: usize, got: usize },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("codec {0:?} not compiled in")]
    Unsupported(AudioCodec),
}

/// Decodes one encoded audio unit into a fixed-size sample block.
pub trait AudioDecoder {
    /// Fill `block` (exactly [`AudioConfig::block_len`] samples) from
    /// `payload`.
    fn decode(&mut self, payload: &[u8], block: &mut [f32]) -> Result<(), DecodeError>;
}

impl<D: AudioDecoder + ?Sized> AudioDecoder for Box<D> {
    fn decode(&mut self, payload: &[u8], block: &mut [f32]) -> Result<(), DecodeError> {
        (**self).decode(payload, block)
    }
}

/// Raw interleaved `i16` little-endian PCM.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcmDecoder;

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, payload: &[u8], block: &mut [f32]) -> Result<(), DecodeError> {
        let expected = block.len() * 2;
        if payload.len() != expected {
            return Err(DecodeError::Length {
                expected,
                got: payload.len(),
            });
        }
        for (sample, raw) in block.iter_mut().zip(payload.chunks_exact(2)) {
            *sample = i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32768.0;
        }
        Ok(())
    }
}

/// Opus via libopus.
#[cfg(feature = "opus")]
pub struct OpusDecoder {
    inner: opus::Decoder,
    channels: usize,
}

#[cfg(feature = "opus")]
impl OpusDecoder {
    pub fn new(config: &AudioConfig) -> Result<Self, DecodeError> {
        let channels = match config.channels {
            1 => opus::Channels::Mono,
            _ => opus::Channels::Stereo,
        };
        let inner = opus::Decoder::new(config.sample_rate, channels)
            .map_err(|e| DecodeError::Codec(e.to_string()))?;
        Ok(OpusDecoder {
            inner,
            channels: config.channels.min(2) as usize,
        })
    }
}

#[cfg(feature = "opus")]
impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, payload: &[u8], block: &mut [f32]) -> Result<(), DecodeError> {
        let per_channel = self
            .inner
            .decode_float(payload, block, false)
            .map_err(|e| DecodeError::Codec(e.to_string()))?;
        // Short packets leave the tail silent.
        let written = (per_channel * self.channels).min(block.len());
        block[written..].fill(0.0);
        Ok(())
    }
}

/// Build the decoder for `codec`.
pub fn build_decoder(
    codec: AudioCodec,
    config: &AudioConfig,
) -> Result<Box<dyn AudioDecoder + Send>, DecodeError> {
    match codec {
        AudioCodec::Pcm => Ok(Box::new(PcmDecoder)),
        #[cfg(feature = "opus")]
        AudioCodec::Opus => Ok(Box::new(OpusDecoder::new(config)?)),
        #[cfg(not(feature = "opus"))]
        AudioCodec::Opus => {
            let _ = config;
            Err(DecodeError::Unsupported(codec))
        }
    }
}

// ─── Playback ───────────────────────────────────────────────────────────────

/// Bounded sink for decoded samples, drained by the audio device.
pub trait PlaybackBuffer {
    /// Samples that can be written right now.
    fn free_capacity(&self) -> usize;
    /// Write as many samples as fit; returns how many were written.
    fn write(&mut self, samples: &[f32]) -> usize;
}

impl PlaybackBuffer for rtrb::Producer<f32> {
    fn free_capacity(&self) -> usize {
        self.slots()
    }

    fn write(&mut self, samples: &[f32]) -> usize {
        samples
            .iter()
            .take_while(|&&sample| self.push(sample).is_ok())
            .count()
    }
}

// ─── Collector ──────────────────────────────────────────────────────────────

/// Audio collection engine. Owned by the processing thread.
pub struct AudioCollector<D = Box<dyn AudioDecoder + Send>> {
    queue: DeliveryQueue<AudioFragment>,
    decoder: D,
    block: Vec<f32>,
    stats: AudioStats,
}

impl<D: AudioDecoder> AudioCollector<D> {
    pub fn new(config: &AudioConfig, decoder: D, queues: &InboundQueues) -> Self {
        AudioCollector {
            queue: queues.audio.clone(),
            decoder,
            block: vec![0.0; config.block_len()],
            stats: AudioStats::default(),
        }
    }

    /// Decode queued fragments newer than `last_audio_frame_id` into
    /// `playback`, in frame-id order, until it is full.
    ///
    /// Returns the new watermark. Fragments left over when playback fills up
    /// are dropped, not re-queued.
    pub fn collect<B: PlaybackBuffer + ?Sized>(
        &mut self,
        last_audio_frame_id: FrameId,
        playback: &mut B,
    ) -> FrameId {
        let mut fragments = self.queue.drain();
        if fragments.is_empty() {
            return last_audio_frame_id;
        }
        self.stats.fragments_received += fragments.len() as u64;
        fragments.sort_by_key(|f| f.frame_id);

        let mut last = last_audio_frame_id;
        let mut pending = fragments.into_iter();
        while let Some(fragment) = pending.next() {
            if fragment.frame_id <= last {
                self.stats.stale_fragments += 1;
                trace!(frame_id = fragment.frame_id, last, "stale audio fragment");
                continue;
            }
            if playback.free_capacity() < self.block.len() {
                let dropped = 1 + pending.len() as u64;
                self.stats.dropped_backpressure += dropped;
                debug!(dropped, frame_id = fragment.frame_id, "playback buffer full, dropping audio");
                break;
            }

            match self.decoder.decode(&fragment.payload, &mut self.block) {
                Ok(()) => {
                    let written = playback.write(&self.block);
                    self.stats.samples_written += written as u64;
                    self.stats.frames_played += 1;
                }
                Err(e) => {
                    self.stats.decode_failures += 1;
                    debug!(frame_id = fragment.frame_id, error = %e, "audio decode failed");
                }
            }
            last = fragment.frame_id;
        }
        last
    }

    pub fn stats(&self) -> &AudioStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NO_FRAME;
    use bytes::Bytes;

    const CONFIG: AudioConfig = AudioConfig {
        sample_rate: 8_000,
        channels: 1,
        samples_per_frame: 4,
    };

    /// PCM fragment whose samples all equal `frame_id`.
    fn fragment(frame_id: FrameId) -> AudioFragment {
        let payload: Vec<u8> = (0..CONFIG.block_len())
            .flat_map(|_| (frame_id as i16).to_le_bytes())
            .collect();
        AudioFragment {
            frame_id,
            payload: Bytes::from(payload),
        }
    }

    fn collector() -> (InboundQueues, AudioCollector<PcmDecoder>) {
        let queues = InboundQueues::new();
        let collector = AudioCollector::new(&CONFIG, PcmDecoder, &queues);
        (queues, collector)
    }

    fn played(consumer: &mut rtrb::Consumer<f32>) -> Vec<i16> {
        let mut ids = Vec::new();
        while let Ok(sample) = consumer.pop() {
            let id = (sample * 32768.0).round() as i16;
            if ids.last() != Some(&id) {
                ids.push(id);
            }
        }
        ids
    }

    #[test]
    fn decodes_in_frame_order() {
        let (q, mut audio) = collector();
        let (mut tx, mut rx) = rtrb::RingBuffer::new(64);
        for id in [5, 3, 4] {
            q.audio.push(fragment(id));
        }

        assert_eq!(audio.collect(NO_FRAME, &mut tx), 5);
        assert_eq!(played(&mut rx), vec![3, 4, 5]);
        assert_eq!(audio.stats().frames_played, 3);
        assert_eq!(audio.stats().samples_written, 12);
    }

    #[test]
    fn stale_and_duplicate_fragments_skipped() {
        let (q, mut audio) = collector();
        let (mut tx, mut rx) = rtrb::RingBuffer::new(64);
        for id in [2, 4, 4, 1] {
            q.audio.push(fragment(id));
        }

        assert_eq!(audio.collect(2, &mut tx), 4);
        assert_eq!(played(&mut rx), vec![4]);
        assert_eq!(audio.stats().stale_fragments, 3);
    }

    #[test]
    fn full_playback_drops_remainder() {
        let (q, mut audio) = collector();
        // Room for two blocks.
        let (mut tx, mut rx) = rtrb::RingBuffer::new(9);
        for id in 1..=5 {
            q.audio.push(fragment(id));
        }

        assert_eq!(audio.collect(NO_FRAME, &mut tx), 2);
        assert_eq!(played(&mut rx), vec![1, 2]);
        assert_eq!(audio.stats().dropped_backpressure, 3);
        // Dropped, not re-queued.
        assert!(q.audio.is_empty());
        assert_eq!(audio.collect(2, &mut tx), 2);
    }

    #[test]
    fn decode_failure_skipped_and_watermark_advances() {
        let (q, mut audio) = collector();
        let (mut tx, mut rx) = rtrb::RingBuffer::new(64);
        q.audio.push(fragment(1));
        q.audio.push(AudioFragment {
            frame_id: 2,
            payload: Bytes::from_static(&[1, 2, 3]),
        });
        q.audio.push(fragment(3));

        assert_eq!(audio.collect(NO_FRAME, &mut tx), 3);
        assert_eq!(played(&mut rx), vec![1, 3]);
        assert_eq!(audio.stats().decode_failures, 1);
    }

    #[test]
    fn empty_queue_keeps_watermark() {
        let (_q, mut audio) = collector();
        let (mut tx, _rx) = rtrb::RingBuffer::<f32>::new(8);
        assert_eq!(audio.collect(7, &mut tx), 7);
        assert_eq!(audio.stats().fragments_received, 0);
    }

    #[test]
    fn pcm_scales_to_unit_range() {
        let mut block = [0.0f32; 2];
        let payload = [i16::MIN.to_le_bytes(), 16384i16.to_le_bytes()].concat();
        PcmDecoder.decode(&payload, &mut block).unwrap();
        assert_eq!(block, [-1.0, 0.5]);
    }

    #[test]
    fn pcm_rejects_wrong_length() {
        let mut block = [0.0f32; 4];
        assert_eq!(
            PcmDecoder.decode(&[0; 6], &mut block),
            Err(DecodeError::Length {
                expected: 8,
                got: 6
            })
        );
    }

    #[cfg(not(feature = "opus"))]
    #[test]
    fn opus_unavailable_without_feature() {
        assert!(matches!(
            build_decoder(AudioCodec::Opus, &CONFIG),
            Err(DecodeError::Unsupported(AudioCodec::Opus))
        ));
    }

    #[test]
    fn boxed_decoder_collects() {
        let queues = InboundQueues::new();
        let decoder = build_decoder(AudioCodec::Pcm, &CONFIG).unwrap();
        let mut audio: AudioCollector = AudioCollector::new(&CONFIG, decoder, &queues);
        let (mut tx, mut rx) = rtrb::RingBuffer::new(16);
        queues.audio.push(fragment(9));
        assert_eq!(audio.collect(NO_FRAME, &mut tx), 9);
        assert_eq!(played(&mut rx), vec![9]);
    }
}
