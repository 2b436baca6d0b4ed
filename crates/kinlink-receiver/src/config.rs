use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use kinlink_transport::SessionId;
use kinlink_transport::audio::{AudioCodec, AudioConfig};
use kinlink_transport::video::ReassemblerConfig;

pub const CONFIG_VERSION: u32 = 1;

const OPUS_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

// ─── Input (as written in TOML) ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfigInput {
    pub version: u32,
    pub session_id: Option<SessionId>,
    pub bind: Option<String>,
    pub sender: Option<String>,
    pub video: VideoConfigInput,
    pub audio: AudioConfigInput,
    pub runtime: RuntimeConfigInput,
    pub metrics: MetricsConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoConfigInput {
    pub window_depth: Option<usize>,
    pub max_packet_count: Option<u32>,
    pub frame_channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AudioConfigInput {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub samples_per_frame: Option<usize>,
    pub playback_capacity_frames: Option<usize>,
    pub codec: Option<AudioCodec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfigInput {
    pub idle_sleep_us: Option<u64>,
    pub stats_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfigInput {
    pub port: Option<u16>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub reassembler: ReassemblerConfig,
    /// Completed frames buffered for the application before new ones are
    /// dropped.
    pub frame_channel_capacity: usize,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            reassembler: ReassemblerConfig::default(),
            frame_channel_capacity: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub format: AudioConfig,
    pub codec: AudioCodec,
    /// Playback ring size in decoded blocks.
    pub playback_capacity_frames: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            format: AudioConfig::default(),
            codec: AudioCodec::Pcm,
            playback_capacity_frames: 10,
        }
    }
}

impl AudioSettings {
    /// Playback ring size in samples.
    pub fn playback_capacity(&self) -> usize {
        self.playback_capacity_frames * self.format.block_len()
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Socket-thread sleep after a pass that found nothing.
    pub idle_sleep: Duration,
    /// Interval between stats snapshots published by the worker.
    pub stats_interval: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_micros(100),
            stats_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub version: u32,
    pub session_id: SessionId,
    pub bind: SocketAddr,
    pub sender: Option<SocketAddr>,
    pub video: VideoSettings,
    pub audio: AudioSettings,
    pub runtime: RuntimeSettings,
    pub metrics_port: Option<u16>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            session_id: 0,
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            sender: None,
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
            runtime: RuntimeSettings::default(),
            metrics_port: None,
        }
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, String> {
    value
        .trim()
        .parse()
        .map_err(|e| format!("Invalid {field} address '{}': {e}", value.trim()))
}

impl ReceiverConfigInput {
    pub fn resolve(self) -> Result<ReceiverConfig, String> {
        let defaults = ReceiverConfig::default();
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let bind = match self.bind.as_deref() {
            Some(b) => parse_addr("bind", b)?,
            None => defaults.bind,
        };
        let sender = match self.sender.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => Some(parse_addr("sender", s)?),
            _ => None,
        };

        let video = VideoSettings {
            reassembler: ReassemblerConfig {
                window_depth: self
                    .video
                    .window_depth
                    .unwrap_or(defaults.video.reassembler.window_depth)
                    .max(4),
                max_packet_count: self
                    .video
                    .max_packet_count
                    .unwrap_or(defaults.video.reassembler.max_packet_count)
                    .max(1),
            },
            frame_channel_capacity: self
                .video
                .frame_channel_capacity
                .unwrap_or(defaults.video.frame_channel_capacity)
                .max(1),
        };

        let format = AudioConfig {
            sample_rate: self
                .audio
                .sample_rate
                .unwrap_or(defaults.audio.format.sample_rate),
            channels: self.audio.channels.unwrap_or(defaults.audio.format.channels),
            samples_per_frame: self
                .audio
                .samples_per_frame
                .unwrap_or(defaults.audio.format.samples_per_frame),
        };
        if !(1..=2).contains(&format.channels) {
            return Err(format!("Unsupported channel count {}", format.channels));
        }
        if format.samples_per_frame == 0 || format.sample_rate == 0 {
            return Err("Audio sample rate and samples_per_frame must be > 0".into());
        }
        let codec = self.audio.codec.unwrap_or(defaults.audio.codec);
        if codec == AudioCodec::Opus && !OPUS_RATES.contains(&format.sample_rate) {
            return Err(format!(
                "Opus does not support sample rate {}",
                format.sample_rate
            ));
        }
        let audio = AudioSettings {
            format,
            codec,
            playback_capacity_frames: self
                .audio
                .playback_capacity_frames
                .unwrap_or(defaults.audio.playback_capacity_frames)
                .max(1),
        };

        let runtime = RuntimeSettings {
            idle_sleep: self
                .runtime
                .idle_sleep_us
                .map(Duration::from_micros)
                .unwrap_or(defaults.runtime.idle_sleep),
            stats_interval: self
                .runtime
                .stats_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.runtime.stats_interval)
                .max(Duration::from_millis(10)),
        };

        Ok(ReceiverConfig {
            version,
            session_id: self.session_id.unwrap_or(defaults.session_id),
            bind,
            sender,
            video,
            audio,
            runtime,
            metrics_port: self.metrics.port,
        })
    }
}

impl ReceiverConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ReceiverConfig::default());
        }
        let parsed: ReceiverConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
    }
}
