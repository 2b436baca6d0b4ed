//! # Kinlink Receiver
//!
//! Command-line receiver for a kinlink sender. Connects to the sender,
//! reassembles video frames (XOR FEC + retransmission requests), decodes
//! audio into a playback ring, and writes both to files or discards them.
//!
//! ## Usage
//!
//! ```bash
//! # Monitor mode (log stats, discard output)
//! kinlink-receiver --sender 192.168.0.10:7777 --session 1
//!
//! # Record frames and audio
//! kinlink-receiver --sender 192.168.0.10:7777 --output frames.bin --audio-output audio.f32
//!
//! # From a config file, with Prometheus metrics
//! kinlink-receiver --config receiver.toml --metrics-port 9090
//! ```

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kinlink_receiver::{ReceiverConfig, ReceiverRuntime};
use kinlink_transport::frame::VideoFrameMessage;
use kinlink_transport::wire::ReportPacket;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;
    let config = args.resolve_config()?;

    tracing::info!(
        bind = %config.bind,
        sender = ?config.sender,
        session_id = config.session_id,
        codec = ?config.audio.codec,
        output = ?args.output,
        audio_output = ?args.audio_output,
        metrics_port = ?config.metrics_port,
        "kinlink-receiver starting"
    );

    // ── Runtime ─────────────────────────────────────────────────
    let mut rt = ReceiverRuntime::start(&config)?;
    if let Some(port) = config.metrics_port {
        let addr = rt.start_metrics_server(SocketAddr::from(([0, 0, 0, 0], port)))?;
        tracing::info!(%addr, "prometheus metrics server listening");
    }
    let mut playback = rt
        .take_playback()
        .ok_or_else(|| anyhow::anyhow!("playback consumer already taken"))?;

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Output sinks ────────────────────────────────────────────
    let mut frames: Box<dyn OutputSink> = match &args.output {
        Some(path) => Box::new(FileSink::open(path, "video frames")?),
        None => Box::new(NullSink::new("video")),
    };
    let mut audio: Box<dyn OutputSink> = match &args.audio_output {
        Some(path) => Box::new(FileSink::open(path, "f32 audio")?),
        None => Box::new(NullSink::new("audio")),
    };

    // ── Main receive loop ───────────────────────────────────────
    let mut total_frames: u64 = 0;
    let mut total_bytes: u64 = 0;
    let mut total_samples: u64 = 0;
    let mut last_frame_at: Option<std::time::Instant> = None;
    let mut last_stats_log = std::time::Instant::now();
    let stats_interval = Duration::from_secs(5);
    let mut samples = Vec::with_capacity(4096);

    while running.load(Ordering::Relaxed) {
        match rt.frames().recv_timeout(Duration::from_millis(10)) {
            Ok(frame) => {
                let started = std::time::Instant::now();
                if let Err(e) = frames.write(&encode_frame_record(&frame)) {
                    tracing::error!(error = %e, "frame write failed");
                    break;
                }
                let interval = last_frame_at.map(|t| t.elapsed()).unwrap_or_default();
                last_frame_at = Some(std::time::Instant::now());
                let report = ReportPacket {
                    frame_id: frame.frame_id(),
                    decoder_time_ms: started.elapsed().as_secs_f32() * 1000.0,
                    frame_interval_ms: interval.as_secs_f32() * 1000.0,
                };
                if let Err(e) = rt.send_report(&report) {
                    tracing::debug!(error = %e, "report send failed");
                }
                total_frames += 1;
                total_bytes += frame.payload().len() as u64;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }

        // Stand in for the audio device: drain whatever is buffered.
        samples.clear();
        while let Ok(sample) = playback.pop() {
            samples.extend_from_slice(&sample.to_le_bytes());
        }
        if !samples.is_empty() {
            total_samples += (samples.len() / 4) as u64;
            if let Err(e) = audio.write(&samples) {
                tracing::error!(error = %e, "audio write failed");
                break;
            }
        }

        // Periodic stats logging
        if last_stats_log.elapsed() >= stats_interval {
            let stats = rt.stats();
            tracing::info!(
                frames = total_frames,
                bytes = total_bytes,
                samples = total_samples,
                recovered = stats.video.fragments_recovered,
                requested = stats.video.indices_requested,
                dropped = stats.video.frames_dropped,
                open = stats.video.open_collections,
                audio_dropped = stats.audio.dropped_backpressure,
                malformed = stats.demux.malformed,
                "receiver stats"
            );
            last_stats_log = std::time::Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    rt.shutdown();
    drop(frames);
    drop(audio);
    if args.dump_stats {
        println!("{}", serde_json::to_string_pretty(&rt.stats())?);
    }
    tracing::info!(total_frames, total_bytes, total_samples, "kinlink-receiver stopped");

    Ok(())
}

/// `frame_id i32 | len u32 | payload`, little-endian.
fn encode_frame_record(frame: &VideoFrameMessage) -> Vec<u8> {
    let payload = frame.payload();
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&frame.frame_id().to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    config: Option<String>,
    bind: Option<SocketAddr>,
    sender: Option<SocketAddr>,
    session_id: Option<i32>,
    output: Option<String>,
    audio_output: Option<String>,
    metrics_port: Option<u16>,
    dump_stats: bool,
}

impl Args {
    /// Config file (if any), then CLI flags on top.
    fn resolve_config(&self) -> anyhow::Result<ReceiverConfig> {
        let mut config = match &self.config {
            Some(path) => ReceiverConfig::load(path)?,
            None => ReceiverConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(sender) = self.sender {
            config.sender = Some(sender);
        }
        if let Some(session_id) = self.session_id {
            config.session_id = session_id;
        }
        if self.metrics_port.is_some() {
            config.metrics_port = self.metrics_port;
        }
        if config.sender.is_none() {
            anyhow::bail!(
                "no sender address specified. Use --sender, KINLINK_SENDER or the config file.\nRun with --help for usage."
            );
        }
        Ok(config)
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> anyhow::Result<&'a String> {
    args.get(i)
        .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
}

fn parse_addr(flag: &str, val: &str) -> anyhow::Result<SocketAddr> {
    val.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {flag} address '{}': {}", val.trim(), e))
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut bind = None;
    let mut sender = None;
    let mut session_id = None;
    let mut output = None;
    let mut audio_output = None;
    let mut metrics_port = None;
    let mut dump_stats = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config = Some(value(&args, i, "--config")?.clone());
            }
            "--bind" | "-b" => {
                i += 1;
                bind = Some(parse_addr("bind", value(&args, i, "--bind")?)?);
            }
            "--sender" | "-s" => {
                i += 1;
                sender = Some(parse_addr("sender", value(&args, i, "--sender")?)?);
            }
            "--session" | "-i" => {
                i += 1;
                let val = value(&args, i, "--session")?;
                session_id = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid session id '{}': {}", val, e))?,
                );
            }
            "--output" | "-o" => {
                i += 1;
                output = Some(value(&args, i, "--output")?.clone());
            }
            "--audio-output" | "-a" => {
                i += 1;
                audio_output = Some(value(&args, i, "--audio-output")?.clone());
            }
            "--metrics-port" | "-m" => {
                i += 1;
                let val = value(&args, i, "--metrics-port")?;
                metrics_port = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid port '{}': {}", val, e))?,
                );
            }
            "--dump-stats" => dump_stats = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    // Fallback: env vars
    if config.is_none() {
        config = std::env::var("KINLINK_CONFIG").ok().filter(|s| !s.is_empty());
    }
    if bind.is_none() {
        if let Ok(val) = std::env::var("KINLINK_BIND") {
            bind = Some(parse_addr("bind", &val)?);
        }
    }
    if sender.is_none() {
        if let Ok(val) = std::env::var("KINLINK_SENDER") {
            sender = Some(parse_addr("sender", &val)?);
        }
    }
    if session_id.is_none() {
        session_id = std::env::var("KINLINK_SESSION_ID")
            .ok()
            .and_then(|v| v.parse().ok());
    }
    if metrics_port.is_none() {
        if let Ok(val) = std::env::var("METRICS_PORT") {
            metrics_port = val.parse().ok();
        }
    }

    Ok(Args {
        config,
        bind,
        sender,
        session_id,
        output,
        audio_output,
        metrics_port,
        dump_stats,
    })
}

fn print_help() {
    eprintln!(
        r#"kinlink-receiver: receive-side transport for a kinlink sender

USAGE:
  kinlink-receiver --sender <ADDR> [OPTIONS]

OPTIONS:
  --config, -c <path>        TOML config file
  --bind, -b <addr>          Local UDP address (default: 0.0.0.0:0)
  --sender, -s <addr>        Sender UDP address (required unless in config)
  --session, -i <id>         Session id announced in the connect packet
  --output, -o <path>        Write reassembled frames to file
  --audio-output, -a <path>  Write decoded audio (f32 LE interleaved) to file
  --metrics-port, -m <port>  Prometheus metrics on 0.0.0.0:<port>/metrics
  --dump-stats               Print final stats as JSON on exit
  --help, -h                 Show this help

ENVIRONMENT VARIABLES:
  KINLINK_CONFIG      Config file (fallback for --config)
  KINLINK_BIND        Local address (fallback for --bind)
  KINLINK_SENDER      Sender address (fallback for --sender)
  KINLINK_SESSION_ID  Session id (fallback for --session)
  METRICS_PORT        Prometheus port (fallback for --metrics-port)
  RUST_LOG            Log level filter (e.g. info, debug, kinlink_transport=trace)

EXAMPLES:
  # Monitor mode (logs stats, discards output)
  kinlink-receiver --sender 192.168.0.10:7777 --session 1

  # Record to files
  kinlink-receiver --sender 192.168.0.10:7777 -o frames.bin -a audio.f32
"#
    );
}

// ─── Output Sinks ───────────────────────────────────────────────────────────

trait OutputSink {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;
}

/// Discards output (monitor mode).
struct NullSink;

impl NullSink {
    fn new(stream: &str) -> Self {
        tracing::info!(stream, "output: monitor mode (set --output / --audio-output to capture)");
        NullSink
    }
}

impl OutputSink for NullSink {
    fn write(&mut self, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

struct FileSink {
    file: std::io::BufWriter<std::fs::File>,
}

impl FileSink {
    fn open(path: &str, what: &str) -> anyhow::Result<Self> {
        let file = std::fs::File::create(path)
            .map_err(|e| anyhow::anyhow!("failed to create {path}: {e}"))?;
        tracing::info!(path, what, "output: writing to file");
        Ok(FileSink {
            file: std::io::BufWriter::new(file),
        })
    }
}

impl OutputSink for FileSink {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}
