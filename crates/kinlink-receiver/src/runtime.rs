use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use quanta::Instant;
use serde::Serialize;
use tracing::{debug, info, warn};

use kinlink_transport::audio::{AudioCollector, build_decoder};
use kinlink_transport::demux::Demultiplexer;
use kinlink_transport::frame::VideoFrameMessage;
use kinlink_transport::queue::{DeliveryQueue, InboundQueues};
use kinlink_transport::socket::DatagramSocket;
use kinlink_transport::stats::{AudioStats, DemuxStats, ReassemblyStats};
use kinlink_transport::video::VideoReassembler;
use kinlink_transport::wire::{FloorPacket, PacketParser, ReportPacket, WireCodec};
use kinlink_transport::{FrameId, NO_FRAME, SessionId};

use crate::config::ReceiverConfig;
use crate::metrics::MetricsServer;
use crate::net::UdpLink;

/// Interval between connect packets until the sender answers.
const CONNECT_RETRY: Duration = Duration::from_secs(1);

/// Snapshot of every counter in the receiver, published periodically by
/// the worker threads.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub demux: DemuxStats,
    pub video: ReassemblyStats,
    pub audio: AudioStats,
    /// Frames handed to the application channel.
    pub frames_delivered: u64,
    /// Frames dropped because the application channel was full.
    pub frames_dropped_backpressure: u64,
    pub socket_errors: u64,
    pub send_errors: u64,
    pub last_video_frame_id: FrameId,
    pub last_audio_frame_id: FrameId,
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self {
            demux: DemuxStats::default(),
            video: ReassemblyStats::default(),
            audio: AudioStats::default(),
            frames_delivered: 0,
            frames_dropped_backpressure: 0,
            socket_errors: 0,
            send_errors: 0,
            last_video_frame_id: NO_FRAME,
            last_audio_frame_id: NO_FRAME,
        }
    }
}

/// Receive-side runtime for one session.
///
/// Owns two threads:
/// - **socket** polls the [`UdpLink`] and demultiplexes datagrams onto the
///   inbound queues, re-sending the connect packet until the sender answers.
/// - **worker** runs video reassembly and audio collection, sends
///   retransmission requests back through the link, and publishes stats.
///
/// Completed frames arrive on [`frames`](Self::frames); decoded audio is
/// read from the consumer returned by
/// [`take_playback`](Self::take_playback). Dropping the runtime stops both
/// threads.
pub struct ReceiverRuntime {
    link: Arc<UdpLink>,
    session_id: SessionId,
    frame_rx: Receiver<VideoFrameMessage>,
    playback: Option<rtrb::Consumer<f32>>,
    floor: DeliveryQueue<FloorPacket>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<RuntimeStats>>,
    handles: Vec<thread::JoinHandle<()>>,
    metrics_server: Option<MetricsServer>,
}

impl ReceiverRuntime {
    /// Bind to `config.bind`, connect to `config.sender` and start both
    /// threads.
    pub fn start(config: &ReceiverConfig) -> anyhow::Result<Self> {
        let sender = config
            .sender
            .ok_or_else(|| anyhow::anyhow!("no sender address configured"))?;
        let link = UdpLink::connect(config.bind, sender)
            .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", config.bind, e))?;
        Self::with_link(config, Arc::new(link))
    }

    /// Start on an existing link.
    pub fn with_link(config: &ReceiverConfig, link: Arc<UdpLink>) -> anyhow::Result<Self> {
        let decoder = build_decoder(config.audio.codec, &config.audio.format)
            .map_err(|e| anyhow::anyhow!("audio decoder: {}", e))?;

        let queues = InboundQueues::new();
        let floor = DeliveryQueue::new();
        let (frame_tx, frame_rx) = bounded(config.video.frame_channel_capacity);
        let (playback_tx, playback_rx) =
            rtrb::RingBuffer::new(config.audio.playback_capacity());
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(RuntimeStats::default()));

        let demux = Demultiplexer::new(config.session_id, WireCodec, queues.clone())
            .with_floor_queue(floor.clone());
        let socket_handle = {
            let link = link.clone();
            let running = running.clone();
            let stats = stats.clone();
            let settings = config.runtime.clone();
            thread::Builder::new()
                .name("kinlink-socket".into())
                .spawn(move || {
                    socket_loop(demux, link, running, stats, settings.idle_sleep, settings.stats_interval)
                })?
        };

        let worker = Worker {
            session_id: config.session_id,
            video: VideoReassembler::new(config.video.reassembler.clone(), &queues),
            audio: AudioCollector::new(&config.audio.format, decoder, &queues),
            queues,
            playback: playback_tx,
            frame_tx,
            link: link.clone(),
            last_video: NO_FRAME,
            last_audio: NO_FRAME,
            delivered: 0,
            dropped: 0,
            send_errors: 0,
        };
        let worker_handle = {
            let running = running.clone();
            let stats = stats.clone();
            let settings = config.runtime.clone();
            thread::Builder::new()
                .name("kinlink-worker".into())
                .spawn(move || worker.run(running, stats, settings.idle_sleep, settings.stats_interval))
        };
        let worker_handle = match worker_handle {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Relaxed);
                let _ = socket_handle.join();
                return Err(e.into());
            }
        };

        info!(
            local = ?link.local_addr().ok(),
            sender = %link.peer_addr(),
            session_id = config.session_id,
            "receiver runtime started"
        );

        Ok(Self {
            link,
            session_id: config.session_id,
            frame_rx,
            playback: Some(playback_rx),
            floor,
            running,
            stats,
            handles: vec![socket_handle, worker_handle],
            metrics_server: None,
        })
    }

    /// Completed video frames in frame-id order.
    pub fn frames(&self) -> &Receiver<VideoFrameMessage> {
        &self.frame_rx
    }

    /// The decoded-audio consumer. Returns `None` after the first call.
    pub fn take_playback(&mut self) -> Option<rtrb::Consumer<f32>> {
        self.playback.take()
    }

    /// Floor packets, passed through untouched.
    pub fn floor(&self) -> &DeliveryQueue<FloorPacket> {
        &self.floor
    }

    /// Send per-frame feedback to the sender.
    pub fn send_report(&self, report: &ReportPacket) -> std::io::Result<()> {
        self.link
            .send(&WireCodec.encode_report(self.session_id, report))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.link.local_addr()
    }

    /// Latest published stats snapshot.
    pub fn stats(&self) -> RuntimeStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Shared handle to the stats snapshot for external polling.
    pub fn stats_handle(&self) -> Arc<Mutex<RuntimeStats>> {
        self.stats.clone()
    }

    /// Start a Prometheus-compatible HTTP metrics server on `addr`.
    ///
    /// Calling this again replaces the previous server. Returns the bound
    /// address.
    pub fn start_metrics_server(&mut self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        if let Some(mut old) = self.metrics_server.take() {
            old.stop();
        }
        let server = MetricsServer::start(addr, self.stats.clone())?;
        let bound = server.addr();
        self.metrics_server = Some(server);
        Ok(bound)
    }

    /// Stop both threads and the metrics server. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut server) = self.metrics_server.take() {
            server.stop();
        }
        self.running.store(false, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ReceiverRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Socket thread ──────────────────────────────────────────────────────────

fn socket_loop(
    mut demux: Demultiplexer,
    link: Arc<UdpLink>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<RuntimeStats>>,
    idle_sleep: Duration,
    stats_interval: Duration,
) {
    let connect = WireCodec.encode_connect(demux.session_id());
    let mut last_connect: Option<Instant> = None;
    let mut connected = false;
    let mut socket_errors = 0u64;
    let mut last_publish = Instant::now();

    while running.load(Ordering::Relaxed) {
        if !connected && last_connect.is_none_or(|t| t.elapsed() >= CONNECT_RETRY) {
            if let Err(e) = link.send(&connect) {
                debug!(error = %e, "connect send failed");
            }
            last_connect = Some(Instant::now());
        }

        let idle = match demux.poll(&*link) {
            Ok(routed) => routed == 0,
            Err(e) => {
                socket_errors += 1;
                warn!(error = %e, "socket receive failed");
                thread::sleep(Duration::from_millis(10));
                false
            }
        };

        if !connected && demux.stats().routed() > 0 {
            connected = true;
            info!(sender = %link.peer_addr(), "sender connected");
        }

        if last_publish.elapsed() >= stats_interval {
            publish(&stats, |s| {
                s.demux = demux.stats().clone();
                s.socket_errors = socket_errors;
            });
            last_publish = Instant::now();
        }

        if idle {
            thread::sleep(idle_sleep);
        }
    }

    publish(&stats, |s| {
        s.demux = demux.stats().clone();
        s.socket_errors = socket_errors;
    });
}

// ─── Worker thread ──────────────────────────────────────────────────────────

struct Worker {
    session_id: SessionId,
    video: VideoReassembler,
    audio: AudioCollector,
    queues: InboundQueues,
    playback: rtrb::Producer<f32>,
    frame_tx: Sender<VideoFrameMessage>,
    link: Arc<UdpLink>,
    last_video: FrameId,
    last_audio: FrameId,
    delivered: u64,
    dropped: u64,
    send_errors: u64,
}

impl Worker {
    fn run(
        mut self,
        running: Arc<AtomicBool>,
        stats: Arc<Mutex<RuntimeStats>>,
        idle_sleep: Duration,
        stats_interval: Duration,
    ) {
        let mut last_publish = Instant::now();

        while running.load(Ordering::Relaxed) {
            let idle = self.queues.video.is_empty()
                && self.queues.parity.is_empty()
                && self.queues.audio.is_empty();

            self.pass();

            if last_publish.elapsed() >= stats_interval {
                self.publish(&stats);
                last_publish = Instant::now();
            }
            if idle {
                thread::sleep(idle_sleep);
            }
        }
        self.publish(&stats);
    }

    /// One processing pass: video, requests, then audio.
    fn pass(&mut self) {
        for (frame_id, message) in self.video.reassemble(self.last_video) {
            self.last_video = frame_id;
            match self.frame_tx.try_send(message) {
                Ok(()) => self.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    debug!(frame_id, "frame channel full, dropping frame");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }

        for request in self.video.drain_requests() {
            let datagram = WireCodec.encode_request(self.session_id, &request);
            if let Err(e) = self.link.send(&datagram) {
                self.send_errors += 1;
                warn!(frame_id = request.frame_id, error = %e, "request send failed");
            }
        }

        self.last_audio = self.audio.collect(self.last_audio, &mut self.playback);
    }

    fn publish(&self, stats: &Mutex<RuntimeStats>) {
        publish(stats, |s| {
            s.video = self.video.stats().clone();
            s.audio = self.audio.stats().clone();
            s.frames_delivered = self.delivered;
            s.frames_dropped_backpressure = self.dropped;
            s.send_errors = self.send_errors;
            s.last_video_frame_id = self.last_video;
            s.last_audio_frame_id = self.last_audio;
        });
    }
}

fn publish(stats: &Mutex<RuntimeStats>, update: impl FnOnce(&mut RuntimeStats)) {
    let mut guard = stats.lock().unwrap_or_else(|e| e.into_inner());
    update(&mut guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    fn config_for(sender: SocketAddr) -> ReceiverConfig {
        let mut cfg = ReceiverConfig::from_toml_str(
            r#"
            session_id = 5
            bind = "127.0.0.1:0"
            [runtime]
            stats_interval_ms = 10
            "#,
        )
        .unwrap();
        cfg.sender = Some(sender);
        cfg
    }

    #[test]
    fn start_requires_sender() {
        let cfg = ReceiverConfig::default();
        assert!(ReceiverRuntime::start(&cfg).is_err());
    }

    #[test]
    fn sends_connect_on_start() {
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut rt = ReceiverRuntime::start(&config_for(sender.local_addr().unwrap())).unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = sender.recv_from(&mut buf).unwrap();
        assert_eq!(from, rt.local_addr().unwrap());
        assert_eq!(
            WireCodec.parse_receiver_header(&buf[..n]),
            Some((5, kinlink_transport::wire::ReceiverPacketType::Connect))
        );
        rt.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut rt = ReceiverRuntime::start(&config_for(sender.local_addr().unwrap())).unwrap();
        assert!(rt.take_playback().is_some());
        assert!(rt.take_playback().is_none());
        rt.shutdown();
        rt.shutdown();
        assert_eq!(rt.stats().last_video_frame_id, NO_FRAME);
    }
}
