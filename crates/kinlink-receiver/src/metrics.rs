//! # Prometheus Metrics
//!
//! Renders receiver stats in Prometheus text exposition format and provides
//! a lightweight HTTP server for scraping.

use std::fmt::Write;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::runtime::RuntimeStats;

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP kinlink_{name} {help}");
    let _ = writeln!(out, "# TYPE kinlink_{name} {kind}");
    let _ = writeln!(out, "kinlink_{name} {value}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    metric(out, name, "counter", help, value);
}

/// Render a stats snapshot as Prometheus text exposition format.
pub fn render_prometheus(stats: &RuntimeStats) -> String {
    let mut out = String::with_capacity(4096);
    let d = &stats.demux;
    let v = &stats.video;
    let a = &stats.audio;

    // ── Demux ───────────────────────────────────────────────────

    counter(&mut out, "datagrams_total", "Datagrams received.", d.datagrams);
    counter(&mut out, "bytes_total", "Bytes received.", d.bytes);
    let _ = writeln!(out, "# HELP kinlink_packets_routed_total Packets routed per queue.");
    let _ = writeln!(out, "# TYPE kinlink_packets_routed_total counter");
    for (queue, n) in [
        ("video", d.video_routed),
        ("parity", d.parity_routed),
        ("audio", d.audio_routed),
        ("floor", d.floor_routed),
    ] {
        let _ = writeln!(out, "kinlink_packets_routed_total{{queue=\"{queue}\"}} {n}");
    }
    counter(
        &mut out,
        "session_mismatches_total",
        "Datagrams from another session.",
        d.session_mismatches,
    );
    counter(&mut out, "malformed_total", "Datagrams that failed to parse.", d.malformed);
    counter(&mut out, "socket_errors_total", "Socket receive faults.", stats.socket_errors);

    // ── Video ───────────────────────────────────────────────────

    counter(
        &mut out,
        "video_fragments_total",
        "Video fragments processed.",
        v.fragments_received,
    );
    counter(
        &mut out,
        "video_fragments_recovered_total",
        "Fragments rebuilt from XOR parity.",
        v.fragments_recovered,
    );
    counter(
        &mut out,
        "video_stale_fragments_total",
        "Fragments at or below the delivered watermark.",
        v.stale_fragments,
    );
    counter(
        &mut out,
        "video_requests_total",
        "Retransmission requests sent.",
        v.requests_sent,
    );
    counter(
        &mut out,
        "video_indices_requested_total",
        "Fragment indices listed in retransmission requests.",
        v.indices_requested,
    );
    counter(
        &mut out,
        "video_frames_completed_total",
        "Frames reassembled.",
        v.frames_completed,
    );
    counter(
        &mut out,
        "video_frames_dropped_total",
        "Incomplete frames superseded by a newer delivery.",
        v.frames_dropped,
    );
    counter(
        &mut out,
        "video_frames_delivered_total",
        "Frames handed to the application.",
        stats.frames_delivered,
    );
    counter(
        &mut out,
        "video_frames_backpressure_total",
        "Frames dropped because the application fell behind.",
        stats.frames_dropped_backpressure,
    );
    metric(
        &mut out,
        "video_open_collections",
        "gauge",
        "Frames currently being reassembled.",
        v.open_collections,
    );
    metric(
        &mut out,
        "video_recovery_ratio",
        "gauge",
        "Share of lost fragments repaired by parity.",
        format!("{:.6}", v.recovery_ratio()),
    );
    metric(
        &mut out,
        "video_last_frame_id",
        "gauge",
        "Highest delivered video frame id.",
        stats.last_video_frame_id,
    );

    // ── Audio ───────────────────────────────────────────────────

    counter(&mut out, "audio_frames_played_total", "Audio frames decoded.", a.frames_played);
    counter(
        &mut out,
        "audio_backpressure_total",
        "Audio frames dropped with playback full.",
        a.dropped_backpressure,
    );
    counter(
        &mut out,
        "audio_decode_failures_total",
        "Audio frames the decoder rejected.",
        a.decode_failures,
    );
    metric(
        &mut out,
        "audio_last_frame_id",
        "gauge",
        "Highest decoded audio frame id.",
        stats.last_audio_frame_id,
    );

    out
}

/// A lightweight HTTP server that serves `/metrics` for Prometheus scraping.
///
/// Runs in a background thread, reading the shared stats snapshot the
/// runtime publishes.
pub struct MetricsServer {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn start(bind_addr: SocketAddr, source: Arc<Mutex<RuntimeStats>>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let handle = thread::Builder::new()
            .name("kinlink-metrics".into())
            .spawn(move || serve_loop(listener, source, running_clone))?;

        Ok(MetricsServer {
            running,
            handle: Some(handle),
            addr,
        })
    }

    /// The address the server is actually listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(listener: TcpListener, source: Arc<Mutex<RuntimeStats>>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                let snap = source.lock().unwrap_or_else(|e| e.into_inner()).clone();
                handle_connection(stream, &snap);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, stats: &RuntimeStats) {
    // Accepted sockets inherit non-blocking mode on some platforms.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    if request.starts_with("GET /metrics") {
        let body = render_prometheus(stats);
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes());
    } else {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let _ = stream.write_all(response.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RuntimeStats {
        let mut stats = RuntimeStats::default();
        stats.demux.datagrams = 120;
        stats.demux.video_routed = 100;
        stats.demux.parity_routed = 20;
        stats.video.fragments_recovered = 3;
        stats.video.indices_requested = 1;
        stats.video.frames_completed = 9;
        stats.frames_delivered = 9;
        stats.last_video_frame_id = 8;
        stats
    }

    #[test]
    fn render_contains_counters() {
        let text = render_prometheus(&sample());
        assert!(text.contains("kinlink_datagrams_total 120"));
        assert!(text.contains("kinlink_packets_routed_total{queue=\"video\"} 100"));
        assert!(text.contains("kinlink_packets_routed_total{queue=\"parity\"} 20"));
        assert!(text.contains("kinlink_video_frames_completed_total 9"));
        assert!(text.contains("kinlink_video_recovery_ratio 0.750000"));
        assert!(text.contains("kinlink_video_last_frame_id 8"));
        assert!(text.contains("kinlink_audio_last_frame_id -1"));
    }

    #[test]
    fn every_metric_has_help_and_type() {
        let text = render_prometheus(&RuntimeStats::default());
        let help = text.lines().filter(|l| l.starts_with("# HELP")).count();
        let kind = text.lines().filter(|l| l.starts_with("# TYPE")).count();
        assert_eq!(help, kind);
        assert!(help > 10);
    }

    #[test]
    fn server_serves_metrics_and_404() {
        let source = Arc::new(Mutex::new(sample()));
        let mut server = MetricsServer::start("127.0.0.1:0".parse().unwrap(), source).unwrap();

        let get = |path: &str| {
            let mut stream = TcpStream::connect(server.addr()).unwrap();
            stream
                .write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
                .unwrap();
            let mut body = String::new();
            stream.read_to_string(&mut body).unwrap();
            body
        };

        let ok = get("/metrics");
        assert!(ok.starts_with("HTTP/1.1 200 OK"));
        assert!(ok.contains("kinlink_datagrams_total 120"));
        assert!(get("/other").starts_with("HTTP/1.1 404"));
        server.stop();
    }
}
