//! # Loopback tests: fake sender ↔ ReceiverRuntime over real UDP
//!
//! A plain `UdpSocket` plays the sender: it waits for the connect packet,
//! then streams wire-format video, parity, audio and floor datagrams.

use bytes::Bytes;
use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use kinlink_receiver::{ReceiverConfig, ReceiverRuntime};
use kinlink_transport::fec::{ParityEncoder, split_message};
use kinlink_transport::wire::{
    AudioFragment, FRAGMENT_PAYLOAD_SIZE, FloorPacket, ReceiverPacketType, RequestPacket,
    WireCodec,
};

const SESSION: i32 = 9;

struct FakeSender {
    socket: UdpSocket,
    receiver: SocketAddr,
}

impl FakeSender {
    /// Bind, start a runtime pointed at us, and wait for its connect packet.
    fn start(extra_toml: &str) -> (FakeSender, ReceiverRuntime) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let toml = format!(
            "session_id = {SESSION}\nbind = \"127.0.0.1:0\"\nsender = \"{}\"\n{extra_toml}",
            socket.local_addr().unwrap()
        );
        let config = ReceiverConfig::from_toml_str(&toml).unwrap();
        let rt = ReceiverRuntime::start(&config).unwrap();

        let mut buf = [0u8; 64];
        let (n, receiver) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(
            WireCodec.parse_receiver_header(&buf[..n]),
            Some((SESSION, ReceiverPacketType::Connect))
        );
        (FakeSender { socket, receiver }, rt)
    }

    fn send(&self, datagram: &Bytes) {
        self.socket.send_to(datagram, self.receiver).unwrap();
    }

    /// Send frame `frame_id`, skipping the fragment indices in `lose`.
    fn send_frame(&self, frame_id: i32, len: usize, lose: &[u32]) -> Vec<Bytes> {
        let message: Vec<u8> = (0..len).map(|i| (i as u32 ^ frame_id as u32) as u8).collect();
        let fragments = split_message(frame_id, &message, FRAGMENT_PAYLOAD_SIZE);
        for p in ParityEncoder::new().encode(&fragments) {
            self.send(&WireCodec.encode_parity(SESSION, &p));
        }
        let encoded: Vec<Bytes> = fragments
            .iter()
            .map(|f| WireCodec.encode_video(SESSION, f))
            .collect();
        for (i, d) in encoded.iter().enumerate() {
            if !lose.contains(&(i as u32)) {
                self.send(d);
            }
        }
        encoded
    }

    /// Next retransmission request, skipping connects and reports.
    fn next_request(&self) -> RequestPacket {
        let mut buf = [0u8; 1500];
        loop {
            let (n, _) = self.socket.recv_from(&mut buf).unwrap();
            if let Some((_, ReceiverPacketType::Request)) = WireCodec.parse_receiver_header(&buf[..n]) {
                return WireCodec.parse_request(&buf[..n]).unwrap();
            }
        }
    }
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn frames_delivered_in_order() {
    let (sender, rt) = FakeSender::start("");
    for id in 0..5 {
        sender.send_frame(id, 4000, &[]);
        // Pace so loopback buffers never overflow.
        thread::sleep(Duration::from_millis(2));
    }

    let mut ids = Vec::new();
    while ids.len() < 5 {
        let frame = rt
            .frames()
            .recv_timeout(Duration::from_secs(3))
            .expect("frame");
        ids.push(frame.frame_id());
    }
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
}

#[test]
fn parity_repairs_loss_over_udp() {
    let (sender, rt) = FakeSender::start("");
    sender.send_frame(0, 6000, &[2]);
    thread::sleep(Duration::from_millis(20));
    sender.send_frame(1, 100, &[]);

    let first = rt.frames().recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(first.frame_id(), 0);
    assert_eq!(first.recovered_fragments(), 1);

    let request = sender.next_request();
    assert_eq!(request.frame_id, 0);
    assert!(request.missing.is_empty());
}

#[test]
fn unrecoverable_loss_requested_and_retransmitted() {
    let (sender, rt) = FakeSender::start("");
    let frame0 = sender.send_frame(0, 6000, &[1, 3]);
    thread::sleep(Duration::from_millis(20));
    // Only the first fragment of frame 1, so it cannot complete and
    // advance the watermark past frame 0.
    sender.send_frame(1, 6000, &[1, 2, 3, 4, 5]);

    let request = sender.next_request();
    assert_eq!(request.frame_id, 0);
    assert_eq!(request.missing, vec![1, 3]);

    for i in &request.missing {
        sender.send(&frame0[*i as usize]);
    }
    let frame = rt.frames().recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(frame.frame_id(), 0);
    assert_eq!(frame.recovered_fragments(), 0);
}

#[test]
fn audio_and_floor_reach_the_application() {
    let (sender, mut rt) = FakeSender::start(
        "[audio]\nchannels = 1\nsamples_per_frame = 160\nsample_rate = 16000\n",
    );
    let mut playback = rt.take_playback().unwrap();

    for frame_id in 0..3 {
        let fragment = AudioFragment {
            frame_id,
            payload: Bytes::from(vec![0u8; 320]),
        };
        sender.send(&WireCodec.encode_audio(SESSION, &fragment));
    }
    let floor = FloorPacket {
        plane: [0.0, 1.0, 0.0, 1.2],
    };
    sender.send(&WireCodec.encode_floor(SESSION, &floor));

    assert!(wait_until(|| playback.slots() >= 480));
    assert!(wait_until(|| !rt.floor().is_empty()));
    assert_eq!(rt.floor().drain(), vec![floor]);
}

#[test]
fn foreign_session_ignored_and_counted() {
    let (sender, rt) = FakeSender::start("[runtime]\nstats_interval_ms = 10\n");
    let fragments = split_message(0, b"hello", FRAGMENT_PAYLOAD_SIZE);
    sender.send(&WireCodec.encode_video(SESSION + 1, &fragments[0]));

    assert!(wait_until(|| rt.stats().demux.session_mismatches == 1));
    assert!(rt.frames().try_recv().is_err());
}

#[test]
fn metrics_endpoint_serves_stats() {
    use std::io::{Read, Write};

    let (sender, mut rt) = FakeSender::start("[runtime]\nstats_interval_ms = 10\n");
    sender.send_frame(0, 100, &[]);
    rt.frames().recv_timeout(Duration::from_secs(3)).unwrap();
    let addr = rt
        .start_metrics_server("127.0.0.1:0".parse().unwrap())
        .unwrap();

    assert!(wait_until(|| rt.stats().frames_delivered == 1));
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").unwrap();
    let mut body = String::new();
    stream.read_to_string(&mut body).unwrap();
    assert!(body.contains("kinlink_video_frames_delivered_total 1"));
}
