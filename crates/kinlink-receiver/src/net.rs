//! Non-blocking UDP link to the sender.

use bytes::Bytes;
use std::io;
use std::net::{SocketAddr, UdpSocket};

use kinlink_transport::socket::DatagramSocket;
use kinlink_transport::wire::MAX_PACKET_SIZE;

/// Receive scratch size; anything past `MAX_PACKET_SIZE` is not ours.
const RECV_BUF: usize = MAX_PACKET_SIZE + 512;

/// A UDP socket connected to one sender and set non-blocking.
///
/// Shared between the socket thread (receives) and the processing thread
/// (retransmission requests and reports) behind an `Arc`.
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpLink {
    /// Bind `local` and connect to `sender`. Datagrams from other peers are
    /// filtered by the kernel.
    pub fn connect(local: SocketAddr, sender: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        Self::from_socket(socket, sender)
    }

    /// Wrap an already-bound socket.
    pub fn from_socket(socket: UdpSocket, sender: SocketAddr) -> io::Result<Self> {
        socket.connect(sender)?;
        socket.set_nonblocking(true)?;
        Ok(UdpLink {
            socket,
            peer: sender,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl DatagramSocket for UdpLink {
    fn try_recv(&self) -> io::Result<Option<Bytes>> {
        let mut buf = [0u8; RECV_BUF];
        match self.socket.recv(&mut buf) {
            Ok(n) => Ok(Some(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram).map(|_| ())
    }
}
