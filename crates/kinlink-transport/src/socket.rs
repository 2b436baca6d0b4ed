//! Non-blocking datagram socket seam.

use bytes::Bytes;
use std::io;

/// A datagram socket polled without blocking.
///
/// `try_recv` returns `Ok(None)` when nothing is pending; any other error is
/// a socket fault and is passed through to the caller untouched.
pub trait DatagramSocket {
    fn try_recv(&self) -> io::Result<Option<Bytes>>;
    fn send(&self, datagram: &[u8]) -> io::Result<()>;
}

impl<S: DatagramSocket + ?Sized> DatagramSocket for &S {
    fn try_recv(&self) -> io::Result<Option<Bytes>> {
        (**self).try_recv()
    }

    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        (**self).send(datagram)
    }
}

impl<S: DatagramSocket + ?Sized> DatagramSocket for std::sync::Arc<S> {
    fn try_recv(&self) -> io::Result<Option<Bytes>> {
        (**self).try_recv()
    }

    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        (**self).send(datagram)
    }
}
