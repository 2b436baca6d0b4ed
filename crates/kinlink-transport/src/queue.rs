//! # Delivery Queues
//!
//! The only state shared between the socket thread and the processing
//! thread. Each packet type gets its own unbounded MPMC queue; ordering is
//! FIFO within a queue and unspecified across queues.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::wire::{AudioFragment, ParityFragment, VideoFragment};

/// Unbounded multi-producer/multi-consumer queue with snapshot drain.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug)]
pub struct DeliveryQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for DeliveryQueue<T> {
    fn clone(&self) -> Self {
        DeliveryQueue {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for DeliveryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeliveryQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        DeliveryQueue { tx, rx }
    }

    /// Enqueue without blocking.
    pub fn push(&self, item: T) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(item);
    }

    /// Take everything queued at the moment of the call.
    ///
    /// Items pushed concurrently after the snapshot stay queued for the next
    /// drain, so a flooding producer cannot keep the consumer looping.
    pub fn drain(&self) -> Vec<T> {
        let n = self.rx.len();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.rx.try_recv() {
                Ok(item) => out.push(item),
                Err(_) => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Consumer end, for callers that want blocking receives.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

/// The per-type queues the demultiplexer feeds and the engines drain.
#[derive(Debug, Clone, Default)]
pub struct InboundQueues {
    pub video: DeliveryQueue<VideoFragment>,
    pub parity: DeliveryQueue<ParityFragment>,
    pub audio: DeliveryQueue<AudioFragment>,
}

impl InboundQueues {
    pub fn new() -> Self {
        Self::default()
    }
}
