//! # kinlink-receiver
//!
//! Runs the `kinlink-transport` engines against a real UDP socket: one
//! thread demultiplexes datagrams, another reassembles video, collects
//! audio and answers the sender with retransmission requests.
//!
//! - [`net`]: Non-blocking UDP link to the sender
//! - [`config`]: TOML configuration
//! - [`runtime`]: Socket and worker threads
//! - [`metrics`]: Prometheus rendering and scrape server

pub mod config;
pub mod metrics;
pub mod net;
pub mod runtime;

pub use config::ReceiverConfig;
pub use runtime::{ReceiverRuntime, RuntimeStats};
