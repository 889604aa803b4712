//! Embedded subject-based message bus.
//!
//! The coordinator hosts a small broker ([`BusServer`]); both roles speak to
//! it through [`BusClient`]. Frames are newline-delimited JSON over TCP,
//! subjects are exact-match strings (no wildcards), and delivery is
//! fire-and-forget fan-out to the subject's current subscribers.

mod client;
mod server;
mod wire;

pub use client::{BusClient, ConnectOptions};
pub use server::BusServer;
