//! Worker-side connection to a scan pool coordinator.
//!
//! [`Client::connect`] keeps one WebSocket open to the coordinator,
//! reconnecting after a fixed delay, and exposes inbound commands as a
//! [`ClientEvent`] stream.

pub mod client;
pub mod config;
pub mod error;

pub use client::{Client, ClientEvent};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
