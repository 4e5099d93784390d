//! Client for accord-style chat gateways.
//!
//! Keeps one logical gateway session alive across reconnects (resuming
//! where the server allows it), delivers dispatched events to handlers in
//! exact server sequence order, and schedules REST requests so the
//! server's per-route and global rate limits are never exceeded.

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod task;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use error::ClientError;
pub use gateway::ConnectionStatus;
