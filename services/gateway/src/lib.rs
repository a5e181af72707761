//! Murmur Gateway Library Crate
//!
//! This library contains all the logic for the voice-assistant gateway
//! service: configuration, shared state, routing, and the per-connection
//! WebSocket session machinery. The `gateway` binary is a thin wrapper
//! around this library.

pub mod config;
pub mod router;
pub mod state;
pub mod ws;
