//! WebSocket Session Management
//!
//! This module contains the core logic for handling real-time device sessions
//! over WebSockets. It is structured into submodules for clarity:
//!
//! - `protocol`: Defines the JSON-based control message format.
//! - `codec`: Binary audio frame headers and the relayed-gateway prefix.
//! - `reorder`: Timestamp-based reordering of inbound audio frames.
//! - `session`: Manages the connection lifecycle, from handshake to teardown.
//! - `turn`: Drives one user turn through the language model and tools.
//! - `report`: Background upload of chat transcripts to the registry.

pub mod codec;
pub mod protocol;
pub mod reorder;
pub mod report;
pub mod session;
pub mod turn;

pub use session::ws_handler;
