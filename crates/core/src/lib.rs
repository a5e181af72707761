//! Murmur Core Library
//!
//! Provider-facing building blocks for the murmur voice gateway: the dialogue
//! model, the capability traits (language model, speech recognition and
//! synthesis, voice activity detection, memory), the closed tool registry,
//! the device-registry client, and the injected background task store.
//! The gateway service in `services/gateway` composes these into the
//! per-connection session core.

pub mod dialogue;
pub mod llm;
pub mod memory;
pub mod registry;
pub mod speech;
pub mod tasks;
pub mod tools;
