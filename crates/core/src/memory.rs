//! Conversational memory capability.
//!
//! Memory is optional: when no provider is configured the session simply
//! skips the query and the end-of-session save.

use crate::dialogue::Message;
use anyhow::Result;
use async_trait::async_trait;

/// Long-lived memory attached to a device identity.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Returns a context summary relevant to the given user text, if any.
    async fn query(&self, text: &str) -> Result<Option<String>>;

    /// Persists the final dialogue of a session. Called best-effort from a
    /// detached task during teardown; failures are logged, never surfaced.
    async fn save(&self, dialogue: &[Message]) -> Result<()>;
}

/// No-op memory used when the capability is disabled.
pub struct NoMemory;

#[async_trait]
impl Memory for NoMemory {
    async fn query(&self, _text: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn save(&self, _dialogue: &[Message]) -> Result<()> {
        Ok(())
    }
}
