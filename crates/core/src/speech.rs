//! Speech capabilities: activity detection, recognition, synthesis, and the
//! sentence-framed unit type feeding the synthesis pipeline.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use uuid::Uuid;

/// Voice activity detection over one encoded audio frame.
///
/// Implementations must be safe for concurrent use from many sessions; the
/// gateway shares a single process-wide instance.
pub trait VoiceActivityDetector: Send + Sync {
    fn detect(&self, frame: &[u8]) -> bool;
}

/// Default detector: treats every frame as voice, leaving segmentation to
/// the client's listen start/stop messages.
pub struct AlwaysVoice;

impl VoiceActivityDetector for AlwaysVoice {
    fn detect(&self, _frame: &[u8]) -> bool {
        true
    }
}

/// Whether a recognizer instance may be shared across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizerKind {
    /// A pure local model, safe for concurrent independent use; one shared
    /// instance serves all sessions.
    Local,
    /// Holds a stateful remote connection; each session gets its own
    /// instance.
    Remote,
}

/// Speech-to-text over a buffered utterance of encoded frames.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn kind(&self) -> RecognizerKind {
        RecognizerKind::Local
    }

    async fn transcribe(&self, frames: &[Bytes]) -> Result<String>;
}

/// Fallback recognizer used when no speech-to-text backend is configured.
pub struct NullRecognizer;

#[async_trait]
impl SpeechRecognizer for NullRecognizer {
    async fn transcribe(&self, frames: &[Bytes]) -> Result<String> {
        tracing::warn!(
            frames = frames.len(),
            "no recognizer configured, dropping utterance"
        );
        Ok(String::new())
    }
}

/// Text-to-speech for one sentence of output.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

/// Fallback synthesizer: produces no audio. Sessions degrade to text-only
/// output when the configured synthesizer fails to initialize.
pub struct NullSynthesizer;

#[async_trait]
impl SpeechSynthesizer for NullSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        tracing::debug!(chars = text.len(), "null synthesizer dropping sentence");
        Ok(Bytes::new())
    }
}

/// Position of a unit within its turn. Every turn emits exactly one `First`,
/// zero or more `Middle`, and exactly one `Last`, so downstream playback
/// framing cannot desynchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceBoundary {
    First,
    Middle,
    Last,
}

/// What a unit carries.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsContent {
    Text(String),
    /// A pre-rendered audio file to play instead of synthesizing.
    File(PathBuf),
    /// A pure framing marker with nothing to speak.
    Action,
}

/// One item submitted to the synthesis pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsUnit {
    pub turn_id: Uuid,
    pub boundary: SentenceBoundary,
    pub content: TtsContent,
}

impl TtsUnit {
    pub fn first(turn_id: Uuid) -> Self {
        Self {
            turn_id,
            boundary: SentenceBoundary::First,
            content: TtsContent::Action,
        }
    }

    pub fn middle(turn_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            turn_id,
            boundary: SentenceBoundary::Middle,
            content: TtsContent::Text(text.into()),
        }
    }

    pub fn last(turn_id: Uuid) -> Self {
        Self {
            turn_id,
            boundary: SentenceBoundary::Last,
            content: TtsContent::Action,
        }
    }
}
