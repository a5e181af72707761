//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like provider clients and the background task store.

use crate::config::Config;
use murmur_core::{
    llm::LanguageModel,
    memory::Memory,
    registry::DeviceRegistry,
    speech::{RecognizerKind, SpeechRecognizer, SpeechSynthesizer, VoiceActivityDetector},
    tasks::TaskStore,
    tools::ToolRegistry,
};
use std::sync::Arc;

/// Builds a fresh recognizer for sessions whose backend holds per-connection
/// state and cannot be shared.
pub type RecognizerFactory = Arc<dyn Fn() -> Arc<dyn SpeechRecognizer> + Send + Sync>;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub llm: Arc<dyn LanguageModel>,
    pub vad: Arc<dyn VoiceActivityDetector>,
    /// Shared recognizer instance, used directly when its kind is `Local`.
    pub recognizer: Arc<dyn SpeechRecognizer>,
    /// Present when the recognizer backend is stateful and remote.
    pub recognizer_factory: Option<RecognizerFactory>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub memory: Option<Arc<dyn Memory>>,
    /// Tool calling is disabled for every session when absent.
    pub tools: Option<Arc<ToolRegistry>>,
    /// Management backend; sessions run unbound when absent.
    pub registry: Option<Arc<dyn DeviceRegistry>>,
    pub tasks: TaskStore,
    pub config: Arc<Config>,
}

impl AppState {
    /// Resolves the recognizer a new session should use. Remote recognizers
    /// get a fresh instance per session; local ones share the process-wide
    /// instance.
    pub fn session_recognizer(&self) -> Arc<dyn SpeechRecognizer> {
        match self.recognizer.kind() {
            RecognizerKind::Local => self.recognizer.clone(),
            RecognizerKind::Remote => match &self.recognizer_factory {
                Some(factory) => factory(),
                None => {
                    tracing::warn!("remote recognizer without a factory, sharing the instance");
                    self.recognizer.clone()
                }
            },
        }
    }
}
