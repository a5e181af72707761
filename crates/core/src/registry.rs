//! Device registry client: per-device configuration lookup and chat
//! reporting against the management backend.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a device configuration lookup.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The device is not registered and the backend issued no binding code.
    #[error("device is not registered")]
    NotFound,
    /// The device must be bound first; carries the code to read to the user.
    #[error("device needs binding with code {0}")]
    NeedsBinding(String),
    /// The backend refused the request for some other reason.
    #[error("registry rejected the request: {0}")]
    Rejected(String),
    #[error("registry transport error")]
    Transport(#[from] reqwest::Error),
}

/// Per-device overrides layered over the gateway defaults. Every field is
/// optional so a sparse backend response leaves the defaults in place.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ConfigOverlay {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub max_history_rounds: Option<usize>,
    #[serde(default)]
    pub report_chat: bool,
    #[serde(default)]
    pub summary_memory: bool,
    #[serde(default)]
    pub max_output_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Asr,
    Tts,
}

/// One line of transcript reported to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReport {
    pub device_id: String,
    pub session_id: String,
    pub kind: ReportKind,
    pub text: String,
}

/// Management-backend operations used by a session.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Looks up the configuration overlay for a device, or the reason it
    /// cannot have one yet.
    async fn fetch_device_config(
        &self,
        device_id: &str,
        client_id: &str,
    ) -> Result<ConfigOverlay, RegistryError>;

    /// Uploads one transcript line. Callers treat failures as best-effort.
    async fn report_chat(&self, report: ChatReport) -> Result<()>;
}

/// Backend response envelope. `code` 0 is success; a couple of well-known
/// codes distinguish unregistered devices from devices awaiting binding.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

const CODE_OK: i64 = 0;
const CODE_DEVICE_NOT_FOUND: i64 = 10041;
const CODE_DEVICE_NEEDS_BIND: i64 = 10042;

fn decode_config_envelope(
    envelope: ApiEnvelope<ConfigOverlay>,
) -> Result<ConfigOverlay, RegistryError> {
    match envelope.code {
        CODE_OK => Ok(envelope.data.unwrap_or_default()),
        CODE_DEVICE_NOT_FOUND => Err(RegistryError::NotFound),
        CODE_DEVICE_NEEDS_BIND => {
            let code = envelope.msg.unwrap_or_default();
            if code.is_empty() {
                Err(RegistryError::NotFound)
            } else {
                Err(RegistryError::NeedsBinding(code))
            }
        }
        other => Err(RegistryError::Rejected(
            envelope
                .msg
                .unwrap_or_else(|| format!("unexpected status code {other}")),
        )),
    }
}

/// HTTP client for the management backend.
pub struct HttpDeviceRegistry {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl HttpDeviceRegistry {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl DeviceRegistry for HttpDeviceRegistry {
    async fn fetch_device_config(
        &self,
        device_id: &str,
        client_id: &str,
    ) -> Result<ConfigOverlay, RegistryError> {
        let url = format!("{}/config/agent-models", self.base_url);
        let envelope: ApiEnvelope<ConfigOverlay> = self
            .client
            .post(&url)
            .bearer_auth(&self.secret)
            .json(&serde_json::json!({
                "macAddress": device_id,
                "clientId": client_id,
            }))
            .send()
            .await?
            .json()
            .await?;
        decode_config_envelope(envelope)
    }

    async fn report_chat(&self, report: ChatReport) -> Result<()> {
        let url = format!("{}/agent/chat-history/report", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret)
            .json(&report)
            .send()
            .await?;
        let envelope: ApiEnvelope<serde_json::Value> = response.json().await?;
        if envelope.code != CODE_OK {
            anyhow::bail!(
                "chat report rejected: {}",
                envelope.msg.unwrap_or_else(|| envelope.code.to_string())
            );
        }
        Ok(())
    }
}
