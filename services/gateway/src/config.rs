use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub llm_api_key: String,
    pub llm_api_base: Option<String>,
    pub chat_model: String,
    /// Management backend; sessions run unbound when absent.
    pub registry_url: Option<String>,
    pub registry_secret: Option<String>,
    /// Bearer token required on the upgrade request when set.
    pub auth_token: Option<String>,
    pub idle_timeout: Duration,
    pub max_history_rounds: usize,
    pub default_prompt: String,
    pub log_level: Level,
}

const DEFAULT_PROMPT: &str =
    "You are a friendly voice assistant. Keep answers short and conversational.";

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let llm_api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| ConfigError::MissingVar("LLM_API_KEY".to_string()))?;
        let llm_api_base = std::env::var("LLM_API_BASE").ok();
        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let registry_url = std::env::var("REGISTRY_URL").ok();
        let registry_secret = std::env::var("REGISTRY_SECRET").ok();
        if registry_url.is_some() && registry_secret.is_none() {
            return Err(ConfigError::MissingVar(
                "REGISTRY_SECRET must be set when REGISTRY_URL is set".to_string(),
            ));
        }

        let auth_token = std::env::var("AUTH_TOKEN").ok();

        let idle_timeout_str =
            std::env::var("IDLE_TIMEOUT_SECS").unwrap_or_else(|_| "120".to_string());
        let idle_timeout_secs = idle_timeout_str.parse::<u64>().map_err(|e| {
            ConfigError::InvalidValue("IDLE_TIMEOUT_SECS".to_string(), e.to_string())
        })?;

        let max_history_rounds_str =
            std::env::var("MAX_HISTORY_ROUNDS").unwrap_or_else(|_| "5".to_string());
        let max_history_rounds = max_history_rounds_str.parse::<usize>().map_err(|e| {
            ConfigError::InvalidValue("MAX_HISTORY_ROUNDS".to_string(), e.to_string())
        })?;

        let default_prompt =
            std::env::var("DEFAULT_PROMPT").unwrap_or_else(|_| DEFAULT_PROMPT.to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            llm_api_key,
            llm_api_base,
            chat_model,
            registry_url,
            registry_secret,
            auth_token,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            max_history_rounds,
            default_prompt,
            log_level,
        })
    }
}
