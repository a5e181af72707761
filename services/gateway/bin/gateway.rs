//! Main Entrypoint for the Murmur Gateway
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Initializing shared provider instances (LLM, speech, tools, registry).
//! 4. Constructing the Axum router.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use murmur_core::{
    llm::OpenAiCompatibleModel,
    registry::{DeviceRegistry, HttpDeviceRegistry},
    speech::{AlwaysVoice, NullRecognizer, NullSynthesizer},
    tasks::TaskStore,
    tools::ToolRegistry,
};
use murmur_gateway::{config::Config, router::create_router, state::AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Providers ---
    let mut openai_config = OpenAIConfig::new().with_api_key(&config.llm_api_key);
    if let Some(base) = &config.llm_api_base {
        openai_config = openai_config.with_api_base(base);
    }
    let llm = Arc::new(OpenAiCompatibleModel::new(
        openai_config,
        config.chat_model.clone(),
    ));

    let registry: Option<Arc<dyn DeviceRegistry>> =
        match (&config.registry_url, &config.registry_secret) {
            (Some(url), Some(secret)) => {
                info!(registry = %url, "device registry enabled");
                Some(Arc::new(HttpDeviceRegistry::new(url.clone(), secret.clone())))
            }
            _ => {
                info!("no device registry configured, sessions run unbound");
                None
            }
        };

    let tasks = TaskStore::new();
    let tools = Arc::new(ToolRegistry::with_builtins(tasks.clone()));

    let app_state = Arc::new(AppState {
        llm,
        vad: Arc::new(AlwaysVoice),
        recognizer: Arc::new(NullRecognizer),
        recognizer_factory: None,
        synthesizer: Arc::new(NullSynthesizer),
        memory: None,
        tools: Some(tools),
        registry,
        tasks,
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router ---
    let app = create_router(app_state);

    // --- 5. Start Server ---
    info!(
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
