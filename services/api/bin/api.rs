//! Main Entrypoint for the Call Relay API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Choosing the session store (PostgreSQL when configured, memory otherwise).
//! 3. Building the generation client, responder, and relay channels.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use callrelay_api::{
    config::{Config, Provider},
    db::Db,
    relay::{
        channel::{CallbackChannel, ConnectionRegistry, RelayChannels},
        orchestrator::Orchestrator,
    },
    router::create_router,
    state::AppState,
    store::{MemorySessionStore, SessionStore, Sessions},
};
use callrelay_core::{
    llm_client::{LLMClient, OpenAICompatibleClient},
    responder::{DEFAULT_SYSTEM_PROMPT, responder_for},
};
use sqlx::PgPool;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content.trim().to_string());
        }
    }
    Ok(prompts)
}

fn llm_config(config: &Config) -> anyhow::Result<OpenAIConfig> {
    let openai_config = match &config.provider {
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            let api_key = config
                .openai_api_key
                .as_ref()
                .context("OPENAI_API_KEY is not set")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://api.openai.com/v1/")
        }
        Provider::Gemini => {
            info!("Using Gemini provider.");
            let api_key = config
                .gemini_api_key
                .as_ref()
                .context("GEMINI_API_KEY is not set")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://generativelanguage.googleapis.com/v1beta/openai")
        }
    };
    Ok(openai_config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 2. Initialize Session Store ---
    let store: Arc<dyn SessionStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPool::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            let db = Arc::new(Db::new(pool));
            db.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");

            let purger = db.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    ticker.tick().await;
                    match purger.purge_expired().await {
                        Ok(0) => {}
                        Ok(n) => info!(purged = n, "Removed expired sessions"),
                        Err(e) => warn!(error = %e, "Failed to purge expired sessions"),
                    }
                }
            });
            db
        }
        None => {
            warn!("DATABASE_URL not set; sessions are kept in memory and lost on restart.");
            let memory = Arc::new(MemorySessionStore::new());

            let purger = memory.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    ticker.tick().await;
                    let n = purger.purge_expired().await;
                    if n > 0 {
                        info!(purged = n, "Removed expired sessions");
                    }
                }
            });
            memory
        }
    };

    // --- 3. Initialize Shared Services ---
    let prompts = match load_prompts(&config.prompts_path) {
        Ok(prompts) => prompts,
        Err(e) => {
            warn!(path = ?config.prompts_path, error = %e, "Could not read prompts directory");
            HashMap::new()
        }
    };
    let system_prompt = Arc::new(match prompts.get("system_prompt") {
        Some(prompt) if !prompt.is_empty() => prompt.clone(),
        _ => {
            warn!("system_prompt.md not found; using the built-in system prompt.");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    });

    let llm_client: Arc<dyn LLMClient> = Arc::new(OpenAICompatibleClient::new(
        llm_config(&config)?,
        config.chat_model.clone(),
    ));
    let responder = responder_for(config.response_mode, llm_client);

    let registry = Arc::new(ConnectionRegistry::new());
    let callback = if config.callback_relay {
        Some(CallbackChannel::from_env(CALLBACK_TIMEOUT).await)
    } else {
        None
    };
    let channels = Arc::new(RelayChannels::new(registry.clone(), callback));

    let sessions = Sessions::new(store.clone(), system_prompt, config.session_ttl);
    let orchestrator = Arc::new(Orchestrator::new(sessions, responder, channels));

    let app_state = Arc::new(AppState {
        orchestrator,
        registry,
        store,
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        response_mode = %config.response_mode,
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
