use callrelay_core::responder::ResponseMode;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::Level;

pub const DEFAULT_WELCOME_GREETING: &str = "Hi! I'm your voice assistant. Ask me anything!";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Generation backends reachable through the OpenAI-compatible chat API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// When unset, transcripts live in process memory only.
    pub database_url: Option<String>,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub response_mode: ResponseMode,
    pub session_ttl: chrono::Duration,
    pub public_ws_url: Option<String>,
    pub welcome_greeting: String,
    /// Deliver to connections held by an external gateway via its callback URL.
    pub callback_relay: bool,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = non_empty_var("DATABASE_URL");

        let provider_str = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "gemini" => Provider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{}' is not a supported provider", other),
                ));
            }
        };

        let openai_api_key = non_empty_var("OPENAI_API_KEY");
        let gemini_api_key = non_empty_var("GEMINI_API_KEY");

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let response_mode = std::env::var("RESPONSE_MODE")
            .unwrap_or_else(|_| "streaming".to_string())
            .parse::<ResponseMode>()
            .map_err(|e| ConfigError::InvalidValue("RESPONSE_MODE".to_string(), e))?;

        let ttl_str = std::env::var("SESSION_TTL_SECS").unwrap_or_else(|_| "86400".to_string());
        let session_ttl = match ttl_str.parse::<i64>() {
            Ok(secs) if secs > 0 => chrono::Duration::seconds(secs),
            _ => {
                return Err(ConfigError::InvalidValue(
                    "SESSION_TTL_SECS".to_string(),
                    format!("'{}' is not a positive number of seconds", ttl_str),
                ));
            }
        };

        let public_ws_url = non_empty_var("PUBLIC_WS_URL");
        let welcome_greeting = non_empty_var("WELCOME_GREETING")
            .unwrap_or_else(|| DEFAULT_WELCOME_GREETING.to_string());

        let callback_str = std::env::var("CALLBACK_RELAY").unwrap_or_else(|_| "false".to_string());
        let callback_relay = callback_str.parse::<bool>().map_err(|_| {
            ConfigError::InvalidValue(
                "CALLBACK_RELAY".to_string(),
                format!("'{}' is not true or false", callback_str),
            )
        })?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            database_url,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            response_mode,
            session_ttl,
            public_ws_url,
            welcome_greeting,
            callback_relay,
            log_level,
            prompts_path,
        })
    }
}
