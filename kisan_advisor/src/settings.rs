//! Configuration management with environment variable support and validation.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::coordinator::Strategy;

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
    /// Base URL used when building links to stored media.
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 120,
            public_base_url: "http://localhost:8080".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String, // "gemini" or "scripted"
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-2.0-flash".to_string(),
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            temperature: 0.4,
            max_output_tokens: 2_048,
        }
    }
}

/// Coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub strategy: String,
    pub capability_timeout_seconds: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_tool_rounds: usize,
    pub capabilities_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: "dispatcher".to_string(),
            capability_timeout_seconds: 60,
            max_attempts: 1,
            retry_backoff_ms: 500,
            max_tool_rounds: 8,
            capabilities_file: None,
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_authentication: bool,
    pub jwt_secret: Option<String>,
    pub jwt_expiry_hours: i64,
    pub jwt_issuer: String,
    pub cors_origins: Vec<String>,
    pub enable_rate_limiting: bool,
    pub rate_limit_per_minute: u32,
    pub max_request_size_mb: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_authentication: true,
            jwt_secret: None,
            jwt_expiry_hours: 24,
            jwt_issuer: "kisan-advisor".to_string(),
            cors_origins: vec!["*".to_string()],
            enable_rate_limiting: true,
            rate_limit_per_minute: 120,
            max_request_size_mb: 10,
        }
    }
}

/// Conversation and media storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
    pub app_id: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/conversations.sled"),
            media_dir: PathBuf::from("data/media"),
            app_id: "kisan-advisor".to_string(),
        }
    }
}

/// Plain tools offered to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub crop_calendar_path: PathBuf,
    pub weather_api_key: Option<String>,
    pub weather_base_url: String,
    pub forecast_days: u8,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            crop_calendar_path: PathBuf::from("data/crop_calendar.json"),
            weather_api_key: None,
            weather_base_url: "http://api.weatherapi.com/v1".to_string(),
            forecast_days: 5,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub llm: LlmConfig,
    pub orchestrator: OrchestratorConfig,
    pub security: SecurityConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, `kisan.toml` and the environment
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("kisan").required(false))
            // KISAN__SERVER__PORT=9000 and friends
            .add_source(
                Environment::with_prefix("KISAN")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("security.cors_origins")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        let mut settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize settings")?;

        Self::apply_env_overrides(&mut settings)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Apply the well-known deployment variables
    fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
        if let Ok(key) = std::env::var("GEMINI_API_KEY").or_else(|_| std::env::var("GOOGLE_API_KEY")) {
            settings.llm.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("MODEL_NAME") {
            settings.llm.model = model;
        }
        if let Ok(key) = std::env::var("WEATHER_API_KEY") {
            settings.tools.weather_api_key = Some(key);
        }
        if let Ok(port) = std::env::var("PORT") {
            settings.server.port = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {}", port))?;
        }
        if let Ok(secret) = std::env::var("KISAN_JWT_SECRET") {
            settings.security.jwt_secret = Some(secret);
        }

        Ok(())
    }

    /// Validate settings for consistency and security
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.server.request_timeout_seconds == 0 {
            return Err(anyhow!("Request timeout cannot be 0"));
        }

        if self.security.enable_authentication && self.security.jwt_secret.is_none() {
            return Err(anyhow!("Authentication enabled but no JWT secret provided"));
        }

        if self.llm.provider == "gemini" && self.llm.api_key.is_none() {
            return Err(anyhow!(
                "Gemini provider requires GEMINI_API_KEY or GOOGLE_API_KEY"
            ));
        }

        self.strategy()?;

        if self.orchestrator.capability_timeout_seconds == 0 {
            return Err(anyhow!("Capability timeout cannot be 0"));
        }
        if self.orchestrator.max_attempts == 0 {
            return Err(anyhow!("Max attempts cannot be 0"));
        }

        if let Some(path) = &self.orchestrator.capabilities_file {
            if !path.exists() {
                warn!("Capability override file does not exist: {:?}", path);
            }
        }
        if !self.tools.crop_calendar_path.exists() {
            warn!(
                "Crop calendar file does not exist: {:?}",
                self.tools.crop_calendar_path
            );
        }

        Ok(())
    }

    pub fn strategy(&self) -> Result<Strategy> {
        self.orchestrator
            .strategy
            .parse()
            .map_err(|e| anyhow!("{}", e))
    }

    /// Settings for offline runs and tests: scripted engine, no auth.
    pub fn offline() -> Self {
        let mut settings = Self::default();
        settings.llm.provider = "scripted".to_string();
        settings.security.enable_authentication = false;
        settings
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
