//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PIPEGATE_LISTEN`, `PIPEGATE_CLIENT_TOKEN`,
//!    `PIPEGATE_JWT_SECRET`
//! 2. **Config file** — path via `--config <path>`, or `pipegate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8000"
//! request_timeout_secs = 30
//! max_body_bytes = 10485760  # 10 MiB
//! drain_grace_secs = 5
//!
//! [auth]
//! client_token = "your-shared-secret"
//! # JWT mode instead — takes precedence when set:
//! # jwt_secret = "your-signing-secret"
//! # jwt_algorithms = ["HS256"]
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Public server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Deadline in seconds for a tunneled request's response (default 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum public request body size in bytes (default 10 MiB). Larger
    /// bodies are rejected with 413.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Seconds to wait for sessions to drain on shutdown (default 5).
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,
}

/// Tunnel authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared bearer token. Override with `PIPEGATE_CLIENT_TOKEN`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_client_token")]
    pub client_token: String,
    /// HMAC secret for JWT bearer tokens. When set, tokens are verified as
    /// JWTs and `client_token` is ignored. Override with `PIPEGATE_JWT_SECRET`.
    pub jwt_secret: Option<String>,
    /// Accepted JWT algorithms (default `["HS256"]`).
    #[serde(default = "default_jwt_algorithms")]
    pub jwt_algorithms: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}
fn default_drain_grace_secs() -> u64 {
    5
}
fn default_client_token() -> String {
    "change-me".to_string()
}
fn default_jwt_algorithms() -> Vec<String> {
    vec!["HS256".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            drain_grace_secs: default_drain_grace_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_token: default_client_token(),
            jwt_secret: None,
            jwt_algorithms: default_jwt_algorithms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `pipegate.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("pipegate.toml").exists() {
            let content =
                std::fs::read_to_string("pipegate.toml").expect("Failed to read pipegate.toml");
            toml::from_str(&content).expect("Failed to parse pipegate.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("PIPEGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(token) = std::env::var("PIPEGATE_CLIENT_TOKEN") {
            config.auth.client_token = token;
        }
        if let Ok(secret) = std::env::var("PIPEGATE_JWT_SECRET") {
            config.auth.jwt_secret = Some(secret);
        }

        config
    }
}
