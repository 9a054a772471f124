use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime configuration for the storyteller server.
///
/// Values come from environment variables (a `.env` file is loaded in
/// `main`), with CLI flags overriding the bind address, database path and
/// dev mode.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Permissive CORS for a local frontend dev server.
    pub dev_mode: bool,
    /// HMAC secret for access tokens.
    pub secret_key: String,
    pub access_token_expire_minutes: i64,
    pub github_token: Option<String>,
    pub gemini_api_key: Option<String>,
    pub max_total_connections: usize,
    pub max_connections_per_user: usize,
    pub ws_rate_limit_window: Duration,
    pub ws_rate_limit_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            db_path: PathBuf::from("data/storyteller.db"),
            dev_mode: false,
            secret_key: "dev-secret-change-me".to_string(),
            access_token_expire_minutes: 30,
            github_token: None,
            gemini_api_key: None,
            max_total_connections: 1000,
            max_connections_per_user: 5,
            ws_rate_limit_window: Duration::from_secs(60),
            ws_rate_limit_count: 5,
        }
    }
}

impl Config {
    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let port = match std::env::var("PORT") {
            Ok(v) => v.parse::<u16>().context("PORT must be a port number")?,
            Err(_) => defaults.port,
        };
        Ok(Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port,
            db_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            dev_mode: false,
            secret_key: std::env::var("SECRET_KEY").unwrap_or(defaults.secret_key),
            access_token_expire_minutes: defaults.access_token_expire_minutes,
            github_token: std::env::var("GITHUB_TOKEN").ok(),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            max_total_connections: defaults.max_total_connections,
            max_connections_per_user: defaults.max_connections_per_user,
            ws_rate_limit_window: defaults.ws_rate_limit_window,
            ws_rate_limit_count: defaults.ws_rate_limit_count,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
