use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Process configuration loaded from environment variables.
///
/// Runtime-tunable settings (poll intervals, dispatch weights, retention)
/// live in the `system_settings` table instead; see `kernel::settings`.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub secret_key: String,
    pub db_path: String,
    pub admin_password: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8001".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            secret_key: env::var("SECRET_KEY").context("SECRET_KEY must be set")?,
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "data/fleet.db".to_string()),
            admin_password: env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin123".to_string()),
        })
    }
}
