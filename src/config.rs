//! Environment-based configuration and shared application state.

use std::env;
use std::sync::Arc;

use crate::broker::ProgressBroker;
use crate::store::Store;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Server config
    pub host: String,
    pub port: u16,

    /// Base URL of the remote step worker.
    pub worker_base_url: String,

    /// Postgres connection string; absent selects the in-process store.
    pub database_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: env::var("DISCOVERY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("DISCOVERY_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            worker_base_url: env::var("WORKER_BASE_URL")
                .unwrap_or_else(|_| "http://pioneer:8094/pioneer".to_string()),
            database_url: env::var("DATABASE_URL").ok(),
        }
    }

    /// Get server bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub broker: Arc<ProgressBroker>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        // No overall client timeout: step invocations carry per-request
        // budgets of up to 990s.
        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            config: Arc::new(config),
            store,
            broker: Arc::new(ProgressBroker::new()),
            http_client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 9000,
            worker_base_url: "http://localhost".to_string(),
            database_url: None,
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
    }
}
