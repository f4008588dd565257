//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub actor: ActorConfig,
    pub signing: SigningConfig,
    pub verification: VerificationConfig,
    pub delivery: DeliveryConfig,
    pub fanout: FanoutConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "blog.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://blog.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Local actor identity
///
/// The single federated identity this deployment serves. Provisioned by the
/// deployment; never mutated at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    /// Canonical actor URL (e.g., "https://blog.example.com/actor")
    pub url: String,
    /// Key identifier advertised in Signature headers.
    /// Defaults to `<actor url>#main-key`.
    pub key_id: Option<String>,
}

impl ActorConfig {
    pub fn key_id(&self) -> String {
        self.key_id
            .clone()
            .unwrap_or_else(|| format!("{}#main-key", self.url))
    }
}

/// Signing key configuration
///
/// Exactly one source must be set. The key itself never leaves the signer.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SigningConfig {
    /// PKCS#8 PEM-encoded RSA private key (inline, e.g. from a secret store)
    pub private_key_pem: Option<String>,
    /// Path to a PKCS#8 PEM-encoded RSA private key file
    pub private_key_path: Option<PathBuf>,
}

/// Inbound verification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    /// Maximum Date header skew in either direction, in seconds
    pub date_window_seconds: i64,
}

/// Delivery worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum tasks pulled per worker run
    pub batch_size: u32,
    /// Seconds between worker runs
    pub interval_seconds: u64,
    /// Per-request timeout for outbound POSTs, in seconds
    pub request_timeout_seconds: u64,
    /// Maximum bytes read from a remote inbox response
    pub max_response_bytes: usize,
    /// Seconds a leased task stays invisible before redelivery
    pub visibility_timeout_seconds: i64,
    /// Maximum times a task may be dequeued before dead-lettering
    pub max_delivery_count: i64,
    /// Maximum concurrent in-flight deliveries per run
    pub max_concurrent: usize,
}

/// Fan-out planner configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Path to the outbox document produced by the publishing pipeline
    pub outbox_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format ("pretty" or "json")
    pub format: String,
}

impl AppConfig {
    /// Load configuration from files and environment
    ///
    /// # Priority (lowest to highest)
    /// 1. Default values
    /// 2. config/default.toml
    /// 3. config/local.toml
    /// 4. Environment variables (SIGNALPOST__*)
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("verification.date_window_seconds", 300)?
            .set_default("delivery.batch_size", 32)?
            .set_default("delivery.interval_seconds", 60)?
            .set_default("delivery.request_timeout_seconds", 30)?
            .set_default("delivery.max_response_bytes", 1024 * 1024)?
            .set_default("delivery.visibility_timeout_seconds", 300)?
            .set_default("delivery.max_delivery_count", 5)?
            .set_default("delivery.max_concurrent", 10)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (SIGNALPOST_*)
            .add_source(
                Environment::with_prefix("SIGNALPOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if url::Url::parse(&self.actor.url).is_err() {
            return Err(crate::error::AppError::Config(format!(
                "actor.url must be an absolute URL: {}",
                self.actor.url
            )));
        }

        if self.signing.private_key_pem.is_none() && self.signing.private_key_path.is_none() {
            return Err(crate::error::AppError::Config(
                "one of signing.private_key_pem or signing.private_key_path is required"
                    .to_string(),
            ));
        }

        if self.delivery.batch_size == 0 {
            return Err(crate::error::AppError::Config(
                "delivery.batch_size must be greater than 0".to_string(),
            ));
        }

        if self.delivery.max_delivery_count <= 0 {
            return Err(crate::error::AppError::Config(
                "delivery.max_delivery_count must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// User-Agent header for outbound federation requests.
    pub fn user_agent(&self) -> String {
        format!("Signalpost/0.1.0 (+{})", self.server.base_url())
    }
}
