//! Common test utilities for E2E tests

use std::path::PathBuf;

use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use signalpost::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Create temporary directory for test database and outbox
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let outbox_path = temp_dir.path().join("outbox.json");

        // Generate a signing key for the test actor
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .unwrap()
            .to_string();

        // Create test configuration
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: "blog.test.example".to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            actor: config::ActorConfig {
                url: "https://blog.test.example/actor".to_string(),
                key_id: None,
            },
            signing: config::SigningConfig {
                private_key_pem: Some(private_key_pem),
                private_key_path: None,
            },
            verification: config::VerificationConfig {
                date_window_seconds: 300,
            },
            delivery: config::DeliveryConfig {
                batch_size: 32,
                interval_seconds: 60,
                request_timeout_seconds: 5,
                max_response_bytes: 1024 * 1024,
                visibility_timeout_seconds: 300,
                max_delivery_count: 5,
                max_concurrent: 4,
            },
            fanout: config::FanoutConfig {
                outbox_path: outbox_path.clone(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        // Build router
        let app = signalpost::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Path of the outbox document the fan-out planner reads
    pub fn outbox_path(&self) -> PathBuf {
        self.state.config.fanout.outbox_path.clone()
    }
}
