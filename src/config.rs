//! Configuration management for the tritonstream client.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/tritonstream/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `TRITONSTREAM_`)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! # Environment Variables
//!
//! - `TRITONSTREAM_URL` - Server address (`host:port` or full URI)
//! - `TRITONSTREAM_TOKEN` - Bearer token sent with every RPC
//! - `TRITONSTREAM_WORKERS` - Size of the asynchronous inference pool
//! - `TRITONSTREAM_REQUEST_TIMEOUT_MS` - Per-request deadline
//! - `TRITONSTREAM_MAX_MESSAGE_BYTES` - Largest gRPC message sent or received

use crate::error::{Error, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Server address, e.g. localhost:8001
    #[arg(long, global = true, env = "TRITONSTREAM_URL")]
    pub url: Option<String>,

    /// Bearer token for authenticated endpoints
    #[arg(long, global = true, env = "TRITONSTREAM_TOKEN")]
    pub token: Option<String>,

    /// Number of asynchronous inference workers
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Per-request deadline in milliseconds
    #[arg(long, global = true)]
    pub request_timeout_ms: Option<u64>,

    /// PEM CA certificate; enables TLS
    #[arg(long, global = true)]
    pub tls_ca: Option<PathBuf>,

    /// Largest gRPC message sent or received, in bytes
    #[arg(long, global = true)]
    pub max_message_bytes: Option<usize>,
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address
    #[serde(default = "default_url")]
    pub url: String,
    /// Optional bearer token
    #[serde(default)]
    pub token: Option<String>,
    /// Asynchronous inference workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Threads driving network I/O
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    /// Channel connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-request deadline in milliseconds (None for no deadline)
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// PEM CA certificate path; when set the channel uses TLS
    #[serde(default)]
    pub tls_ca: Option<PathBuf>,
    /// Largest gRPC message sent or received (None for no limit)
    #[serde(default)]
    pub max_message_bytes: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: None,
            workers: default_workers(),
            io_threads: default_io_threads(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            tls_ca: None,
            max_message_bytes: None,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = Some(limit);
        self
    }

    pub fn with_tls_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_ca = Some(path.into());
        self
    }

    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from_str(include_str!("../config/default.toml"), FileFormat::Toml))
            .add_source(File::with_name("/etc/tritonstream/config.toml").required(false));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(Environment::with_prefix("TRITONSTREAM").try_parsing(true));

        let mut config: ClientConfig = builder.build()?.try_deserialize()?;
        config.apply_overrides(args);
        config.validate()?;
        Ok(config)
    }

    /// Override with command line args
    fn apply_overrides(&mut self, args: &Args) {
        if let Some(url) = &args.url {
            self.url = url.clone();
        }
        if let Some(token) = &args.token {
            self.token = Some(token.clone());
        }
        if let Some(workers) = args.workers {
            self.workers = workers;
        }
        if let Some(timeout) = args.request_timeout_ms {
            self.request_timeout_ms = Some(timeout);
        }
        if let Some(ca) = &args.tls_ca {
            self.tls_ca = Some(ca.clone());
        }
        if let Some(limit) = args.max_message_bytes {
            self.max_message_bytes = Some(limit);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::Config("url must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.io_threads == 0 {
            return Err(Error::Config("io_threads must be at least 1".into()));
        }
        if self.max_message_bytes == Some(0) {
            return Err(Error::Config("max_message_bytes must be at least 1".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Message size limit applied to both directions of the channel.
    pub fn max_message_size(&self) -> usize {
        self.max_message_bytes.unwrap_or(usize::MAX)
    }
}

fn default_url() -> String {
    "localhost:8001".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_io_threads() -> usize {
    2
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::load(&Args::default()).unwrap();
        assert_eq!(config.url, "localhost:8001");
        assert_eq!(config.workers, 4);
        assert_eq!(config.io_threads, 2);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.max_message_size(), usize::MAX);
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_user_file_and_args_layering() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "url = \"triton.internal:9001\"").unwrap();
        writeln!(file, "workers = 8").unwrap();
        writeln!(file, "request_timeout_ms = 250").unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            workers: Some(2),
            ..Default::default()
        };
        let config = ClientConfig::load(&args).unwrap();
        assert_eq!(config.url, "triton.internal:9001");
        assert_eq!(config.workers, 2);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let args = Args {
            workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(ClientConfig::load(&args), Err(Error::Config(_))));

        let args = Args {
            config: Some(PathBuf::from("/nonexistent/tritonstream.toml")),
            ..Default::default()
        };
        assert!(matches!(ClientConfig::load(&args), Err(Error::Config(_))));
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("10.0.0.5:8001")
            .with_token("secret")
            .with_workers(16)
            .with_request_timeout(Duration::from_secs(2));
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.workers, 16);
        assert_eq!(config.request_timeout_ms, Some(2000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_timeout_saturates() {
        let config = ClientConfig::default().with_request_timeout(Duration::MAX);
        assert_eq!(config.request_timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn test_message_size_limit() {
        let config = ClientConfig::default().with_max_message_bytes(64 << 20);
        assert_eq!(config.max_message_size(), 64 << 20);

        let args = Args {
            max_message_bytes: Some(0),
            ..Default::default()
        };
        assert!(matches!(ClientConfig::load(&args), Err(Error::Config(_))));
    }
}
