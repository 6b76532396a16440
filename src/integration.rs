//! # Service Orchestration
//!
//! Wires the credential store, session manager and command dispatcher into
//! one running service.
//!
//! ## Core Components
//!
//! - **[`ChatService`]**: starts the subsystems and owns their tasks
//! - **[`ServiceConfig`]**: unified configuration, loaded from TOML and
//!   overridden from the environment
//!
//! ## Service Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     ChatService                      │
//! │  ┌────────────┐   events  ┌─────────────┐   jobs     │
//! │  │ Transport  │ ────────▶ │   Session   │ ────────┐  │
//! │  └────────────┘           │   Manager   │         ▼  │
//! │        ▲                  └─────────────┘  ┌────────────┐
//! │        │ send                   │          │ Dispatcher │
//! │        └────────────────────────┼───────── └────────────┘
//! │                          ┌─────────────┐                │
//! │                          │ Credential  │                │
//! │                          │   Store     │                │
//! │                          └─────────────┘                │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use chatlink::{ChatService, ServiceConfig};
//! use chatlink::dispatch::builtin_registry;
//! use chatlink::transport::MemoryTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig::default();
//!     let transport = Arc::new(MemoryTransport::new());
//!     let service = ChatService::start(config, transport, builtin_registry()).await?;
//!
//!     service.wait_ready().await;
//!     println!("Session phase: {}", service.status().phase);
//!
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```

use crate::credentials::{BackupConfig, CredentialStore};
use crate::dispatch::{CommandRegistry, DEFAULT_COMMAND_PREFIX, Dispatcher};
use crate::env;
use crate::session::{
    RetryConfig, SessionConfig, SessionController, SessionError, SessionManager,
    SessionManagerConfig, SessionStatus,
};
use crate::transport::{Transport, TransportConfig};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listen port for the status surface
    pub port: u16,
    pub credentials_dir: PathBuf,
    pub command_prefix: String,
    pub retry: RetryConfig,
    pub backup: BackupConfig,
    pub session: SessionConfig,
    pub transport: TransportConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            credentials_dir: PathBuf::from(env::credentials::DEFAULT_DIR_NAME),
            command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
            retry: RetryConfig::default(),
            backup: BackupConfig::default(),
            session: SessionConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Convert configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        use env::vars;

        if let Some(value) = lookup(vars::PORT) {
            self.port = parse_var(vars::PORT, &value)?;
        }
        if let Some(value) = lookup(vars::RETRY_MAX) {
            self.retry.max_retries = parse_var(vars::RETRY_MAX, &value)?;
        }
        if let Some(value) = lookup(vars::RETRY_BASE_DELAY_MS) {
            self.retry.base_delay_ms = parse_var(vars::RETRY_BASE_DELAY_MS, &value)?;
        }
        if let Some(value) = lookup(vars::RETRY_MAX_DELAY_MS) {
            self.retry.max_delay_ms = parse_var(vars::RETRY_MAX_DELAY_MS, &value)?;
        }
        if let Some(value) = lookup(vars::BACKUP_INTERVAL_MS) {
            self.backup.interval_ms = parse_var(vars::BACKUP_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(vars::BACKUP_RETENTION) {
            self.backup.retention = parse_var(vars::BACKUP_RETENTION, &value)?;
        }
        if let Some(value) = lookup(vars::COMMAND_PREFIX) {
            self.command_prefix = value;
        }
        if let Some(value) = lookup(vars::CREDENTIALS_DIR) {
            self.credentials_dir = PathBuf::from(value);
        }
        Ok(())
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_ms ({}) is smaller than retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.command_prefix.is_empty() || self.command_prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "command_prefix {:?} must be non-empty and contain no whitespace",
                self.command_prefix
            )));
        }
        if self.backup.retention == 0 {
            return Err(ConfigError::Invalid(
                "backup.retention must keep at least one snapshot".to_string(),
            ));
        }
        if self.backup.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "backup.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            session: self.session.clone(),
            retry: self.retry.clone(),
            transport: self.transport.clone(),
            backup: self.backup.clone(),
        }
    }

    /// Open the credential store this configuration points at
    pub fn open_store(&self) -> Result<CredentialStore> {
        let store = CredentialStore::open(&self.credentials_dir).with_context(|| {
            format!(
                "Failed to open credential store at {}",
                self.credentials_dir.display()
            )
        })?;
        Ok(store.with_compressed_snapshots(self.backup.compress))
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// A running chat service: session manager plus command dispatcher
pub struct ChatService {
    config: ServiceConfig,
    store: Arc<CredentialStore>,
    controller: SessionController,
    manager: Option<JoinHandle<Result<(), SessionError>>>,
    dispatcher: JoinHandle<()>,
}

impl ChatService {
    /// Open the credential store and start the session and dispatcher tasks.
    ///
    /// Fails when the configuration is invalid or the store is unavailable.
    pub async fn start(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        registry: CommandRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(config.open_store()?);

        let (jobs_tx, jobs_rx) = mpsc::channel(config.session.event_buffer.max(1));
        let dispatcher =
            Dispatcher::new(Arc::new(registry), config.command_prefix.clone()).spawn(jobs_rx);

        let manager = SessionManager::new(
            config.manager_config(),
            transport.clone(),
            store.clone(),
            jobs_tx,
        );
        let controller = manager.controller();
        let manager = manager.spawn();

        info!(
            transport = transport.transport_name(),
            credentials_dir = %config.credentials_dir.display(),
            prefix = %config.command_prefix,
            "Chat service started"
        );

        Ok(Self {
            config,
            store,
            controller,
            manager: Some(manager),
            dispatcher,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn status(&self) -> SessionStatus {
        self.controller.status()
    }

    pub async fn reset(&self) -> bool {
        self.controller.reset().await
    }

    pub async fn wait_ready(&self) -> bool {
        self.controller.wait_ready().await
    }

    /// Resolve when the session manager exits.
    ///
    /// An error here is fatal: session setup exhausted its retries or the
    /// credential store became unreadable.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(manager) = self.manager.as_mut() else {
            return Ok(());
        };
        let result = manager.await;
        self.manager = None;
        flatten_manager_result(result)
    }

    /// Cancel timers, tear the session down and join all tasks
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down chat service");

        match self.controller.shutdown().await {
            Ok(()) | Err(SessionError::ManagerStopped) => {}
            Err(e) => warn!("Session manager shutdown failed: {}", e),
        }

        let result = match self.manager.take() {
            Some(manager) => flatten_manager_result(manager.await),
            None => Ok(()),
        };

        // The manager owned the only job sender, so the dispatcher drains and exits
        if let Err(e) = self.dispatcher.await {
            warn!("Dispatcher task failed: {}", e);
        }

        info!("Chat service stopped");
        result
    }
}

fn flatten_manager_result(
    result: Result<Result<(), SessionError>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(anyhow!("session manager task failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 2_000);
        assert_eq!(config.retry.max_delay_ms, 60_000);
        assert_eq!(config.backup.interval_ms, 300_000);
        assert_eq!(config.backup.retention, 5);
        assert_eq!(config.command_prefix, "!");
        assert_eq!(config.credentials_dir, PathBuf::from("auth_info"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut config = ServiceConfig::default();
        config
            .apply_env_overrides(lookup_from(&[
                ("PORT", "8080"),
                ("RETRY_MAX", "7"),
                ("RETRY_BASE_DELAY_MS", "500"),
                ("RETRY_MAX_DELAY_MS", "10000"),
                ("BACKUP_INTERVAL_MS", "60000"),
                ("BACKUP_RETENTION", "9"),
                ("COMMAND_PREFIX", "/"),
                ("CREDENTIALS_DIR", "/var/lib/chatlink"),
            ]))
            .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert_eq!(config.backup.interval_ms, 60_000);
        assert_eq!(config.backup.retention, 9);
        assert_eq!(config.command_prefix, "/");
        assert_eq!(config.credentials_dir, PathBuf::from("/var/lib/chatlink"));
    }

    #[test]
    fn test_unparseable_env_value_names_variable() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_env_overrides(lookup_from(&[("RETRY_MAX", "lots")]))
            .unwrap_err();

        match err {
            ConfigError::InvalidValue { name, value, .. } => {
                assert_eq!(name, "RETRY_MAX");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = ServiceConfig::default();
        config.retry.max_delay_ms = 100;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.command_prefix = String::new();
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.backup.retention = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.backup.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ServiceConfig::from_toml_str(
            r##"
            command_prefix = "#"

            [retry]
            max_retries = 2

            [backup]
            compress = true
            "##,
        )
        .unwrap();

        assert_eq!(config.command_prefix, "#");
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay_ms, 2_000);
        assert!(config.backup.compress);
        assert_eq!(config.backup.retention, 5);
        assert_eq!(config.session.server_close_delay_ms, 2_000);
    }

    #[test]
    fn test_toml_file_round_trip() {
        let temp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let mut config = ServiceConfig::default();
        config.port = 6001;
        config.transport.device_name = "kiosk".to_string();

        config.to_toml_file(temp_file.path()).unwrap();
        let loaded = ServiceConfig::from_toml_file(temp_file.path()).unwrap();

        assert_eq!(loaded.port, 6001);
        assert_eq!(loaded.transport.device_name, "kiosk");
        assert_eq!(loaded.credentials_dir, config.credentials_dir);
    }
}
