//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./chatlink.toml or ./.chatlink/config.toml
//! 2. User config: ~/.chatlink/config.toml
//! 3. System config: /etc/chatlink/config.toml
//! 4. Built-in defaults
//!
//! Environment variables are applied on top of whichever source wins.

use crate::env;
use crate::integration::{ConfigError, ServiceConfig};
use std::env as std_env;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where the active configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Discovered(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Explicit(path) => write!(f, "{} (explicit)", path.display()),
            ConfigSource::Discovered(path) => write!(f, "{}", path.display()),
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ServiceConfig,
    pub source: ConfigSource,
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load configuration from `explicit`, or through the discovery hierarchy,
    /// then apply environment overrides and validate the result.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        Self::load_with(explicit, |name| std_env::var(name).ok())
    }

    pub fn load_with<F>(explicit: Option<&Path>, lookup: F) -> Result<LoadedConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (mut config, source) = match explicit {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                (
                    ServiceConfig::from_toml_file(path)?,
                    ConfigSource::Explicit(path.to_path_buf()),
                )
            }
            None => match Self::find_config_file() {
                Some(path) => {
                    info!("Loading configuration from: {:?}", path);
                    (
                        ServiceConfig::from_toml_file(&path)?,
                        ConfigSource::Discovered(path),
                    )
                }
                None => {
                    info!("No configuration file found, using defaults");
                    (ServiceConfig::default(), ConfigSource::Defaults)
                }
            },
        };

        config.apply_env_overrides(lookup)?;
        config.validate()?;
        Ok(LoadedConfig { config, source })
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = Self::get_config_candidates();

        for candidate in candidates {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from("/etc/chatlink").join(env::CONFIG_FILE_NAME));

        #[cfg(windows)]
        if let Ok(program_data) = std_env::var("PROGRAMDATA") {
            candidates.push(
                PathBuf::from(program_data)
                    .join("chatlink")
                    .join(env::CONFIG_FILE_NAME),
            );
        }

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        let candidates = Self::get_config_candidates();
        for (i, candidate) in candidates.iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::load(None) {
            Ok(loaded) => {
                println!("Active configuration: {}", loaded.source);
                println!();
                match loaded.config.to_toml_string() {
                    Ok(rendered) => println!("{}", rendered),
                    Err(e) => println!("Failed to render configuration: {}", e),
                }
            }
            Err(e) => println!("Active configuration is invalid: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_explicit_file_wins() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bot.toml");
        fs::write(&config_path, "command_prefix = \"/\"\n[retry]\nmax_retries = 1\n").unwrap();

        let loaded = ConfigDiscovery::load_with(Some(config_path.as_path()), no_env).unwrap();

        assert_eq!(loaded.source, ConfigSource::Explicit(config_path));
        assert_eq!(loaded.config.command_prefix, "/");
        assert_eq!(loaded.config.retry.max_retries, 1);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("absent.toml");

        let err = ConfigDiscovery::load_with(Some(missing.as_path()), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_invalid_result_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bot.toml");
        fs::write(&config_path, "[retry]\nbase_delay_ms = 5000\nmax_delay_ms = 100\n").unwrap();

        let err = ConfigDiscovery::load_with(Some(config_path.as_path()), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_config_candidates() {
        let candidates = ConfigDiscovery::get_config_candidates();

        assert!(!candidates.is_empty());
        assert_eq!(
            candidates[0].file_name().unwrap(),
            env::LOCAL_CONFIG_FILE_NAME
        );
    }

    #[test]
    #[serial]
    fn test_process_environment_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bot.toml");
        fs::write(&config_path, "[backup]\nretention = 2\n").unwrap();

        // SAFETY: serialized with every other test touching the environment
        unsafe {
            std_env::set_var(env::vars::BACKUP_RETENTION, "7");
        }
        let loaded = ConfigDiscovery::load(Some(config_path.as_path()));
        unsafe {
            std_env::remove_var(env::vars::BACKUP_RETENTION);
        }

        assert_eq!(loaded.unwrap().config.backup.retention, 7);
    }
}
