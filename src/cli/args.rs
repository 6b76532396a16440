//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `run`: Start the service and keep the session alive
//! - `backup`: Take one credential snapshot and enforce retention
//! - `list-backups`: List stored credential snapshots
//! - `restore`: Restore credentials from a snapshot
//! - `wipe`: Delete all stored credentials
//! - `show-config`: Show configuration discovery information

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Run(RunConfig),
    Backup(StoreConfig),
    ListBackups(StoreConfig),
    Restore {
        store: StoreConfig,
        snapshot_id: String,
    },
    Wipe(StoreConfig),
    ShowConfig,
}

impl ExecutionMode {
    pub fn verbose(&self) -> bool {
        match self {
            ExecutionMode::Run(config) => config.verbose,
            ExecutionMode::Backup(store)
            | ExecutionMode::ListBackups(store)
            | ExecutionMode::Restore { store, .. }
            | ExecutionMode::Wipe(store) => store.verbose,
            ExecutionMode::ShowConfig => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct RunConfig {
    pub config_override: Option<PathBuf>,
    pub credentials_dir: Option<PathBuf>,
    pub prefix: Option<String>,
    pub verbose: bool,
}

/// Settings for the one-shot credential store commands
#[derive(Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub config_override: Option<PathBuf>,
    pub credentials_dir: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(name = "chatlink")]
#[command(author = "Chatlink Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Keeps a chat session connected, backs up its credentials and answers prefixed commands"
)]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the service and keep the session connected
    Run {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Credential directory override
        #[arg(short = 'd', long = "credentials-dir")]
        credentials_dir: Option<PathBuf>,
        /// Command prefix override
        #[arg(short = 'p', long = "prefix")]
        prefix: Option<String>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Take a credential snapshot now and enforce retention
    Backup {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Credential directory override
        #[arg(short = 'd', long = "credentials-dir")]
        credentials_dir: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// List stored credential snapshots, oldest first
    ListBackups {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Credential directory override
        #[arg(short = 'd', long = "credentials-dir")]
        credentials_dir: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Replace the primary credentials with a snapshot
    Restore {
        /// Snapshot ID to restore
        snapshot_id: String,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Credential directory override
        #[arg(short = 'd', long = "credentials-dir")]
        credentials_dir: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Delete the primary credentials and every snapshot
    Wipe {
        /// Confirm the deletion
        #[arg(long = "yes")]
        yes: bool,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Credential directory override
        #[arg(short = 'd', long = "credentials-dir")]
        credentials_dir: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn mode(self) -> Result<ExecutionMode, String> {
        match self.command {
            Some(Commands::Run {
                config,
                credentials_dir,
                prefix,
                verbose,
            }) => {
                if let Some(prefix) = &prefix
                    && (prefix.is_empty() || prefix.chars().any(char::is_whitespace))
                {
                    return Err(format!(
                        "Invalid prefix {:?}: it must be non-empty and contain no whitespace",
                        prefix
                    ));
                }
                Ok(ExecutionMode::Run(RunConfig {
                    config_override: config,
                    credentials_dir,
                    prefix,
                    verbose,
                }))
            }
            Some(Commands::Backup {
                config,
                credentials_dir,
                verbose,
            }) => Ok(ExecutionMode::Backup(StoreConfig {
                config_override: config,
                credentials_dir,
                verbose,
            })),
            Some(Commands::ListBackups {
                config,
                credentials_dir,
                verbose,
            }) => Ok(ExecutionMode::ListBackups(StoreConfig {
                config_override: config,
                credentials_dir,
                verbose,
            })),
            Some(Commands::Restore {
                snapshot_id,
                config,
                credentials_dir,
                verbose,
            }) => Ok(ExecutionMode::Restore {
                store: StoreConfig {
                    config_override: config,
                    credentials_dir,
                    verbose,
                },
                snapshot_id,
            }),
            Some(Commands::Wipe {
                yes,
                config,
                credentials_dir,
                verbose,
            }) => {
                if !yes {
                    return Err(
                        "Refusing to wipe credentials without --yes; the next run will need a new pairing"
                            .to_string(),
                    );
                }
                Ok(ExecutionMode::Wipe(StoreConfig {
                    config_override: config,
                    credentials_dir,
                    verbose,
                }))
            }
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err("No command specified".to_string()),
        }
    }
}
