//! CLI-specific functionality for chatlink
//!
//! This module contains argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, ExecutionMode, RunConfig, StoreConfig};
pub use config::{ConfigDiscovery, ConfigSource, LoadedConfig};
