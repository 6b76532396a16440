//! # Chatlink
//!
//! Keeps one long-lived chat session connected, persists and backs up its
//! credential material, and answers prefixed text commands.
//!
//! ## Architecture Overview
//!
//! The system consists of several key components organized into modules:
//!
//! - **[`session`]**: Reconnection state machine with backoff, status reporting and reset
//! - **[`credentials`]**: Durable credential material with rotating snapshots
//! - **[`dispatch`]**: Command registry and prefix-based message dispatch
//! - **[`transport`]**: The seam to the chat network plus an in-memory implementation
//! - **[`integration`]**: Service orchestration and unified configuration
//!
//! ## Features
//!
//! ### 🔌 Session Lifecycle
//! - **Disconnect Classification**: Every close reason maps to its own recovery path
//! - **Exponential Backoff**: Jittered, capped retry delays with a bounded budget
//! - **Stale Event Guard**: Events and timers from superseded sessions are ignored
//! - **Manual Reset**: Tear down and start a fresh handshake on demand
//!
//! ### 💾 Credential Safety
//! - **Atomic Writes**: Credential updates replace the primary artifact atomically
//! - **Snapshot Rotation**: Periodic snapshots with count-based retention
//! - **Recovery**: Malformed material falls back to the newest readable snapshot
//!
//! ### 💬 Command Dispatch
//! - **Prefix Commands**: `!ping`, `!help` and `!info` out of the box
//! - **Pluggable Handlers**: Register new commands through a trait object
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatlink::{ChatService, ServiceConfig};
//! use chatlink::dispatch::builtin_registry;
//! use chatlink::transport::MemoryTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = ChatService::start(
//!         ServiceConfig::default(),
//!         Arc::new(MemoryTransport::new()),
//!         builtin_registry(),
//!     )
//!     .await?;
//!
//!     if service.wait_ready().await {
//!         println!("Session is {}", service.status().phase);
//!     }
//!
//!     service.shutdown().await
//! }
//! ```

/// Session lifecycle management.
///
/// The session manager owns the connection state machine: it classifies
/// disconnects, schedules reconnects with backoff and exposes status.
pub mod session;

/// Credential persistence and snapshot rotation.
pub mod credentials;

/// Command registry and dispatcher.
///
/// Parses prefixed text from live message batches and routes it to handlers.
pub mod dispatch;

/// Transport abstraction.
///
/// Defines the events a chat session produces and the handle used to send
/// replies, plus a scriptable in-memory transport.
pub mod transport;

/// High-level service integration and orchestration.
///
/// Combines all subsystems into one running service with a unified
/// configuration loaded from TOML and the environment.
pub mod integration;

/// Environment constants and path utilities.
///
/// Centralizes all hardcoded paths, file names and variable names used
/// throughout the application for easier maintenance and consistency.
pub mod env;

// Re-export main session types
pub use session::{
    BackoffPolicy, LifecycleNotice, RetryConfig, SessionController, SessionError, SessionManager,
    SessionManagerConfig, SessionPhase, SessionStatus, StatusReporter,
};

// Re-export credential types
pub use credentials::{BackupConfig, BackupScheduler, CredentialStore, Credentials, StoreError};

// Re-export dispatch types
pub use dispatch::{CommandHandler, CommandRegistry, Dispatcher, builtin_registry};

// Re-export integration types
pub use integration::{ChatService, ConfigError, ServiceConfig};

// CLI module for command-line interface
pub mod cli;
