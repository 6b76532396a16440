//! Reference command handlers.

use crate::dispatch::registry::{CommandHandler, CommandInvocation, CommandRegistry};
use crate::transport::OutgoingPayload;
use anyhow::Result;
use async_trait::async_trait;

pub const PING_REPLY: &str = "pong";

pub struct PingCommand;

#[async_trait]
impl CommandHandler for PingCommand {
    async fn handle(&self, _invocation: CommandInvocation<'_>) -> Result<Option<OutgoingPayload>> {
        Ok(Some(OutgoingPayload::text(PING_REPLY)))
    }

    fn description(&self) -> &str {
        "check that the bot is alive"
    }
}

/// Lists every registered command in registration order
pub struct HelpCommand;

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn handle(&self, invocation: CommandInvocation<'_>) -> Result<Option<OutgoingPayload>> {
        let mut lines = vec!["Available commands:".to_string()];
        for (name, handler) in invocation.registry.entries() {
            let description = handler.description();
            if description.is_empty() {
                lines.push(format!("{}{}", invocation.prefix, name));
            } else {
                lines.push(format!("{}{} - {}", invocation.prefix, name, description));
            }
        }
        Ok(Some(OutgoingPayload::text(lines.join("\n"))))
    }

    fn description(&self) -> &str {
        "list available commands"
    }
}

pub struct InfoCommand;

#[async_trait]
impl CommandHandler for InfoCommand {
    async fn handle(&self, invocation: CommandInvocation<'_>) -> Result<Option<OutgoingPayload>> {
        Ok(Some(OutgoingPayload::text(format!(
            "{} v{} is running with {} commands",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            invocation.registry.len()
        ))))
    }

    fn description(&self) -> &str {
        "show bot information"
    }
}

/// Registry preloaded with `ping`, `help` and `info`
pub fn builtin_registry() -> CommandRegistry {
    CommandRegistry::new()
        .with("ping", PingCommand)
        .with("help", HelpCommand)
        .with("info", InfoCommand)
}
