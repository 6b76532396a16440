use crate::dispatch::registry::{CommandInvocation, CommandRegistry};
use crate::transport::{BatchKind, MessageBatch, OutgoingPayload, SessionHandle, send_payload};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_COMMAND_PREFIX: &str = "!";

/// A message batch together with the session it arrived on
pub struct DispatchJob {
    pub batch: MessageBatch,
    pub handle: Arc<dyn SessionHandle>,
}

/// What happened to one piece of inbound text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Text without the command prefix
    NotACommand,
    /// Handler ran; `sent` is the number of messages delivered back
    Handled { command: String, sent: usize },
    /// No handler under that name; a notice was sent
    UnknownCommand { command: String },
    /// Handler returned an error or panicked; nothing was sent
    HandlerFailed { command: String },
}

/// Routes prefixed command text to registered handlers
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    prefix: String,
}

impl Dispatcher {
    pub fn new(registry: Arc<CommandRegistry>, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
        }
    }

    /// Dispatch every command found in a live batch.
    ///
    /// History-sync batches are dropped whole so replayed messages never
    /// re-run commands.
    pub async fn on_message_batch(
        &self,
        batch: &MessageBatch,
        handle: &dyn SessionHandle,
    ) -> Vec<DispatchOutcome> {
        if batch.kind != BatchKind::Notify {
            debug!(
                "Skipping {:?} batch of {} messages",
                batch.kind,
                batch.messages.len()
            );
            return Vec::new();
        }

        let mut outcomes = Vec::new();
        for message in &batch.messages {
            let Some(content) = &message.content else {
                continue;
            };
            if message.is_broadcast() {
                continue;
            }
            let Some(text) = content.extract_text() else {
                continue;
            };

            outcomes.push(self.dispatch(text, &message.chat_id, handle).await);
        }
        outcomes
    }

    /// Run the command in `text`, if any, on behalf of `sender_id`
    pub async fn dispatch(
        &self,
        text: &str,
        sender_id: &str,
        handle: &dyn SessionHandle,
    ) -> DispatchOutcome {
        let Some(body) = text.strip_prefix(self.prefix.as_str()) else {
            return DispatchOutcome::NotACommand;
        };

        let mut tokens = body.split_whitespace();
        let Some(command) = tokens.next() else {
            return DispatchOutcome::NotACommand;
        };
        let args: Vec<&str> = tokens.collect();

        let Some(handler) = self.registry.get(command) else {
            info!(sender = sender_id, command, "Unknown command");
            let notice = format!(
                "Unknown command: {prefix}{command}. Type {prefix}help to see available commands.",
                prefix = self.prefix,
            );
            self.reply(handle, sender_id, OutgoingPayload::text(notice)).await;
            return DispatchOutcome::UnknownCommand {
                command: command.to_string(),
            };
        };

        let invocation = CommandInvocation {
            sender_id,
            command,
            args: &args,
            prefix: &self.prefix,
            registry: &self.registry,
        };

        // A panicking handler must not take the dispatcher task down with it
        let result = match AssertUnwindSafe(handler.handle(invocation))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    sender = sender_id,
                    command,
                    "Command handler panicked: {}",
                    panic_message(panic.as_ref())
                );
                return DispatchOutcome::HandlerFailed {
                    command: command.to_string(),
                };
            }
        };

        match result {
            Ok(Some(payload)) => {
                let sent = self.reply(handle, sender_id, payload).await;
                debug!(sender = sender_id, command, sent, "Command handled");
                DispatchOutcome::Handled {
                    command: command.to_string(),
                    sent,
                }
            }
            Ok(None) => DispatchOutcome::Handled {
                command: command.to_string(),
                sent: 0,
            },
            Err(e) => {
                error!(sender = sender_id, command, "Command handler failed: {:#}", e);
                DispatchOutcome::HandlerFailed {
                    command: command.to_string(),
                }
            }
        }
    }

    /// Consume jobs until every sender is gone
    pub fn spawn(self, mut jobs: mpsc::Receiver<DispatchJob>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                self.on_message_batch(&job.batch, job.handle.as_ref()).await;
            }
            debug!("Dispatcher stopped");
        })
    }

    async fn reply(&self, handle: &dyn SessionHandle, target: &str, payload: OutgoingPayload) -> usize {
        match send_payload(handle, target, payload).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(recipient = target, "Failed to send reply: {}", e);
                0
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
