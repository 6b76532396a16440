use crate::transport::OutgoingPayload;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Context handed to a command handler for one invocation
#[derive(Clone, Copy)]
pub struct CommandInvocation<'a> {
    /// Chat the command came from; replies go back here
    pub sender_id: &'a str,
    /// Command name as typed, without the prefix
    pub command: &'a str,
    pub args: &'a [&'a str],
    pub prefix: &'a str,
    pub registry: &'a CommandRegistry,
}

/// A named command reachable through the dispatcher
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command; `Some` payloads are sent back to the sender
    async fn handle(&self, invocation: CommandInvocation<'_>) -> Result<Option<OutgoingPayload>>;

    /// One-line description shown by `help`
    fn description(&self) -> &str {
        ""
    }
}

/// Command handlers keyed by lowercase name, in registration order
#[derive(Default, Clone)]
pub struct CommandRegistry {
    entries: Vec<(String, Arc<dyn CommandHandler>)>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// Re-registering a name replaces its handler but keeps its original position.
    pub fn register(&mut self, name: &str, handler: Arc<dyn CommandHandler>) {
        let key = name.trim().to_lowercase();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = handler,
            None => self.entries.push((key, handler)),
        }
    }

    pub fn with(mut self, name: &str, handler: impl CommandHandler + 'static) -> Self {
        self.register(name, Arc::new(handler));
        self
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        let key = name.to_lowercase();
        self.entries
            .iter()
            .find(|(existing, _)| *existing == key)
            .map(|(_, handler)| handler.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &dyn CommandHandler)> {
        self.entries
            .iter()
            .map(|(name, handler)| (name.as_str(), handler.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
