//! The `workspace/executeCommand` part.
//!
//! Commands are registered under a per-process prefix (`<uuid>.<name>`) so
//! that two server instances attached to the same editor never collide.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::parts::{parse_params, FeatureProvider, RequestContext};
use crate::types::ExecuteCommandParams;

/// The request method served by this part.
pub const EXECUTE_COMMAND: &str = "workspace/executeCommand";

/// A command implementation: receives the raw argument list.
pub type CommandFn =
    Arc<dyn Fn(Vec<Value>, RequestContext) -> BoxFuture<'static, Result<Value, ProviderError>> + Send + Sync>;

/// Registry of executable commands.
pub struct CommandPart {
    prefix: String,
    commands: BTreeMap<String, CommandFn>,
}

impl CommandPart {
    /// Creates an empty command part with a fresh random prefix.
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefix(Uuid::new_v4().to_string())
    }

    /// Creates an empty command part with a fixed prefix.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            commands: BTreeMap::new(),
        }
    }

    /// The prefix in front of every command name.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the full name `name` is registered under.
    #[must_use]
    pub fn command_name(&self, name: &str) -> String {
        format!("{}.{name}", self.prefix)
    }

    /// Registers a command and returns its full name.
    ///
    /// Registering the same name twice keeps the first implementation.
    pub fn register<F>(&mut self, name: &str, command: F) -> String
    where
        F: Fn(Vec<Value>, RequestContext) -> BoxFuture<'static, Result<Value, ProviderError>>
            + Send
            + Sync
            + 'static,
    {
        let full = self.command_name(name);
        if self.commands.contains_key(&full) {
            tracing::error!(command = %full, "Command already registered");
        } else {
            self.commands.insert(full.clone(), Arc::new(command));
        }
        full
    }

    /// Full names of all registered commands, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }
}

impl Default for CommandPart {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeatureProvider for CommandPart {
    fn name(&self) -> &str {
        "commands"
    }

    fn methods(&self) -> Vec<String> {
        vec![EXECUTE_COMMAND.to_string()]
    }

    fn capabilities(&self) -> Value {
        json!({ "executeCommandProvider": { "commands": self.names() } })
    }

    async fn handle(
        &self,
        _method: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> Result<Value, ProviderError> {
        let params: ExecuteCommandParams = parse_params(params)?;
        tracing::debug!(command = %params.command, "Execute command");

        let Some(command) = self.commands.get(&params.command) else {
            return Err(ProviderError::invalid_params(format!(
                "Command '{}' unknown.",
                params.command
            )));
        };
        command(params.arguments, ctx).await
    }
}
