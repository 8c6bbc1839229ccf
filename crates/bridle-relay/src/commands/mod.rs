//! Ops command registry and async dispatch.

pub mod forward;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridle_core::{ClientId, LeaseId, OpsSessionId, RequestId};
use bridle_ops::OpsErrorBody;
use bridle_registry::registry::SessionRegistry;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::warn;

use crate::broadcast::ConnectionRegistry;
use crate::error::RelayError;
use crate::metrics::{OPS_COMMANDS_TOTAL, OPS_COMMAND_DURATION_SECONDS, OPS_COMMAND_ERRORS_TOTAL};
use crate::runtime::SessionDrivers;

/// One decoded `ops_request`, as seen by a handler.
pub struct CommandRequest {
    /// Echoed correlation id.
    pub request_id: RequestId,
    /// Command name.
    pub command: String,
    /// Command parameters.
    pub params: Option<Value>,
    /// Session scope from the frame.
    pub ops_session_id: Option<OpsSessionId>,
    /// Lease from the frame, forwarded opaque.
    pub lease_id: Option<LeaseId>,
}

/// Shared state handlers run against. Built per connection; the Arcs are
/// process-wide.
#[derive(Clone)]
pub struct CommandContext {
    /// Session registry (admission, lookup, lease gate).
    pub registry: Arc<SessionRegistry>,
    /// Per-session runtimes.
    pub drivers: Arc<SessionDrivers>,
    /// Connected clients, for pushes.
    pub connections: Arc<ConnectionRegistry>,
    /// The client this request arrived on.
    pub client_id: ClientId,
}

/// Trait implemented by every ops command handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute the handler.
    async fn handle(&self, req: CommandRequest, ctx: &CommandContext)
    -> Result<Value, RelayError>;
}

/// Registry mapping command names to handlers.
pub struct OpsCommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl OpsCommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The full relay command surface.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register("session.open", session::OpenHandler);
        reg.register("session.close", session::CloseHandler);
        reg.register("session.status", session::StatusHandler);
        reg.register("session.console", session::ConsoleHandler);
        reg.register("session.network", session::NetworkHandler);
        reg.register("forwardCDPCommand", forward::ForwardHandler);
        reg
    }

    /// Register a handler for a command name.
    pub fn register(&mut self, command: &str, handler: impl CommandHandler + 'static) {
        let _ = self.handlers.insert(command.to_owned(), Arc::new(handler));
    }

    /// Maximum time a single handler may run.
    const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

    /// Dispatch a request to the appropriate handler.
    ///
    /// Errors come back as the wire body so the session loop can build a
    /// correlated `ops_error` without knowing the taxonomy.
    pub async fn dispatch(
        &self,
        request: CommandRequest,
        ctx: &CommandContext,
    ) -> Result<Value, OpsErrorBody> {
        let command = request.command.clone();
        counter!(OPS_COMMANDS_TOTAL, "command" => command.clone()).increment(1);

        let Some(handler) = self.handlers.get(&command) else {
            counter!(OPS_COMMAND_ERRORS_TOTAL, "command" => command.clone(), "code" => "command_not_found")
                .increment(1);
            return Err(RelayError::CommandNotFound { command }.to_error_body());
        };

        let start = std::time::Instant::now();
        let result = tokio::time::timeout(Self::HANDLER_TIMEOUT, handler.handle(request, ctx)).await;

        let outcome = match result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(err)) => {
                counter!(OPS_COMMAND_ERRORS_TOTAL, "command" => command.clone(), "code" => err.code().to_owned())
                    .increment(1);
                Err(err.to_error_body())
            }
            Err(_elapsed) => {
                counter!(OPS_COMMAND_ERRORS_TOTAL, "command" => command.clone(), "code" => "request_timeout")
                    .increment(1);
                tracing::error!(
                    command,
                    "handler timed out after {:?}",
                    Self::HANDLER_TIMEOUT
                );
                Err(RelayError::Internal {
                    message: format!("handler for '{command}' timed out"),
                }
                .to_error_body())
            }
        };

        let duration = start.elapsed();
        histogram!(OPS_COMMAND_DURATION_SECONDS, "command" => command.clone())
            .record(duration.as_secs_f64());
        if duration.as_secs() >= 5 {
            warn!(command, duration_secs = duration.as_secs_f64(), "slow ops command");
        }

        outcome
    }

    /// All registered command names (sorted).
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a command is registered.
    pub fn has_command(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }
}

impl Default for OpsCommandRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Parse command params with a uniform error.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    command: &str,
    params: Option<Value>,
) -> Result<T, RelayError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| RelayError::InvalidParams {
        message: format!("invalid params for {command}: {e}"),
    })
}
