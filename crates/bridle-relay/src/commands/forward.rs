//! `forwardCDPCommand` — the CDP forwarding path.
//!
//! Order matters: lease gate, then ref validation, then the per-target FIFO
//! gate, then the router. A bad ref never reaches the debugger.

use async_trait::async_trait;
use bridle_core::CdpSessionId;
use bridle_registry::refs::RefStore;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{CommandContext, CommandHandler, CommandRequest, parse_params};
use crate::error::RelayError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardParams {
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    session_id: Option<CdpSessionId>,
}

/// Handler for `forwardCDPCommand`.
pub struct ForwardHandler;

#[async_trait]
impl CommandHandler for ForwardHandler {
    #[instrument(skip_all, fields(client_id = %ctx.client_id))]
    async fn handle(
        &self,
        req: CommandRequest,
        ctx: &CommandContext,
    ) -> Result<Value, RelayError> {
        let ops_session_id =
            req.ops_session_id
                .clone()
                .ok_or_else(|| RelayError::InvalidParams {
                    message: "'forwardCDPCommand' requires opsSessionId".to_owned(),
                })?;
        let session = ctx.registry.get(&ops_session_id)?;
        ctx.registry.authorize(&session, req.lease_id.as_ref())?;
        session.touch();

        let forward: ForwardParams = parse_params(&req.command, req.params)?;

        // Ref validation against the session's snapshot store.
        if let Some(ref_id) = forward
            .params
            .as_ref()
            .and_then(|p| p.get("ref"))
            .and_then(Value::as_str)
        {
            let resolved = session
                .active_target()
                .and_then(|target| session.refs.resolve(&target, ref_id));
            if resolved.is_none() {
                return Err(RelayError::RefNotFound {
                    ref_id: ref_id.to_owned(),
                });
            }
        }

        let driver =
            ctx.drivers
                .get(&ops_session_id)
                .ok_or_else(|| RelayError::Internal {
                    message: format!("no runtime for session {ops_session_id}"),
                })?;

        // Commands against the same target run strictly in arrival order.
        let gate_target = session.active_target();
        let _guard = match &gate_target {
            Some(target) => Some(session.gates.acquire(target).await),
            None => None,
        };
        debug!(method = %forward.method, ops_session_id = %ops_session_id, "forwarding");

        let result = driver
            .router
            .handle_command(&forward.method, forward.params, forward.session_id.clone())
            .await?;

        let mut payload = json!({ "result": result });
        if let Some(sid) = forward.session_id {
            payload["sessionId"] = json!(sid);
        }
        Ok(payload)
    }
}
