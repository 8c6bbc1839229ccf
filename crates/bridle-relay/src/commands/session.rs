//! Session lifecycle and capture-read commands.

use std::sync::Arc;

use async_trait::async_trait;
use bridle_core::{TabId, TargetId};
use bridle_governor::ModeVariant;
use bridle_registry::session::OpsSession;
use metrics::{counter, gauge};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use super::{CommandContext, CommandHandler, CommandRequest, parse_params};
use crate::error::RelayError;
use crate::metrics::{SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL, SESSIONS_OPENED_TOTAL};

/// Look up the scoped session, enforce the lease gate, and mark activity.
fn scoped_session(
    ctx: &CommandContext,
    req: &CommandRequest,
) -> Result<Arc<OpsSession>, RelayError> {
    let id = req
        .ops_session_id
        .clone()
        .ok_or_else(|| RelayError::InvalidParams {
            message: format!("'{}' requires opsSessionId", req.command),
        })?;
    let session = ctx.registry.get(&id)?;
    ctx.registry.authorize(&session, req.lease_id.as_ref())?;
    session.touch();
    Ok(session)
}

// ─────────────────────────────────────────────────────────────────────────────
// session.open
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenParams {
    tab_id: i64,
    #[serde(default)]
    mode: Option<ModeVariant>,
}

/// `session.open` — admission-gated; starts the session's router runtime
/// and registers the primary target.
pub struct OpenHandler;

#[async_trait]
impl CommandHandler for OpenHandler {
    #[instrument(skip_all, fields(client_id = %ctx.client_id))]
    async fn handle(
        &self,
        req: CommandRequest,
        ctx: &CommandContext,
    ) -> Result<Value, RelayError> {
        let params: OpenParams = parse_params(&req.command, req.params)?;
        let mode = params.mode.unwrap_or_default();
        let tab = TabId::new(params.tab_id);

        let session =
            ctx.registry
                .open_session(ctx.client_id.clone(), req.lease_id.clone(), mode, tab)?;
        let primary_target = TargetId::new();
        session.register_target(primary_target.clone(), tab, Some("primary"));
        let _ = ctx.drivers.start(Arc::clone(&session));

        counter!(SESSIONS_OPENED_TOTAL, "mode" => mode.to_string()).increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!(SESSIONS_ACTIVE).set(ctx.registry.session_count() as f64);
        info!(ops_session_id = %session.id, %mode, tab = %tab, "session runtime started");

        Ok(json!({
            "opsSessionId": session.id,
            "mode": mode,
            "primaryTargetId": primary_target,
            "leaseRequired": session.lease_id.is_some(),
            "effectiveCap": ctx.registry.effective_cap(mode),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// session.close
// ─────────────────────────────────────────────────────────────────────────────

/// `session.close` — teardown plus a recently-closed record and an
/// `ops_session_closed` push to the owner.
pub struct CloseHandler;

#[async_trait]
impl CommandHandler for CloseHandler {
    #[instrument(skip_all, fields(client_id = %ctx.client_id))]
    async fn handle(
        &self,
        req: CommandRequest,
        ctx: &CommandContext,
    ) -> Result<Value, RelayError> {
        let session = scoped_session(ctx, &req)?;
        let session = ctx.registry.close_session(&session.id)?;
        let _ = ctx.drivers.stop(&session.id).await;

        counter!(SESSIONS_CLOSED_TOTAL).increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!(SESSIONS_ACTIVE).set(ctx.registry.session_count() as f64);

        ctx.connections.push_event(
            &session.owner_client_id,
            "ops_session_closed",
            Some(json!({ "reason": "closed" })),
            Some(session.id.clone()),
        );
        Ok(json!({ "closed": true }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// session.status
// ─────────────────────────────────────────────────────────────────────────────

/// `session.status` — live state plus the mode's governor view. Recently
/// closed ids answer with the distinct `session_closed` error.
pub struct StatusHandler;

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(
        &self,
        req: CommandRequest,
        ctx: &CommandContext,
    ) -> Result<Value, RelayError> {
        let session = scoped_session(ctx, &req)?;
        let governor = ctx.registry.governor_state(session.mode);
        let mut status = session.status_value();
        status["governor"] = json!({
            "effectiveCap": governor.effective_cap,
            "staticCap": governor.static_cap,
            "pressure": governor.last_pressure,
        });
        Ok(status)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// session.console / session.network
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SinceParams {
    #[serde(default)]
    since_seq: u64,
}

fn since_seq(req: &CommandRequest) -> Result<u64, RelayError> {
    let params: Option<SinceParams> = match &req.params {
        Some(value) => Some(parse_params(&req.command, Some(value.clone()))?),
        None => None,
    };
    Ok(params.unwrap_or_default().since_seq)
}

/// `session.console` — ring-buffer read with a `sinceSeq` cursor.
pub struct ConsoleHandler;

#[async_trait]
impl CommandHandler for ConsoleHandler {
    async fn handle(
        &self,
        req: CommandRequest,
        ctx: &CommandContext,
    ) -> Result<Value, RelayError> {
        let session = scoped_session(ctx, &req)?;
        let cursor = since_seq(&req)?;
        let entries = session.console_since(cursor);
        let (latest, _) = session.capture_cursors();
        Ok(json!({ "entries": entries, "latestSeq": latest }))
    }
}

/// `session.network` — ring-buffer read with a `sinceSeq` cursor.
pub struct NetworkHandler;

#[async_trait]
impl CommandHandler for NetworkHandler {
    async fn handle(
        &self,
        req: CommandRequest,
        ctx: &CommandContext,
    ) -> Result<Value, RelayError> {
        let session = scoped_session(ctx, &req)?;
        let cursor = since_seq(&req)?;
        let entries = session.network_since(cursor);
        let (_, latest) = session.capture_cursors();
        Ok(json!({ "entries": entries, "latestSeq": latest }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::OpsCommandRegistry;
    use crate::commands::tests::{make_ctx, make_request};
    use bridle_core::{LeaseId, OpsSessionId, RequestId};
    use bridle_registry::ring::ConsoleEntry;
    use chrono::Utc;

    fn scoped(command: &str, params: Option<Value>, id: &OpsSessionId) -> CommandRequest {
        CommandRequest {
            request_id: RequestId::from("r1"),
            command: command.to_owned(),
            params,
            ops_session_id: Some(id.clone()),
            lease_id: None,
        }
    }

    async fn open(ctx: &CommandContext, tab: i64) -> OpsSessionId {
        let reg = OpsCommandRegistry::with_defaults();
        let payload = reg
            .dispatch(
                make_request("session.open", Some(json!({"tabId": tab}))),
                ctx,
            )
            .await
            .unwrap();
        OpsSessionId::from(payload["opsSessionId"].as_str().unwrap())
    }

    #[tokio::test]
    async fn open_returns_session_and_cap() {
        let ctx = make_ctx();
        let reg = OpsCommandRegistry::with_defaults();
        let payload = reg
            .dispatch(
                make_request("session.open", Some(json!({"tabId": 7}))),
                &ctx,
            )
            .await
            .unwrap();
        assert!(payload["opsSessionId"].is_string());
        assert_eq!(payload["mode"], "headedRelay");
        assert_eq!(payload["leaseRequired"], false);
        assert_eq!(payload["effectiveCap"], 4);
        assert_eq!(ctx.registry.session_count(), 1);
        assert_eq!(ctx.drivers.len(), 1);
    }

    #[tokio::test]
    async fn open_requires_tab_id() {
        let ctx = make_ctx();
        let reg = OpsCommandRegistry::with_defaults();
        let err = reg
            .dispatch(make_request("session.open", Some(json!({}))), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[tokio::test]
    async fn close_removes_session_and_driver() {
        let ctx = make_ctx();
        let id = open(&ctx, 7).await;
        let reg = OpsCommandRegistry::with_defaults();

        let payload = reg
            .dispatch(scoped("session.close", None, &id), &ctx)
            .await
            .unwrap();
        assert_eq!(payload["closed"], true);
        assert_eq!(ctx.registry.session_count(), 0);
        assert_eq!(ctx.drivers.len(), 0);
    }

    #[tokio::test]
    async fn status_after_close_reports_session_closed() {
        let ctx = make_ctx();
        let id = open(&ctx, 7).await;
        let reg = OpsCommandRegistry::with_defaults();
        let _ = reg
            .dispatch(scoped("session.close", None, &id), &ctx)
            .await
            .unwrap();

        let err = reg
            .dispatch(scoped("session.status", None, &id), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, "session_closed");
    }

    #[tokio::test]
    async fn status_includes_governor_view() {
        let ctx = make_ctx();
        let id = open(&ctx, 7).await;
        let reg = OpsCommandRegistry::with_defaults();
        let status = reg
            .dispatch(scoped("session.status", None, &id), &ctx)
            .await
            .unwrap();
        assert_eq!(status["state"], "active");
        assert_eq!(status["governor"]["effectiveCap"], 4);
        assert_eq!(status["governor"]["staticCap"], 4);
        assert_eq!(status["targets"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_session_reports_not_found() {
        let ctx = make_ctx();
        let reg = OpsCommandRegistry::with_defaults();
        let err = reg
            .dispatch(
                scoped("session.status", None, &OpsSessionId::from("ghost")),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "session_not_found");
    }

    #[tokio::test]
    async fn lease_gate_rejects_bare_requests() {
        let ctx = make_ctx();
        let reg = OpsCommandRegistry::with_defaults();
        let payload = reg
            .dispatch(
                CommandRequest {
                    request_id: RequestId::from("r1"),
                    command: "session.open".into(),
                    params: Some(json!({"tabId": 7})),
                    ops_session_id: None,
                    lease_id: Some(LeaseId::from("l-1")),
                },
                &ctx,
            )
            .await
            .unwrap();
        let id = OpsSessionId::from(payload["opsSessionId"].as_str().unwrap());
        assert_eq!(payload["leaseRequired"], true);

        let err = reg
            .dispatch(scoped("session.status", None, &id), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, "lease_required");

        let ok = reg
            .dispatch(
                CommandRequest {
                    request_id: RequestId::from("r2"),
                    command: "session.status".into(),
                    params: None,
                    ops_session_id: Some(id),
                    lease_id: Some(LeaseId::from("anything")),
                },
                &ctx,
            )
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn console_read_honors_cursor() {
        let ctx = make_ctx();
        let id = open(&ctx, 7).await;
        let session = ctx.registry.get(&id).unwrap();
        for i in 0..3 {
            let _ = session.push_console(ConsoleEntry {
                level: "log".into(),
                text: format!("line {i}"),
                target_id: None,
                timestamp: Utc::now(),
            });
        }

        let reg = OpsCommandRegistry::with_defaults();
        let all = reg
            .dispatch(scoped("session.console", None, &id), &ctx)
            .await
            .unwrap();
        assert_eq!(all["entries"].as_array().unwrap().len(), 3);
        assert_eq!(all["latestSeq"], 3);

        let tail = reg
            .dispatch(
                scoped("session.console", Some(json!({"sinceSeq": 2})), &id),
                &ctx,
            )
            .await
            .unwrap();
        let entries = tail["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["text"], "line 2");
        assert_eq!(entries[0]["seq"], 3);
    }

    #[tokio::test]
    async fn network_read_empty_buffer() {
        let ctx = make_ctx();
        let id = open(&ctx, 7).await;
        let reg = OpsCommandRegistry::with_defaults();
        let payload = reg
            .dispatch(scoped("session.network", None, &id), &ctx)
            .await
            .unwrap();
        assert_eq!(payload["entries"].as_array().unwrap().len(), 0);
        assert_eq!(payload["latestSeq"], 0);
    }
}
