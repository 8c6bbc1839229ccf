//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at process startup before any metrics are recorded;
/// test servers skip it and run with the no-op recorder instead.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Ops websocket connections opened total (counter).
pub const OPS_CONNECTIONS_TOTAL: &str = "ops_connections_total";
/// Ops websocket disconnections total (counter).
pub const OPS_DISCONNECTIONS_TOTAL: &str = "ops_disconnections_total";
/// Active ops websocket connections (gauge).
pub const OPS_CONNECTIONS_ACTIVE: &str = "ops_connections_active";
/// Upgrades refused by the connection cap (counter).
pub const OPS_CONNECTIONS_REFUSED_TOTAL: &str = "ops_connections_refused_total";
/// Handshakes rejected for version mismatch (counter).
pub const OPS_HANDSHAKES_REJECTED_TOTAL: &str = "ops_handshakes_rejected_total";
/// Ops commands dispatched total (counter, labels: command).
pub const OPS_COMMANDS_TOTAL: &str = "ops_commands_total";
/// Ops command errors total (counter, labels: command, code).
pub const OPS_COMMAND_ERRORS_TOTAL: &str = "ops_command_errors_total";
/// Ops command duration seconds (histogram, labels: command).
pub const OPS_COMMAND_DURATION_SECONDS: &str = "ops_command_duration_seconds";
/// Responses that went out chunked (counter).
pub const OPS_CHUNKED_RESPONSES_TOTAL: &str = "ops_chunked_responses_total";
/// Server pushes enqueued total (counter, labels: event).
pub const OPS_EVENTS_PUSHED_TOTAL: &str = "ops_events_pushed_total";
/// Pushes dropped on a full or closed client channel (counter).
pub const OPS_PUSH_DROPS_TOTAL: &str = "ops_push_drops_total";
/// Sockets closed for missed heartbeats (counter).
pub const OPS_HEARTBEAT_CLOSES_TOTAL: &str = "ops_heartbeat_closes_total";
/// Live ops sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Sessions opened total (counter, labels: mode).
pub const SESSIONS_OPENED_TOTAL: &str = "sessions_opened_total";
/// Sessions closed total (counter).
pub const SESSIONS_CLOSED_TOTAL: &str = "sessions_closed_total";
/// Sessions expired by the idle sweep (counter).
pub const SESSIONS_EXPIRED_TOTAL: &str = "sessions_expired_total";
/// Current effective cap (gauge, labels: mode).
pub const GOVERNOR_EFFECTIVE_CAP: &str = "governor_effective_cap";
/// Latest pressure class, 0 healthy to 3 critical (gauge).
pub const GOVERNOR_PRESSURE_CLASS: &str = "governor_pressure_class";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_render() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            OPS_CONNECTIONS_TOTAL,
            OPS_DISCONNECTIONS_TOTAL,
            OPS_CONNECTIONS_ACTIVE,
            OPS_CONNECTIONS_REFUSED_TOTAL,
            OPS_HANDSHAKES_REJECTED_TOTAL,
            OPS_COMMANDS_TOTAL,
            OPS_COMMAND_ERRORS_TOTAL,
            OPS_COMMAND_DURATION_SECONDS,
            OPS_CHUNKED_RESPONSES_TOTAL,
            OPS_EVENTS_PUSHED_TOTAL,
            OPS_PUSH_DROPS_TOTAL,
            OPS_HEARTBEAT_CLOSES_TOTAL,
            SESSIONS_ACTIVE,
            SESSIONS_OPENED_TOTAL,
            SESSIONS_CLOSED_TOTAL,
            SESSIONS_EXPIRED_TOTAL,
            GOVERNOR_EFFECTIVE_CAP,
            GOVERNOR_PRESSURE_CLASS,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
