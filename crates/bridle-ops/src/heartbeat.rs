//! Heartbeat loop: fixed-interval pings with per-ping timeouts.
//!
//! The host platform does not always surface socket death promptly; the
//! missed-pong counter is what detects a silently-dead transport. Once
//! `max_missed_pongs` consecutive pings go unanswered the loop reports the
//! connection dead and the transport force-closes the socket with a
//! reconnect-eligible close code.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::conn::OpsConnection;

/// Default interval between pings in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 15_000;
/// Default per-ping pong deadline in milliseconds.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 5_000;
/// Default consecutive misses before the connection is declared dead.
pub const DEFAULT_MAX_MISSED_PONGS: u32 = 3;

/// Heartbeat parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    /// Interval between pings in ms (default: 15000).
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Per-ping pong deadline in ms (default: 5000).
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Consecutive misses before the socket is declared dead (default: 3).
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}
fn default_ping_timeout_ms() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}
fn default_max_missed_pongs() -> u32 {
    DEFAULT_MAX_MISSED_PONGS
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            max_missed_pongs: DEFAULT_MAX_MISSED_PONGS,
        }
    }
}

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// `max_missed_pongs` consecutive pings went unanswered.
    Dead,
    /// The loop was cancelled externally.
    Cancelled,
    /// The connection closed underneath the loop.
    Closed,
}

/// Run heartbeat pings for a connection until it dies, closes, or the token
/// cancels.
///
/// Each ping carries its own deadline; a pong resets the missed counter,
/// a miss increments it.
pub async fn run_heartbeat(
    conn: Arc<OpsConnection>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
) -> HeartbeatOutcome {
    let mut tick = time::interval(Duration::from_millis(config.interval_ms.max(1)));
    // Skip the immediate first tick.
    let _ = tick.tick().await;
    let ping_timeout = Duration::from_millis(config.ping_timeout_ms.max(1));
    let max_missed = config.max_missed_pongs.max(1);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if conn.is_closed() {
                    return HeartbeatOutcome::Closed;
                }
                if conn.ping(ping_timeout).await {
                    conn.reset_missed_pongs();
                } else {
                    if conn.is_closed() {
                        return HeartbeatOutcome::Closed;
                    }
                    let missed = conn.record_missed_pong();
                    warn!(missed, max_missed, "heartbeat pong missed");
                    if missed >= max_missed {
                        return HeartbeatOutcome::Dead;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatOutcome::Cancelled;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::OpsFrame;
    use bridle_core::ClientId;
    use tokio::sync::mpsc;

    fn ready_conn() -> (Arc<OpsConnection>, mpsc::Receiver<OpsFrame>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = OpsConnection::new(tx, 1024 * 1024);
        conn.complete_handshake(ClientId::from("hb"), 1024 * 1024);
        (Arc::new(conn), rx)
    }

    fn fast_config(max_missed: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            interval_ms: 100,
            ping_timeout_ms: 50,
            max_missed_pongs: max_missed,
        }
    }

    #[test]
    fn config_defaults() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval_ms, 15_000);
        assert_eq!(config.ping_timeout_ms, 5_000);
        assert_eq!(config.max_missed_pongs, 3);
    }

    #[test]
    fn config_serde_defaults() {
        let config: HeartbeatConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_missed_pongs, 3);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("maxMissedPongs"));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_after_max_missed_pongs() {
        let (conn, mut rx) = ready_conn();
        let outcome_task =
            tokio::spawn(run_heartbeat(conn, fast_config(3), CancellationToken::new()));

        // Drain pings without ever answering.
        let mut pings = 0;
        while let Some(frame) = rx.recv().await {
            if matches!(frame, OpsFrame::Ping { .. }) {
                pings += 1;
            }
        }
        assert_eq!(pings, 3);
        assert_eq!(outcome_task.await.unwrap(), HeartbeatOutcome::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_the_loop_alive() {
        let (conn, mut rx) = ready_conn();
        let cancel = CancellationToken::new();
        let loop_conn = conn.clone();
        let loop_cancel = cancel.clone();
        let outcome_task =
            tokio::spawn(run_heartbeat(loop_conn, fast_config(2), loop_cancel));

        // Answer five pings, then cancel.
        for _ in 0..5 {
            let frame = rx.recv().await.unwrap();
            let OpsFrame::Ping { id } = frame else {
                panic!("expected ping");
            };
            conn.handle_frame(OpsFrame::Pong { id });
        }
        cancel.cancel();
        assert_eq!(outcome_task.await.unwrap(), HeartbeatOutcome::Cancelled);
        assert_eq!(conn.missed_pongs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_miss_then_pong_resets_the_counter() {
        let (conn, mut rx) = ready_conn();
        let cancel = CancellationToken::new();
        let outcome_task =
            tokio::spawn(run_heartbeat(conn.clone(), fast_config(3), cancel.clone()));

        // Let the first ping time out unanswered.
        let _ = rx.recv().await.unwrap();
        // Answer the next two.
        for _ in 0..2 {
            let frame = rx.recv().await.unwrap();
            let OpsFrame::Ping { id } = frame else {
                panic!("expected ping");
            };
            conn.handle_frame(OpsFrame::Pong { id });
        }
        cancel.cancel();
        assert_eq!(outcome_task.await.unwrap(), HeartbeatOutcome::Cancelled);
        assert_eq!(conn.missed_pongs(), 0);
    }

    #[tokio::test]
    async fn cancelled_immediately() {
        let (conn, _rx) = ready_conn();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_heartbeat(conn, HeartbeatConfig::default(), cancel).await;
        assert_eq!(outcome, HeartbeatOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_ends_the_loop() {
        let (conn, mut rx) = ready_conn();
        let outcome_task =
            tokio::spawn(run_heartbeat(conn.clone(), fast_config(5), CancellationToken::new()));
        let _ = rx.recv().await;
        conn.close();
        assert_eq!(outcome_task.await.unwrap(), HeartbeatOutcome::Closed);
    }
}
