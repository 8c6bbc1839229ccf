//! Per-client connection state for the ops websocket.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bridle_core::ClientId;
use bridle_ops::OpsFrame;
use metrics::counter;
use tokio::sync::mpsc;

use crate::metrics::OPS_PUSH_DROPS_TOTAL;

/// Outbound channel depth per connection.
pub const SEND_QUEUE_DEPTH: usize = 1024;

/// One connected ops client, past the handshake.
pub struct OpsClientConn {
    /// Server-assigned client id, echoed in the handshake ack.
    pub id: ClientId,
    /// Negotiated `maxPayloadBytes` for this connection.
    pub max_payload_bytes: usize,
    tx: mpsc::Sender<OpsFrame>,
    connected_at: Instant,
    missed_pongs: AtomicU32,
    next_ping_id: AtomicU64,
    dropped_frames: AtomicU64,
}

impl OpsClientConn {
    pub fn new(id: ClientId, tx: mpsc::Sender<OpsFrame>, max_payload_bytes: usize) -> Self {
        Self {
            id,
            max_payload_bytes,
            tx,
            connected_at: Instant::now(),
            missed_pongs: AtomicU32::new(0),
            next_ping_id: AtomicU64::new(1),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame for the write half.
    ///
    /// Returns `false` when the channel is full or closed; the frame is
    /// dropped and counted rather than blocking the caller.
    pub fn send(&self, frame: OpsFrame) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            counter!(OPS_PUSH_DROPS_TOTAL).increment(1);
            false
        }
    }

    /// Total frames dropped on this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Next heartbeat ping id.
    pub fn next_ping_id(&self) -> u64 {
        self.next_ping_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Count one unanswered ping; returns the new consecutive-miss total.
    pub fn record_missed_pong(&self) -> u32 {
        self.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A pong arrived; the miss streak resets.
    pub fn reset_missed_pongs(&self) {
        self.missed_pongs.store(0, Ordering::Relaxed);
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
