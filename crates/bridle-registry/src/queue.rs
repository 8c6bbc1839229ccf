//! Per-target FIFO command gates.
//!
//! Interactions against one target are serialized (a second command waits
//! for the first); commands against different targets proceed concurrently.
//! Waiters are tracked so the governor's sampler can read queue depth and
//! the age of the oldest waiting command.

use bridle_core::TargetId;
use bridle_governor::QueueSnapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;

/// Holding this guard means the target's gate is yours; drop to release.
pub struct GateGuard {
    _permit: OwnedMutexGuard<()>,
}

/// FIFO gates keyed by target.
#[derive(Default)]
pub struct TargetGates {
    gates: Mutex<HashMap<TargetId, Arc<tokio::sync::Mutex<()>>>>,
    waiters: Mutex<HashMap<u64, Instant>>,
    next_waiter: AtomicU64,
}

impl TargetGates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the target's gate. Acquisition order is FIFO per target
    /// (tokio mutexes queue waiters fairly).
    pub async fn acquire(&self, target: &TargetId) -> GateGuard {
        let gate = Arc::clone(
            self.gates
                .lock()
                .entry(target.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );

        let token = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let _ = self.waiters.lock().insert(token, Instant::now());
        let permit = gate.lock_owned().await;
        let _ = self.waiters.lock().remove(&token);
        GateGuard { _permit: permit }
    }

    /// Commands currently waiting across all targets.
    #[must_use]
    pub fn depth(&self) -> u32 {
        u32::try_from(self.waiters.lock().len()).unwrap_or(u32::MAX)
    }

    /// Age of the oldest waiting command in milliseconds (0 when none).
    #[must_use]
    pub fn oldest_age_ms(&self) -> u64 {
        self.waiters
            .lock()
            .values()
            .map(|started| started.elapsed().as_millis())
            .max()
            .map_or(0, |ms| u64::try_from(ms).unwrap_or(u64::MAX))
    }

    /// Depth/age pair in the governor's shape.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            depth: self.depth(),
            age_ms: self.oldest_age_ms(),
        }
    }

    /// Drop the gate for a closed target. In-flight guards stay valid; new
    /// acquisitions get a fresh gate.
    pub fn remove_target(&self, target: &TargetId) {
        let _ = self.gates.lock().remove(target);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn same_target_commands_are_serialized() {
        let gates = Arc::new(TargetGates::new());
        let target = TargetId::from("t-1");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = gates.acquire(&target).await;

        let gates2 = Arc::clone(&gates);
        let target2 = target.clone();
        let tx2 = tx.clone();
        let waiter = tokio::spawn(async move {
            let _guard = gates2.acquire(&target2).await;
            tx2.send("second").unwrap();
        });

        // The second command is parked behind the gate.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(gates.depth(), 1);

        drop(first);
        waiter.await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "second");
        assert_eq!(gates.depth(), 0);
    }

    #[tokio::test]
    async fn different_targets_proceed_concurrently() {
        let gates = Arc::new(TargetGates::new());
        let held = gates.acquire(&TargetId::from("t-1")).await;

        // A different target's gate is immediately available.
        let other = tokio::time::timeout(
            Duration::from_millis(100),
            gates.acquire(&TargetId::from("t-2")),
        )
        .await
        .expect("cross-target acquire should not block");
        drop(other);
        drop(held);
    }

    #[tokio::test]
    async fn oldest_age_tracks_the_longest_waiter() {
        let gates = Arc::new(TargetGates::new());
        let target = TargetId::from("t-1");
        let held = gates.acquire(&target).await;

        let gates2 = Arc::clone(&gates);
        let target2 = target.clone();
        let waiter = tokio::spawn(async move {
            let _guard = gates2.acquire(&target2).await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let snapshot = gates.snapshot();
        assert_eq!(snapshot.depth, 1);
        assert!(snapshot.age_ms >= 20);

        drop(held);
        waiter.await.unwrap();
        assert_eq!(gates.snapshot(), QueueSnapshot { depth: 0, age_ms: 0 });
    }
}
