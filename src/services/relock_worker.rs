//! Re-lock worker - closes temporarily unlocked doors when their timer expires
//!
//! The HTTP layer enqueues a `RelockCmd` after a successful temp unlock. Each
//! command gets its own timer task, so a long delay on one door never holds
//! up another. When the timer fires the engine locks the door only if it is
//! still in the temp-unlocked state this timer was started for; any later
//! command on the door wins, including a newer temporary unlock.

use crate::infra::metrics::Metrics;
use crate::services::engine::AccessControlEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// A pending re-lock for one door
#[derive(Debug)]
pub struct RelockCmd {
    pub door_id: String,
    /// Door version written by the temporary unlock
    pub version: u64,
    /// Time to wait after `enqueued_at`
    pub delay: Duration,
    pub enqueued_at: Instant,
}

impl RelockCmd {
    pub fn new(door_id: &str, version: u64, auto_lock_seconds: u64) -> Self {
        Self {
            door_id: door_id.to_string(),
            version,
            delay: Duration::from_secs(auto_lock_seconds),
            enqueued_at: Instant::now(),
        }
    }
}

pub struct RelockWorker {
    engine: Arc<AccessControlEngine>,
    cmd_rx: mpsc::Receiver<RelockCmd>,
    metrics: Arc<Metrics>,
}

impl RelockWorker {
    pub fn new(
        engine: Arc<AccessControlEngine>,
        cmd_rx: mpsc::Receiver<RelockCmd>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { engine, cmd_rx, metrics }
    }

    /// Run the worker until every sender is gone
    pub async fn run(mut self) {
        info!("relock_worker_started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            let engine = self.engine.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(cmd.enqueued_at + cmd.delay).await;

                let late_ms = cmd.enqueued_at.elapsed().saturating_sub(cmd.delay).as_millis() as u64;
                match engine.relock(&cmd.door_id, cmd.version).await {
                    Ok(Some(_)) => {
                        metrics.record_relock(true);
                        info!(door_id = %cmd.door_id, late_ms = %late_ms, "door_relocked");
                    }
                    Ok(None) => {
                        metrics.record_relock(false);
                        info!(door_id = %cmd.door_id, version = %cmd.version, "door_relock_skipped");
                    }
                    Err(e) => {
                        metrics.record_relock(false);
                        error!(door_id = %cmd.door_id, error = %e, "door_relock_failed");
                    }
                }
            });
        }

        info!("relock_worker_stopped");
    }
}

/// Create a re-lock channel and worker
///
/// Returns the sender (for the HTTP layer) and the worker (to be spawned)
pub fn create_relock_worker(
    engine: Arc<AccessControlEngine>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> (mpsc::Sender<RelockCmd>, RelockWorker) {
    let (cmd_tx, cmd_rx) = mpsc::channel(buffer_size);
    let worker = RelockWorker::new(engine, cmd_rx, metrics);
    (cmd_tx, worker)
}

/// Enqueue a re-lock without blocking. Returns false if the queue was full or closed.
pub fn schedule_relock(
    tx: &mpsc::Sender<RelockCmd>,
    metrics: &Metrics,
    door_id: &str,
    version: u64,
    auto_lock_seconds: u64,
) -> bool {
    match tx.try_send(RelockCmd::new(door_id, version, auto_lock_seconds)) {
        Ok(()) => {
            metrics.record_relock_scheduled();
            true
        }
        Err(e) => {
            warn!(door_id = %door_id, error = %e, "door_relock_not_scheduled");
            false
        }
    }
}
