//! Door controller command/acknowledge port
//!
//! The wire protocol to real controllers lives outside this crate. The engine
//! only needs "drive door X to state Y" and an acknowledgement.

use crate::domain::door::{Door, DoorStatus};
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("controller for door `{0}` is unreachable")]
    Unreachable(String),
    #[error("controller rejected command: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait DoorHardware: Send + Sync {
    /// Drive the door to `target`. Returns acknowledgement latency in microseconds.
    async fn apply(&self, door: &Door, target: DoorStatus) -> Result<u64, HardwareError>;
}

/// Controller stand-in that acknowledges every command for reachable doors
#[derive(Default)]
pub struct SimulatedController {
    unreachable: RwLock<FxHashSet<String>>,
    ack_delay: Duration,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every acknowledgement (e.g. to exercise deadlines)
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    pub fn set_reachable(&self, door_id: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(door_id);
        } else {
            unreachable.insert(door_id.to_string());
        }
    }
}

#[async_trait]
impl DoorHardware for SimulatedController {
    async fn apply(&self, door: &Door, target: DoorStatus) -> Result<u64, HardwareError> {
        let start = Instant::now();

        if !self.ack_delay.is_zero() {
            tokio::time::sleep(self.ack_delay).await;
        }

        if self.unreachable.read().contains(&door.id) {
            error!(door_id = %door.id, target = %target, mode = "simulated", "door_command_error");
            return Err(HardwareError::Unreachable(door.id.clone()));
        }

        let latency_us = start.elapsed().as_micros() as u64;
        info!(
            door_id = %door.id,
            target = %target,
            latency_us = %latency_us,
            mode = "simulated",
            "door_command_ack"
        );
        Ok(latency_us)
    }
}
