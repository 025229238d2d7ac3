//! Per-round deadline alarms.
//!
//! One single-shot timer per round, keyed by round_id, write-once. The task
//! holds no thread between arm and fire. Durability comes from the round rows
//! themselves: on boot the registry is rebuilt from rounds whose deadline is
//! still relevant, and the coarse tick remains the safety net for anything
//! the registry misses.

use crate::state::AppState;
use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Default)]
pub struct AlarmRegistry {
    inner: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl AlarmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the deadline alarm for a round. Write-once: re-arming an already
    /// armed round is a no-op and returns false.
    pub fn arm(&self, state: AppState, round_id: &str, fire_at: DateTime<FixedOffset>) -> bool {
        let mut map = self.inner.lock();
        if map.contains_key(round_id) {
            return false;
        }

        let delay = (fire_at - state.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let id = round_id.to_string();
        debug!("⏰ Arming deadline alarm for round {} in {:?}", id, delay);

        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            crate::scheduler::on_alarm(state, task_id).await;
        });
        map.insert(id, handle);
        true
    }

    /// Cancel a pending alarm, e.g. when an operator settles first.
    pub fn cancel(&self, round_id: &str) -> bool {
        let removed = self.inner.lock().remove(round_id);
        if let Some(handle) = removed {
            handle.abort();
            info!("🔕 Cancelled deadline alarm for round {}", round_id);
            true
        } else {
            false
        }
    }

    /// Deregister after firing. Called from the alarm task itself.
    pub fn forget(&self, round_id: &str) {
        self.inner.lock().remove(round_id);
    }

    pub fn is_armed(&self, round_id: &str) -> bool {
        self.inner.lock().contains_key(round_id)
    }

    pub fn armed_count(&self) -> usize {
        self.inner.lock().len()
    }
}
