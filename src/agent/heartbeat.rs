//! Liveness heartbeat for a supervised loop.
//!
//! The runner writes the loop's `last_heartbeat` and status on every tick.
//! Other supervisors, and the next start of this one, read that timestamp to
//! decide whether a record is abandoned. A failed write is logged and retried
//! on the next tick. The runner stops only when the record turns out to have
//! been claimed by another supervisor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agent::supervisor::{LoopState, SupervisorConfig};
use crate::db::Database;
use crate::error::DatabaseError;

/// Consecutive failures after which each further failure logs at error level.
const FAILURE_ALERT_THRESHOLD: u32 = 3;

/// Heartbeat runner for one loop.
pub struct HeartbeatRunner {
    interval: Duration,
    store: Arc<dyn Database>,
    state: Arc<RwLock<LoopState>>,
    consecutive_failures: u32,
}

impl HeartbeatRunner {
    pub fn new(interval: Duration, store: Arc<dyn Database>, state: Arc<RwLock<LoopState>>) -> Self {
        Self {
            interval,
            store,
            state,
            consecutive_failures: 0,
        }
    }

    /// Run until the owning task is aborted.
    pub async fn run(&mut self) {
        tracing::debug!("Starting heartbeat loop with interval {:?}", self.interval);

        let period = if self.interval.is_zero() {
            let fallback = SupervisorConfig::default().heartbeat_interval;
            tracing::warn!("Heartbeat interval is zero, using {:?}", fallback);
            fallback
        } else {
            self.interval
        };
        let mut interval = tokio::time::interval(period);
        // Don't beat immediately; start() just persisted a fresh heartbeat.
        interval.tick().await;

        loop {
            interval.tick().await;

            match self.beat().await {
                Ok(()) => {
                    if self.consecutive_failures > 0 {
                        tracing::info!(
                            failures = self.consecutive_failures,
                            "Heartbeat recovered"
                        );
                    }
                    self.consecutive_failures = 0;
                }
                Err(e @ DatabaseError::Superseded { .. }) => {
                    tracing::error!("Stopping heartbeat: {}", e);
                    return;
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= FAILURE_ALERT_THRESHOLD {
                        tracing::error!(
                            failures = self.consecutive_failures,
                            "Heartbeat failing, loop may be considered abandoned: {}",
                            e
                        );
                    } else {
                        tracing::warn!("Heartbeat write failed: {}", e);
                    }
                }
            }
        }
    }

    /// Write one heartbeat, unless the record has been claimed elsewhere.
    pub async fn beat(&self) -> Result<(), DatabaseError> {
        let (id, ours) = {
            let state = self.state.read().await;
            (state.id, state.last_heartbeat)
        };
        ensure_owned(self.store.as_ref(), id, ours).await?;

        let now = Utc::now();
        let status = {
            let mut state = self.state.write().await;
            state.last_heartbeat = now;
            state.status
        };
        self.store.update_heartbeat(id, status, now).await
    }
}

/// Fail with [`DatabaseError::Superseded`] if the stored record carries a
/// heartbeat newer than the last one this process wrote.
///
/// A claim stamps the record with the claimer's clock, so a newer stored
/// heartbeat means another supervisor owns the loop. The read and the
/// following write are not atomic; a claim landing between them is caught on
/// the next tick.
pub(crate) async fn ensure_owned(
    store: &dyn Database,
    id: Uuid,
    ours: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    match store.get_loop_state(id).await? {
        Some(stored) if stored.last_heartbeat > ours => Err(DatabaseError::Superseded { id }),
        _ => Ok(()),
    }
}

/// Spawn the heartbeat as a background task.
pub fn spawn_heartbeat(mut runner: HeartbeatRunner) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        runner.run().await;
    })
}
