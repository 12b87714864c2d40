//! Periodic full-state checkpoints of a supervised loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::agent::engine::AgentEngine;
use crate::agent::heartbeat::ensure_owned;
use crate::agent::supervisor::{LoopState, SupervisorConfig};
use crate::db::Database;
use crate::error::DatabaseError;

/// Persists the whole [`LoopState`] on an interval.
///
/// Best-effort: a failed write is logged and the next tick tries again. The
/// timer stops once another supervisor has claimed the record.
pub struct CheckpointRunner {
    interval: Duration,
    store: Arc<dyn Database>,
    state: Arc<RwLock<LoopState>>,
    engine: Option<Arc<AgentEngine>>,
}

impl CheckpointRunner {
    pub fn new(
        interval: Duration,
        store: Arc<dyn Database>,
        state: Arc<RwLock<LoopState>>,
        engine: Option<Arc<AgentEngine>>,
    ) -> Self {
        Self {
            interval,
            store,
            state,
            engine,
        }
    }

    pub async fn run(&self) {
        let period = if self.interval.is_zero() {
            let fallback = SupervisorConfig::default().checkpoint_interval;
            tracing::warn!("Checkpoint interval is zero, using {:?}", fallback);
            fallback
        } else {
            self.interval
        };
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            interval.tick().await;
            match self.checkpoint().await {
                Ok(()) => {}
                Err(e @ DatabaseError::Superseded { .. }) => {
                    tracing::error!("Stopping checkpoints: {}", e);
                    return;
                }
                Err(e) => tracing::warn!("Checkpoint failed, retrying next tick: {}", e),
            }
        }
    }

    /// Pull the current task's progress into the loop state.
    pub async fn sync(&self) {
        let Some(engine) = &self.engine else {
            return;
        };
        let Some(task_id) = self.state.read().await.current_task_id else {
            return;
        };
        if let Some(task) = engine.snapshot(task_id).await {
            self.state.write().await.absorb(&task);
        }
    }

    /// Sync and upsert once.
    pub async fn checkpoint(&self) -> Result<(), DatabaseError> {
        let (id, ours) = {
            let state = self.state.read().await;
            (state.id, state.last_heartbeat)
        };
        ensure_owned(self.store.as_ref(), id, ours).await?;

        self.sync().await;
        let snapshot = {
            let mut state = self.state.write().await;
            state.last_checkpoint = Some(Utc::now());
            state.clone()
        };
        self.store.upsert_loop_state(&snapshot).await?;
        tracing::debug!(loop_id = %snapshot.id, step = snapshot.step_index, "Checkpointed loop");
        Ok(())
    }
}

/// Spawn the checkpoint timer as a background task.
pub fn spawn_checkpoint(runner: CheckpointRunner) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        runner.run().await;
    })
}
