//! Persistent loop supervisor.
//!
//! One supervisor owns one (user, session) pair. It recovers an abandoned
//! record on start, keeps the record alive with a heartbeat, checkpoints the
//! full [`LoopState`] on a timer, and pauses cleanly on stop.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::checkpoint::{CheckpointRunner, spawn_checkpoint};
use crate::agent::engine::AgentEngine;
use crate::agent::heartbeat::{HeartbeatRunner, spawn_heartbeat};
use crate::agent::memory::AgentMemory;
use crate::agent::task::{AgentTask, StepKind, TaskStatus};
use crate::db::Database;
use crate::error::SupervisorError;
use crate::safety::to_chrono;

/// Timer cadences and recovery limits.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub checkpoint_interval: Duration,
    /// A running record whose heartbeat is older than this is abandoned.
    pub stale_after: Duration,
    /// Recoveries allowed before a record is marked crashed.
    pub max_recovery_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            checkpoint_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(60),
            max_recovery_attempts: 3,
        }
    }
}

/// Supervisor lifecycle.
///
/// `idle -> running <-> paused`; `recovering` is an entry path and
/// `crashed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Idle,
    Running,
    Paused,
    Recovering,
    Crashed,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Recovering => "recovering",
            Self::Crashed => "crashed",
        }
    }

    /// Whether a record in this status may be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Recovering)
    }
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoopStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "recovering" => Ok(Self::Recovering),
            "crashed" => Ok(Self::Crashed),
            other => Err(format!("unknown loop status '{other}'")),
        }
    }
}

/// The durable supervisory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub status: LoopStatus,
    pub current_task_id: Option<Uuid>,
    pub current_phase: Option<StepKind>,
    pub step_index: usize,
    pub context: HashMap<String, Value>,
    pub memory: AgentMemory,
    pub last_heartbeat: DateTime<Utc>,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoopState {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            status: LoopStatus::Idle,
            current_task_id: None,
            current_phase: None,
            step_index: 0,
            context: HashMap::new(),
            memory: AgentMemory::new(),
            last_heartbeat: now,
            last_checkpoint: None,
            recovery_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy task progress into the record.
    pub fn absorb(&mut self, task: &AgentTask) {
        self.current_task_id = Some(task.id);
        self.current_phase = task.current_phase();
        self.step_index = task.current_step;
        self.context = task.context.clone();
        self.memory = task.memory.clone();
        self.updated_at = Utc::now();
    }

    /// Whether the heartbeat is older than `stale_after` at `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.last_heartbeat < now - to_chrono(stale_after)
    }
}

/// What [`LoopSupervisor::start`] found.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// No abandoned record; started a new one.
    Fresh,
    /// Took over an abandoned record.
    Recovered {
        loop_id: Uuid,
        resumed_task: Option<Uuid>,
    },
    /// The abandoned record exceeded the recovery ceiling and was marked
    /// crashed; started a new one.
    Abandoned { loop_id: Uuid, attempts: u32 },
}

/// Supervises one (user, session) loop.
pub struct LoopSupervisor {
    config: SupervisorConfig,
    store: Arc<dyn Database>,
    engine: Option<Arc<AgentEngine>>,
    state: Arc<RwLock<LoopState>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopSupervisor {
    pub fn new(
        config: SupervisorConfig,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        store: Arc<dyn Database>,
    ) -> Self {
        Self {
            config,
            store,
            engine: None,
            state: Arc::new(RwLock::new(LoopState::new(user_id, session_id))),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Attach the engine that runs submitted goals.
    pub fn with_engine(mut self, engine: Arc<AgentEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn engine(&self) -> Option<&Arc<AgentEngine>> {
        self.engine.as_ref()
    }

    /// A copy of the current loop state.
    pub async fn state(&self) -> LoopState {
        self.state.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        !self.timers.lock().await.is_empty()
    }

    /// Recover if possible, persist, and start the timers.
    pub async fn start(&self) -> Result<RecoveryOutcome, SupervisorError> {
        let mut timers = self.timers.lock().await;
        if !timers.is_empty() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let outcome = self.recover().await?;

        let snapshot = {
            let mut state = self.state.write().await;
            let now = Utc::now();
            state.status = LoopStatus::Running;
            state.last_heartbeat = now;
            state.last_checkpoint = Some(now);
            state.updated_at = now;
            state.clone()
        };
        self.store.upsert_loop_state(&snapshot).await?;

        timers.push(spawn_heartbeat(HeartbeatRunner::new(
            self.config.heartbeat_interval,
            Arc::clone(&self.store),
            Arc::clone(&self.state),
        )));
        timers.push(spawn_checkpoint(self.checkpointer()));

        tracing::info!(
            loop_id = %snapshot.id,
            user_id = %snapshot.user_id,
            session_id = %snapshot.session_id,
            outcome = ?outcome,
            "Loop supervisor started"
        );
        Ok(outcome)
    }

    /// Look for an abandoned record of this (user, session) and take it
    /// over.
    ///
    /// A record with a fresh heartbeat belongs to a live process and is left
    /// alone.
    pub async fn recover(&self) -> Result<RecoveryOutcome, SupervisorError> {
        let (user_id, session_id) = {
            let state = self.state.read().await;
            (state.user_id.clone(), state.session_id.clone())
        };

        let Some(existing) = self.store.find_active_loop(&user_id, &session_id).await? else {
            return Ok(RecoveryOutcome::Fresh);
        };

        let now = Utc::now();
        let stale_before = now - to_chrono(self.config.stale_after);
        let Some(claimed) = self
            .store
            .claim_stale_loop(existing.id, stale_before, now)
            .await?
        else {
            tracing::warn!(
                loop_id = %existing.id,
                user_id = %user_id,
                session_id = %session_id,
                "Loop is owned by a live process, not recovering"
            );
            return Err(SupervisorError::SessionOwned {
                user_id,
                session_id,
                loop_id: existing.id,
            });
        };

        if claimed.recovery_attempts > self.config.max_recovery_attempts {
            tracing::error!(
                loop_id = %claimed.id,
                attempts = claimed.recovery_attempts,
                "Recovery ceiling exceeded, marking loop crashed"
            );
            self.store
                .update_loop_status(claimed.id, LoopStatus::Crashed)
                .await?;
            return Ok(RecoveryOutcome::Abandoned {
                loop_id: claimed.id,
                attempts: claimed.recovery_attempts,
            });
        }

        let resumed_task = self.resume_task(&claimed).await;
        let loop_id = claimed.id;

        tracing::info!(
            loop_id = %loop_id,
            attempt = claimed.recovery_attempts,
            resumed_task = ?resumed_task,
            "Recovered abandoned loop"
        );

        *self.state.write().await = LoopState {
            status: LoopStatus::Recovering,
            ..claimed
        };

        Ok(RecoveryOutcome::Recovered {
            loop_id,
            resumed_task,
        })
    }

    /// Halt the timers, mark the loop paused and persist it one last time.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let handles = std::mem::take(&mut *self.timers.lock().await);
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        self.sync_task().await;
        let snapshot = {
            let mut state = self.state.write().await;
            let now = Utc::now();
            state.status = LoopStatus::Paused;
            state.last_checkpoint = Some(now);
            state.updated_at = now;
            state.clone()
        };
        self.store.upsert_loop_state(&snapshot).await?;

        tracing::info!(loop_id = %snapshot.id, "Loop supervisor paused");
        Ok(())
    }

    /// Create a task for `goal` and make it the loop's current task.
    pub async fn submit(&self, goal: &str) -> Result<Uuid, SupervisorError> {
        let engine = self.engine.as_ref().ok_or(SupervisorError::NoEngine)?;
        let (user_id, session_id) = {
            let state = self.state.read().await;
            (state.user_id.clone(), state.session_id.clone())
        };

        let task_id = engine
            .create_session_task(&user_id, &session_id, goal)
            .await;

        let mut state = self.state.write().await;
        state.current_task_id = Some(task_id);
        state.current_phase = None;
        state.step_index = 0;
        state.updated_at = Utc::now();
        Ok(task_id)
    }

    /// Run the current task until it finishes or parks, then checkpoint.
    pub async fn drive(&self) -> Result<TaskStatus, SupervisorError> {
        let engine = self.engine.as_ref().ok_or(SupervisorError::NoEngine)?;
        let task_id = self
            .state
            .read()
            .await
            .current_task_id
            .ok_or(SupervisorError::NoTask)?;

        let status = engine.run(task_id).await?;

        self.sync_task().await;
        if status.is_terminal() {
            self.state.write().await.recovery_attempts = 0;
        }
        if let Err(e) = self.checkpointer().checkpoint().await {
            tracing::warn!(task_id = %task_id, "Checkpoint after run failed: {}", e);
        }
        Ok(status)
    }

    fn checkpointer(&self) -> CheckpointRunner {
        CheckpointRunner::new(
            self.config.checkpoint_interval,
            Arc::clone(&self.store),
            Arc::clone(&self.state),
            self.engine.clone(),
        )
    }

    async fn sync_task(&self) {
        self.checkpointer().sync().await;
    }

    /// Bring the record's task back to life, if it was mid-flight.
    async fn resume_task(&self, claimed: &LoopState) -> Option<Uuid> {
        let task_id = claimed.current_task_id?;

        let record = match self.store.get_task(task_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(task_id = %task_id, "Recovered loop references a missing task");
                return None;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, "Failed to load task for resumption: {}", e);
                return None;
            }
        };

        if !record.status.is_in_progress() {
            tracing::debug!(
                task_id = %task_id,
                status = %record.status,
                "Task not in progress, nothing to resume"
            );
            return None;
        }

        match &self.engine {
            Some(engine) => {
                if let Err(e) = engine
                    .restore(&record, claimed.context.clone(), claimed.memory.clone())
                    .await
                {
                    tracing::warn!(task_id = %task_id, "Failed to restore task: {}", e);
                    return None;
                }
            }
            None => {
                if let Err(e) = self
                    .store
                    .update_task_status(task_id, TaskStatus::Executing)
                    .await
                {
                    tracing::warn!(task_id = %task_id, "Failed to mark task resumed: {}", e);
                }
                let event = json!({ "event": "resumed", "from": record.status });
                if let Err(e) = self.store.save_task_event(task_id, "resumed", &event).await {
                    tracing::warn!(task_id = %task_id, "Failed to log resumption: {}", e);
                }
            }
        }

        Some(task_id)
    }
}

impl Drop for LoopSupervisor {
    fn drop(&mut self) {
        for handle in self.timers.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::agent::task::TaskRecord;
    use crate::db::InMemoryDatabase;
    use crate::safety::ConfirmationManager;
    use crate::testing::{MockBridge, ScriptedLlm};
    use pretty_assertions::assert_eq;

    fn store() -> Arc<dyn Database> {
        Arc::new(InMemoryDatabase::new())
    }

    fn supervisor(store: &Arc<dyn Database>) -> LoopSupervisor {
        LoopSupervisor::new(SupervisorConfig::default(), "alice", "s1", Arc::clone(store))
    }

    async fn seed(store: &Arc<dyn Database>, status: LoopStatus, heartbeat_age: i64, attempts: u32) -> LoopState {
        let mut state = LoopState::new("alice", "s1");
        state.status = status;
        state.last_heartbeat = Utc::now() - chrono::Duration::seconds(heartbeat_age);
        state.recovery_attempts = attempts;
        store.upsert_loop_state(&state).await.unwrap();
        state
    }

    #[test]
    fn test_loop_status_round_trip() {
        for status in [
            LoopStatus::Idle,
            LoopStatus::Running,
            LoopStatus::Paused,
            LoopStatus::Recovering,
            LoopStatus::Crashed,
        ] {
            assert_eq!(status.as_str().parse::<LoopStatus>().unwrap(), status);
        }
        assert!(!LoopStatus::Crashed.is_resumable());
    }

    #[test]
    fn test_staleness() {
        let mut state = LoopState::new("alice", "s1");
        let now = Utc::now();
        state.last_heartbeat = now - chrono::Duration::seconds(61);
        assert!(state.is_stale_at(now, Duration::from_secs(60)));
        state.last_heartbeat = now - chrono::Duration::seconds(5);
        assert!(!state.is_stale_at(now, Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_fresh_start_persists_running_record() {
        let store = store();
        let sup = supervisor(&store);

        assert_eq!(sup.start().await.unwrap(), RecoveryOutcome::Fresh);
        let state = sup.state().await;
        let stored = store.get_loop_state(state.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LoopStatus::Running);
        assert!(sup.is_running().await);

        assert!(matches!(sup.start().await, Err(SupervisorError::AlreadyRunning)));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_record_is_not_taken_over() {
        let store = store();
        let existing = seed(&store, LoopStatus::Running, 5, 0).await;

        let err = supervisor(&store).start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::SessionOwned { loop_id, .. } if loop_id == existing.id));

        let stored = store.get_loop_state(existing.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LoopStatus::Running);
        assert_eq!(stored.recovery_attempts, 0);
    }

    #[tokio::test]
    async fn test_stale_record_is_recovered_once() {
        let store = store();
        let existing = seed(&store, LoopStatus::Running, 120, 0).await;

        let sup = supervisor(&store);
        let outcome = sup.start().await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered {
                loop_id: existing.id,
                resumed_task: None
            }
        );

        let state = sup.state().await;
        assert_eq!(state.id, existing.id);
        assert_eq!(state.recovery_attempts, 1);
        assert_eq!(state.status, LoopStatus::Running);

        // A second supervisor now sees a fresh heartbeat.
        assert!(matches!(
            supervisor(&store).start().await,
            Err(SupervisorError::SessionOwned { .. })
        ));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_ceiling_marks_crashed() {
        let store = store();
        let existing = seed(&store, LoopStatus::Running, 120, 3).await;

        let sup = supervisor(&store);
        let outcome = sup.start().await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Abandoned {
                loop_id: existing.id,
                attempts: 4
            }
        );

        let stored = store.get_loop_state(existing.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LoopStatus::Crashed);
        assert_ne!(sup.state().await.id, existing.id);

        sup.stop().await.unwrap();
        // Crashed records are never picked up again.
        let replacement = sup.state().await.id;
        let next = supervisor(&store);
        assert!(matches!(
            next.recover().await.unwrap(),
            RecoveryOutcome::Recovered { loop_id, .. } if loop_id == replacement
        ));
    }

    #[tokio::test]
    async fn test_paused_record_resumes_without_counting() {
        let store = store();
        let sup = supervisor(&store);
        sup.start().await.unwrap();
        sup.stop().await.unwrap();
        let paused = store
            .get_loop_state(sup.state().await.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paused.status, LoopStatus::Paused);

        let next = supervisor(&store);
        let outcome = next.start().await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Recovered { loop_id, .. } if loop_id == paused.id));
        assert_eq!(next.state().await.recovery_attempts, 0);
        next.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_resumes_in_progress_task_without_engine() {
        let store = store();
        let now = Utc::now();
        let task = TaskRecord {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            session_id: Some("s1".into()),
            goal: "deploy".into(),
            status: TaskStatus::WaitingConfirmation,
            plan: vec!["deploy".into()],
            iterations: 1,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        store.save_task(&task).await.unwrap();

        let mut state = LoopState::new("alice", "s1");
        state.status = LoopStatus::Running;
        state.current_task_id = Some(task.id);
        state.last_heartbeat = now - chrono::Duration::seconds(300);
        store.upsert_loop_state(&state).await.unwrap();

        let sup = supervisor(&store);
        let outcome = sup.recover().await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::Recovered {
                loop_id: state.id,
                resumed_task: Some(task.id)
            }
        );

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Executing);
        let events = store.list_task_events(task.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "resumed");
    }

    #[tokio::test]
    async fn test_submit_and_drive_syncs_state() {
        let store = store();
        let engine = Arc::new(
            AgentEngine::new(
                AgentConfig::default(),
                Arc::new(MockBridge::new()),
                Arc::new(ScriptedLlm::new([
                    r#"{"steps": ["finish"]}"#,
                    r#"{"complete": true, "answer": "done"}"#,
                ])),
                Arc::new(ConfirmationManager::default()),
            )
            .with_store(Arc::clone(&store)),
        );
        let sup = supervisor(&store).with_engine(engine);

        assert!(matches!(sup.drive().await, Err(SupervisorError::NoTask)));
        sup.start().await.unwrap();
        let task_id = sup.submit("no-op").await.unwrap();
        assert_eq!(sup.drive().await.unwrap(), TaskStatus::Completed);

        let state = sup.state().await;
        assert_eq!(state.current_task_id, Some(task_id));
        assert_eq!(state.current_phase, Some(StepKind::Think));
        assert!(state.memory.summary().starts_with("Completed"));

        let stored = store.get_loop_state(state.id).await.unwrap().unwrap();
        assert_eq!(stored.current_task_id, Some(task_id));
        assert_eq!(
            store.get_task(task_id).await.unwrap().unwrap().session_id.as_deref(),
            Some("s1")
        );
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_without_engine() {
        let store = store();
        assert!(matches!(
            supervisor(&store).submit("x").await,
            Err(SupervisorError::NoEngine)
        ));
    }
}
