//! In-process store, used when no database is configured and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agent::{LoopState, LoopStatus, TaskRecord, TaskStatus};
use crate::db::{Database, TaskEventRecord};
use crate::error::DatabaseError;

/// Map-backed [`Database`]. Each record sits behind the map's lock, so every
/// operation is atomic per record.
#[derive(Default)]
pub struct InMemoryDatabase {
    loops: RwLock<HashMap<Uuid, LoopState>>,
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
    events: RwLock<Vec<TaskEventRecord>>,
    next_event_id: AtomicI64,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn upsert_loop_state(&self, state: &LoopState) -> Result<(), DatabaseError> {
        let mut loops = self.loops.write().await;
        loops.insert(state.id, state.clone());
        Ok(())
    }

    async fn get_loop_state(&self, id: Uuid) -> Result<Option<LoopState>, DatabaseError> {
        Ok(self.loops.read().await.get(&id).cloned())
    }

    async fn find_active_loop(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<LoopState>, DatabaseError> {
        let loops = self.loops.read().await;
        Ok(loops
            .values()
            .filter(|s| {
                s.user_id == user_id && s.session_id == session_id && s.status.is_resumable()
            })
            .max_by_key(|s| s.updated_at)
            .cloned())
    }

    async fn claim_stale_loop(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LoopState>, DatabaseError> {
        let mut loops = self.loops.write().await;
        let Some(state) = loops.get_mut(&id) else {
            return Ok(None);
        };

        let claimable = match state.status {
            LoopStatus::Paused => true,
            LoopStatus::Running | LoopStatus::Recovering => state.last_heartbeat < stale_before,
            LoopStatus::Idle | LoopStatus::Crashed => false,
        };
        if !claimable {
            return Ok(None);
        }

        if state.status != LoopStatus::Paused {
            state.recovery_attempts += 1;
        }
        state.status = LoopStatus::Recovering;
        state.last_heartbeat = now;
        state.updated_at = now;
        Ok(Some(state.clone()))
    }

    async fn update_heartbeat(
        &self,
        id: Uuid,
        status: LoopStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut loops = self.loops.write().await;
        let state = loops
            .get_mut(&id)
            .ok_or(DatabaseError::NotFound { entity: "loop", id })?;
        state.status = status;
        state.last_heartbeat = at;
        state.updated_at = at;
        Ok(())
    }

    async fn update_loop_status(&self, id: Uuid, status: LoopStatus) -> Result<(), DatabaseError> {
        let mut loops = self.loops.write().await;
        let state = loops
            .get_mut(&id)
            .ok_or(DatabaseError::NotFound { entity: "loop", id })?;
        state.status = status;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or(DatabaseError::NotFound { entity: "task", id })?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn save_task_event(
        &self,
        task_id: Uuid,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.write().await.push(TaskEventRecord {
            id,
            task_id,
            event_type: event_type.to_string(),
            data: data.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_task_events(&self, task_id: Uuid) -> Result<Vec<TaskEventRecord>, DatabaseError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn running(age_secs: i64) -> LoopState {
        let mut state = LoopState::new("alice", "s1");
        state.status = LoopStatus::Running;
        state.last_heartbeat = Utc::now() - chrono::Duration::seconds(age_secs);
        state
    }

    #[tokio::test]
    async fn test_claim_requires_stale_heartbeat() {
        let db = InMemoryDatabase::new();
        let state = running(10);
        db.upsert_loop_state(&state).await.unwrap();

        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(60);
        assert!(db.claim_stale_loop(state.id, cutoff, now).await.unwrap().is_none());

        let stale = running(120);
        db.upsert_loop_state(&stale).await.unwrap();
        let claimed = db.claim_stale_loop(stale.id, cutoff, now).await.unwrap().unwrap();
        assert_eq!(claimed.status, LoopStatus::Recovering);
        assert_eq!(claimed.recovery_attempts, 1);
        assert_eq!(claimed.last_heartbeat, now);

        // The claim refreshed the heartbeat, so a racing claimant loses.
        assert!(db.claim_stale_loop(stale.id, cutoff, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_active_loop_ignores_crashed_and_other_sessions() {
        let db = InMemoryDatabase::new();
        let mut crashed = running(0);
        crashed.status = LoopStatus::Crashed;
        db.upsert_loop_state(&crashed).await.unwrap();

        let mut elsewhere = running(0);
        elsewhere.session_id = "s2".into();
        db.upsert_loop_state(&elsewhere).await.unwrap();
        assert!(db.find_active_loop("alice", "s1").await.unwrap().is_none());

        let live = running(0);
        db.upsert_loop_state(&live).await.unwrap();
        assert_eq!(db.find_active_loop("alice", "s1").await.unwrap().unwrap().id, live.id);
    }

    #[tokio::test]
    async fn test_events_are_ordered_per_task() {
        let db = InMemoryDatabase::new();
        let task_id = Uuid::new_v4();
        db.save_task_event(task_id, "plan", &json!({"steps": []})).await.unwrap();
        db.save_task_event(Uuid::new_v4(), "plan", &json!({})).await.unwrap();
        db.save_task_event(task_id, "completed", &json!({})).await.unwrap();

        let events = db.list_task_events(task_id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["plan", "completed"]);
        assert!(events[0].id < events[1].id);
    }

    #[tokio::test]
    async fn test_update_missing_task_errors() {
        let db = InMemoryDatabase::new();
        assert!(matches!(
            db.update_task_status(Uuid::new_v4(), TaskStatus::Executing).await,
            Err(DatabaseError::NotFound { entity: "task", .. })
        ));
    }
}
