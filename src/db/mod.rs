//! Persistence for loop state and task records.
//!
//! [`Database`] is the seam the supervisor and engine write through.
//! [`InMemoryDatabase`] backs tests and single-process runs; [`PgStore`]
//! backs deployments.

mod memory;
mod postgres;

pub use memory::InMemoryDatabase;
pub use postgres::PgStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{LoopState, LoopStatus, TaskRecord, TaskStatus};
use crate::config::DatabaseConfig;
use crate::error::DatabaseError;

/// A durable task event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEventRecord {
    pub id: i64,
    pub task_id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Database abstraction layer.
///
/// Every operation is atomic per record.
#[async_trait]
pub trait Database: Send + Sync {
    // --- Loop state ---

    /// Insert or replace a loop record by id.
    async fn upsert_loop_state(&self, state: &LoopState) -> Result<(), DatabaseError>;

    async fn get_loop_state(&self, id: Uuid) -> Result<Option<LoopState>, DatabaseError>;

    /// Most recently updated running, recovering or paused record for a
    /// (user, session) pair.
    async fn find_active_loop(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<LoopState>, DatabaseError>;

    /// Take ownership of an abandoned loop record.
    ///
    /// Succeeds for a paused record, or for a running/recovering record whose
    /// heartbeat is older than `stale_before`. On success the record becomes
    /// `recovering` with its heartbeat set to `now`; the recovery counter is
    /// incremented unless the record was paused. Returns `None` when the
    /// record is missing or still owned.
    async fn claim_stale_loop(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LoopState>, DatabaseError>;

    async fn update_heartbeat(
        &self,
        id: Uuid,
        status: LoopStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn update_loop_status(&self, id: Uuid, status: LoopStatus) -> Result<(), DatabaseError>;

    // --- Tasks ---

    /// Insert or replace a task record by id.
    async fn save_task(&self, task: &TaskRecord) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), DatabaseError>;

    /// Persist a task event (plan, action, completion, ...).
    async fn save_task_event(
        &self,
        task_id: Uuid,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Events for a task, oldest first.
    async fn list_task_events(&self, task_id: Uuid) -> Result<Vec<TaskEventRecord>, DatabaseError>;
}

/// Open the configured store: PostgreSQL when a URL is set, otherwise
/// in-memory.
pub async fn connect(config: Option<&DatabaseConfig>) -> Result<Arc<dyn Database>, DatabaseError> {
    match config {
        Some(config) => {
            let store = PgStore::new(config).await?;
            store.run_migrations().await?;
            tracing::info!("Using PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory store");
            Ok(Arc::new(InMemoryDatabase::new()))
        }
    }
}
