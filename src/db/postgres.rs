//! PostgreSQL store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use serde_json::Value;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::agent::{AgentMemory, LoopState, LoopStatus, StepKind, TaskRecord, TaskStatus};
use crate::config::DatabaseConfig;
use crate::db::{Database, TaskEventRecord};
use crate::error::DatabaseError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const LOOP_COLUMNS: &str = "id, user_id, session_id, status, current_task_id, current_phase, \
     step_index, context, memory, last_heartbeat, last_checkpoint, recovery_attempts, \
     created_at, updated_at";

const TASK_COLUMNS: &str =
    "id, user_id, session_id, goal, status, plan, iterations, result, error, created_at, updated_at";

/// Pooled PostgreSQL [`Database`].
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **conn)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        for migration in report.applied_migrations() {
            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Applied migration"
            );
        }
        Ok(())
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl Database for PgStore {
    async fn upsert_loop_state(&self, state: &LoopState) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let context = serde_json::to_value(&state.context)?;
        let memory = serde_json::to_value(&state.memory)?;
        let phase = state.current_phase.map(|p| p.to_string());

        conn.execute(
            r#"
            INSERT INTO agent_loops (
                id, user_id, session_id, status, current_task_id, current_phase,
                step_index, context, memory, last_heartbeat, last_checkpoint,
                recovery_attempts, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                current_task_id = EXCLUDED.current_task_id,
                current_phase = EXCLUDED.current_phase,
                step_index = EXCLUDED.step_index,
                context = EXCLUDED.context,
                memory = EXCLUDED.memory,
                last_heartbeat = EXCLUDED.last_heartbeat,
                last_checkpoint = EXCLUDED.last_checkpoint,
                recovery_attempts = EXCLUDED.recovery_attempts,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &state.id,
                &state.user_id,
                &state.session_id,
                &state.status.as_str(),
                &state.current_task_id,
                &phase,
                &(state.step_index as i64),
                &context,
                &memory,
                &state.last_heartbeat,
                &state.last_checkpoint,
                &(state.recovery_attempts as i32),
                &state.created_at,
                &state.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_loop_state(&self, id: Uuid) -> Result<Option<LoopState>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {LOOP_COLUMNS} FROM agent_loops WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.map(|r| row_to_loop(&r)).transpose()
    }

    async fn find_active_loop(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<LoopState>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {LOOP_COLUMNS} FROM agent_loops \
                     WHERE user_id = $1 AND session_id = $2 \
                       AND status IN ('running', 'recovering', 'paused') \
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                &[&user_id, &session_id],
            )
            .await?;
        row.map(|r| row_to_loop(&r)).transpose()
    }

    async fn claim_stale_loop(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LoopState>, DatabaseError> {
        let conn = self.conn().await?;
        // Single conditional UPDATE, so two claimants cannot both win.
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE agent_loops SET \
                         recovery_attempts = recovery_attempts + \
                             CASE WHEN status = 'paused' THEN 0 ELSE 1 END, \
                         status = 'recovering', \
                         last_heartbeat = $3, \
                         updated_at = $3 \
                     WHERE id = $1 \
                       AND (status = 'paused' \
                            OR (status IN ('running', 'recovering') AND last_heartbeat < $2)) \
                     RETURNING {LOOP_COLUMNS}"
                ),
                &[&id, &stale_before, &now],
            )
            .await?;
        row.map(|r| row_to_loop(&r)).transpose()
    }

    async fn update_heartbeat(
        &self,
        id: Uuid,
        status: LoopStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE agent_loops SET status = $2, last_heartbeat = $3, updated_at = $3 WHERE id = $1",
                &[&id, &status.as_str(), &at],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound { entity: "loop", id });
        }
        Ok(())
    }

    async fn update_loop_status(&self, id: Uuid, status: LoopStatus) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE agent_loops SET status = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &status.as_str()],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound { entity: "loop", id });
        }
        Ok(())
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let plan = serde_json::to_value(&task.plan)?;

        conn.execute(
            r#"
            INSERT INTO agent_tasks (
                id, user_id, session_id, goal, status, plan, iterations,
                result, error, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                session_id = EXCLUDED.session_id,
                status = EXCLUDED.status,
                plan = EXCLUDED.plan,
                iterations = EXCLUDED.iterations,
                result = EXCLUDED.result,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            "#,
            &[
                &task.id,
                &task.user_id,
                &task.session_id,
                &task.goal,
                &task.status.as_str(),
                &plan,
                &(task.iterations as i32),
                &task.result,
                &task.error,
                &task.created_at,
                &task.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {TASK_COLUMNS} FROM agent_tasks WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE agent_tasks SET status = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &status.as_str()],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound { entity: "task", id });
        }
        Ok(())
    }

    async fn save_task_event(
        &self,
        task_id: Uuid,
        event_type: &str,
        data: &Value,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO task_events (task_id, event_type, data) VALUES ($1, $2, $3)",
            &[&task_id, &event_type, data],
        )
        .await?;
        Ok(())
    }

    async fn list_task_events(&self, task_id: Uuid) -> Result<Vec<TaskEventRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, task_id, event_type, data, created_at FROM task_events \
                 WHERE task_id = $1 ORDER BY id ASC",
                &[&task_id],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| TaskEventRecord {
                id: row.get("id"),
                task_id: row.get("task_id"),
                event_type: row.get("event_type"),
                data: row.get("data"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

fn row_to_loop(row: &Row) -> Result<LoopState, DatabaseError> {
    let status: String = row.get("status");
    let phase: Option<String> = row.get("current_phase");
    let context: Value = row.get("context");
    let memory: Value = row.get("memory");
    let step_index: i64 = row.get("step_index");
    let recovery_attempts: i32 = row.get("recovery_attempts");

    Ok(LoopState {
        id: row.get("id"),
        user_id: row.get("user_id"),
        session_id: row.get("session_id"),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        current_task_id: row.get("current_task_id"),
        current_phase: phase.map(parse_phase).transpose()?,
        step_index: step_index.max(0) as usize,
        context: serde_json::from_value::<HashMap<String, Value>>(context)?,
        memory: serde_json::from_value::<AgentMemory>(memory)?,
        last_heartbeat: row.get("last_heartbeat"),
        last_checkpoint: row.get("last_checkpoint"),
        recovery_attempts: recovery_attempts.max(0) as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_task(row: &Row) -> Result<TaskRecord, DatabaseError> {
    let status: String = row.get("status");
    let plan: Value = row.get("plan");
    let iterations: i32 = row.get("iterations");

    Ok(TaskRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        session_id: row.get("session_id"),
        goal: row.get("goal"),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        plan: serde_json::from_value(plan)?,
        iterations: iterations.max(0) as u32,
        result: row.get("result"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_phase(phase: String) -> Result<StepKind, DatabaseError> {
    Ok(serde_json::from_value(Value::String(phase))?)
}
