//! Error types for ironloop.

use std::time::Duration;

use uuid::Uuid;

use crate::agent::TaskStatus;
use crate::bridge::BridgeError;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Loop {id} was claimed by another supervisor")]
    Superseded { id: Uuid },
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(err.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::Serialization(err.to_string())
    }
}

/// Inference service errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} authentication failed")]
    AuthFailed { provider: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },
}

/// Agent task engine errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Task {id} is {status}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: TaskStatus,
        expected: TaskStatus,
    },

    #[error("Task {0} has no parked action")]
    NothingParked(Uuid),
}

/// Persistent loop supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Session {session_id} of user {user_id} is owned by live loop {loop_id}")]
    SessionOwned {
        user_id: String,
        session_id: String,
        loop_id: Uuid,
    },

    #[error("Supervisor is already running")]
    AlreadyRunning,

    #[error("No agent engine attached")]
    NoEngine,

    #[error("No task submitted")]
    NoTask,

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

pub type Result<T> = std::result::Result<T, Error>;
