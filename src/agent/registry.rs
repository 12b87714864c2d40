//! Registry of live loop supervisors, one per (user, session).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::agent::engine::AgentEngine;
use crate::agent::supervisor::{LoopSupervisor, SupervisorConfig};
use crate::db::Database;
use crate::error::SupervisorError;

/// Key for a supervised loop.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct SessionKey {
    user_id: String,
    session_id: String,
}

impl SessionKey {
    fn new(user_id: &str, session_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

/// Starts, tracks and stops supervisors for all users.
pub struct SupervisorRegistry {
    config: SupervisorConfig,
    store: Arc<dyn Database>,
    engine: Option<Arc<AgentEngine>>,
    supervisors: RwLock<HashMap<SessionKey, Arc<LoopSupervisor>>>,
}

impl SupervisorRegistry {
    pub fn new(config: SupervisorConfig, store: Arc<dyn Database>) -> Self {
        Self {
            config,
            store,
            engine: None,
            supervisors: RwLock::new(HashMap::new()),
        }
    }

    /// Engine shared by every supervisor started from here.
    pub fn with_engine(mut self, engine: Arc<AgentEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Return the live supervisor for (user, session), starting one if
    /// needed.
    pub async fn get_or_start(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Arc<LoopSupervisor>, SupervisorError> {
        let key = SessionKey::new(user_id, session_id);

        // Fast path
        {
            let supervisors = self.supervisors.read().await;
            if let Some(supervisor) = supervisors.get(&key) {
                return Ok(Arc::clone(supervisor));
            }
        }

        let mut supervisors = self.supervisors.write().await;
        // Double-check after acquiring write lock
        if let Some(supervisor) = supervisors.get(&key) {
            return Ok(Arc::clone(supervisor));
        }

        let mut supervisor =
            LoopSupervisor::new(self.config.clone(), user_id, session_id, Arc::clone(&self.store));
        if let Some(engine) = &self.engine {
            supervisor = supervisor.with_engine(Arc::clone(engine));
        }
        supervisor.start().await?;

        let supervisor = Arc::new(supervisor);
        supervisors.insert(key, Arc::clone(&supervisor));
        Ok(supervisor)
    }

    pub async fn get(&self, user_id: &str, session_id: &str) -> Option<Arc<LoopSupervisor>> {
        let supervisors = self.supervisors.read().await;
        supervisors
            .get(&SessionKey::new(user_id, session_id))
            .cloned()
    }

    /// Stop and forget one supervisor. Returns false if none was live.
    pub async fn stop(&self, user_id: &str, session_id: &str) -> Result<bool, SupervisorError> {
        let removed = self
            .supervisors
            .write()
            .await
            .remove(&SessionKey::new(user_id, session_id));

        match removed {
            Some(supervisor) => {
                supervisor.stop().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop every supervisor. Failures are logged.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<_> = self.supervisors.write().await.drain().collect();
        let count = drained.len();

        for (key, supervisor) in drained {
            if let Err(e) = supervisor.stop().await {
                tracing::warn!(
                    user_id = %key.user_id,
                    session_id = %key.session_id,
                    "Failed to stop supervisor: {}",
                    e
                );
            }
        }

        if count > 0 {
            tracing::info!("Stopped {} supervisor(s)", count);
        }
        count
    }

    pub async fn active_count(&self) -> usize {
        self.supervisors.read().await.len()
    }
}
