//! Agent task engine: the plan / think / act / observe loop.
//!
//! Each task runs strictly sequentially: one runner at a time holds the
//! task's run lock, and every mutation goes through [`TaskEvent`]s. Risky
//! actions are gated. With a [`ConfirmationCallback`] the decision is awaited
//! inline; without one the task parks in `waiting_confirmation` until
//! [`AgentEngine::resolve_confirmation`] is called.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::agent::memory::AgentMemory;
use crate::agent::task::{
    ActionRecord, AgentStep, AgentTask, ParkedAction, StepKind, StepStatus, TaskEvent,
    TaskRecord, TaskStatus, ToolTarget,
};
use crate::bridge::{AvailableTool, ToolBridge, collect_tools};
use crate::db::Database;
use crate::error::AgentError;
use crate::llm::{LlmProvider, Reasoning, ThinkContext, ThinkDecision, ToolIntent};
use crate::safety::{ConfirmationManager, ConfirmationTicket, RiskGate};

/// Configuration for the agent engine.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Think/act/observe ceiling for a normal task.
    pub max_iterations: u32,
    /// Ceiling for [`AgentEngine::quick`].
    pub quick_max_iterations: u32,
    /// How many recent actions each think call sees.
    pub action_window: usize,
    /// How many recent observations each think call sees.
    pub observation_window: usize,
    /// Buffer size of the progress broadcast channel.
    pub event_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            quick_max_iterations: 5,
            action_window: 5,
            observation_window: 5,
            event_capacity: 256,
        }
    }
}

/// Synchronous confirmation, e.g. an interactive prompt.
#[async_trait]
pub trait ConfirmationCallback: Send + Sync {
    /// Return true to approve the ticket's action.
    async fn confirm(&self, ticket: &ConfirmationTicket) -> bool;
}

/// Outcome of [`AgentEngine::quick`].
#[derive(Debug, Clone, PartialEq)]
pub struct QuickResult {
    pub task_id: Uuid,
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
}

enum Verdict {
    Approved,
    Declined,
    Expired,
}

struct TaskSlot {
    state: RwLock<AgentTask>,
    run_lock: Mutex<()>,
    session_id: Option<String>,
}

/// Runs agent tasks.
pub struct AgentEngine {
    config: AgentConfig,
    bridge: Arc<dyn ToolBridge>,
    reasoning: Reasoning,
    gate: RiskGate,
    confirmations: Arc<ConfirmationManager>,
    callback: Option<Arc<dyn ConfirmationCallback>>,
    store: Option<Arc<dyn Database>>,
    tasks: RwLock<HashMap<Uuid, Arc<TaskSlot>>>,
    events: broadcast::Sender<(Uuid, TaskEvent)>,
}

impl AgentEngine {
    pub fn new(
        config: AgentConfig,
        bridge: Arc<dyn ToolBridge>,
        llm: Arc<dyn LlmProvider>,
        confirmations: Arc<ConfirmationManager>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            bridge,
            reasoning: Reasoning::new(llm),
            gate: RiskGate::new(),
            confirmations,
            callback: None,
            store: None,
            tasks: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Decide confirmations inline instead of parking.
    pub fn with_callback(mut self, callback: Arc<dyn ConfirmationCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Persist task records and events.
    pub fn with_store(mut self, store: Arc<dyn Database>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn confirmations(&self) -> &Arc<ConfirmationManager> {
        &self.confirmations
    }

    /// Create a task for a goal. Available tools are fetched once, here.
    pub async fn create_task(&self, user_id: &str, goal: &str) -> Uuid {
        self.create_with(user_id, None, goal, self.config.max_iterations)
            .await
    }

    /// Create a task owned by a loop session.
    pub async fn create_session_task(&self, user_id: &str, session_id: &str, goal: &str) -> Uuid {
        self.create_with(user_id, Some(session_id), goal, self.config.max_iterations)
            .await
    }

    async fn create_with(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        goal: &str,
        max_iterations: u32,
    ) -> Uuid {
        let mut task = AgentTask::new(user_id, goal, max_iterations);
        task.tools = self.discover_tools().await;
        let task_id = task.id;

        tracing::info!(
            task_id = %task_id,
            user_id = %user_id,
            tools = task.tools.len(),
            "Created agent task"
        );

        let record = task.to_record(session_id);
        self.insert(task, session_id).await;
        self.persist_record(&record).await;
        task_id
    }

    /// Rebuild a live task from its durable record after a restart.
    ///
    /// A task that was parked comes back as `executing`: its ticket did not
    /// survive, so the next think re-proposes the action and it is gated
    /// again.
    pub async fn restore(
        &self,
        record: &TaskRecord,
        context: HashMap<String, Value>,
        memory: AgentMemory,
    ) -> Result<Uuid, AgentError> {
        if record.status.is_terminal() {
            return Err(AgentError::InvalidState {
                id: record.id,
                status: record.status,
                expected: TaskStatus::Executing,
            });
        }
        if self.tasks.read().await.contains_key(&record.id) {
            return Ok(record.id);
        }

        let mut task = AgentTask::new(&record.user_id, &record.goal, self.config.max_iterations);
        task.id = record.id;
        task.status = record.status;
        task.plan = record.plan.clone();
        task.iterations = record.iterations;
        task.created_at = record.created_at;
        task.context = context;
        task.observations = memory.recent().map(|e| e.summary.clone()).collect();
        task.memory = memory;
        task.tools = self.discover_tools().await;

        let slot = self.insert(task, record.session_id.as_deref()).await;
        self.emit(
            &slot,
            TaskEvent::Resumed {
                from: record.status,
            },
        )
        .await;

        tracing::info!(
            task_id = %record.id,
            from = %record.status,
            "Resumed interrupted task"
        );
        Ok(record.id)
    }

    /// Drive a task until it completes, fails, or parks for confirmation.
    pub async fn run(&self, task_id: Uuid) -> Result<TaskStatus, AgentError> {
        let slot = self.slot(task_id).await?;
        let _running = slot.run_lock.lock().await;

        let status = slot.state.read().await.status;
        match status {
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::WaitingConfirmation => {
                return Ok(status);
            }
            TaskStatus::Pending | TaskStatus::Planning => self.plan(&slot).await,
            TaskStatus::Executing => {}
        }

        self.execute(&slot).await
    }

    /// Approve or reject the parked action of a waiting task.
    ///
    /// An approved action runs before this returns and the task goes back to
    /// `executing`; call [`run`](Self::run) to continue. A rejected or
    /// expired ticket skips the action.
    pub async fn resolve_confirmation(
        &self,
        task_id: Uuid,
        ticket_id: Uuid,
        approved: bool,
        reason: Option<String>,
    ) -> Result<TaskStatus, AgentError> {
        let slot = self.slot(task_id).await?;
        let _running = slot.run_lock.lock().await;

        let parked = {
            let task = slot.state.read().await;
            if task.status != TaskStatus::WaitingConfirmation {
                return Err(AgentError::InvalidState {
                    id: task_id,
                    status: task.status,
                    expected: TaskStatus::WaitingConfirmation,
                });
            }
            match &task.parked {
                Some(parked) if parked.ticket_id == ticket_id => parked.clone(),
                _ => return Err(AgentError::NothingParked(task_id)),
            }
        };

        let verdict = match self
            .confirmations
            .resolve(ticket_id, approved, reason)
            .await
        {
            Some(resolution) if resolution.approved => Verdict::Approved,
            Some(_) => Verdict::Declined,
            None => Verdict::Expired,
        };

        self.emit(
            &slot,
            TaskEvent::StatusChanged {
                from: TaskStatus::WaitingConfirmation,
                to: TaskStatus::Executing,
            },
        )
        .await;
        self.finish_confirmation(
            &slot,
            ticket_id,
            verdict,
            parked.action_step_id,
            parked.confirm_step_id,
            &parked.target,
        )
        .await;

        Ok(slot.state.read().await.status)
    }

    /// Force a task to `failed`.
    ///
    /// Cooperative: a running loop stops at its next check, and the result
    /// of an in-flight tool call is discarded.
    pub async fn cancel(&self, task_id: Uuid) -> Result<TaskStatus, AgentError> {
        let slot = self.slot(task_id).await?;
        let (status, parked) = {
            let task = slot.state.read().await;
            (task.status, task.parked.clone())
        };
        if status.is_terminal() {
            return Ok(status);
        }

        if let Some(parked) = parked {
            self.confirmations
                .resolve(parked.ticket_id, false, Some("task cancelled".to_string()))
                .await;
        }

        self.emit(
            &slot,
            TaskEvent::Failed {
                error: "Cancelled".to_string(),
            },
        )
        .await;
        tracing::info!(task_id = %task_id, "Task cancelled");
        Ok(TaskStatus::Failed)
    }

    /// Run a goal to the end with a small iteration ceiling.
    pub async fn quick(&self, user_id: &str, goal: &str) -> QuickResult {
        let task_id = self
            .create_with(user_id, None, goal, self.config.quick_max_iterations)
            .await;

        let outcome = self.run(task_id).await;
        let task = self.snapshot(task_id).await;

        let result = match (outcome, task) {
            (Ok(TaskStatus::Completed), Some(task)) => QuickResult {
                task_id,
                success: true,
                result: task.result,
                error: None,
            },
            (Ok(TaskStatus::WaitingConfirmation), Some(task)) => QuickResult {
                task_id,
                success: false,
                result: None,
                error: Some(match task.parked {
                    Some(p) => format!("Waiting for confirmation of ticket {}", p.ticket_id),
                    None => "Waiting for confirmation".to_string(),
                }),
            },
            (Ok(status), task) => QuickResult {
                task_id,
                success: false,
                result: None,
                error: task
                    .and_then(|t| t.error)
                    .or_else(|| Some(format!("Task ended {status}"))),
            },
            (Err(e), _) => QuickResult {
                task_id,
                success: false,
                result: None,
                error: Some(e.to_string()),
            },
        };

        if self
            .snapshot(task_id)
            .await
            .is_some_and(|t| t.status.is_terminal())
        {
            self.remove(task_id).await;
        }
        result
    }

    /// An immutable copy of a task.
    pub async fn snapshot(&self, task_id: Uuid) -> Option<AgentTask> {
        let slot = self.tasks.read().await.get(&task_id).cloned()?;
        let task = slot.state.read().await;
        Some(task.clone())
    }

    /// Progress events for all tasks. Slow consumers miss events rather than
    /// stall the engine.
    pub fn subscribe(&self) -> impl Stream<Item = (Uuid, TaskEvent)> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|item| item.ok())
    }

    /// Forget a task, returning its final state.
    pub async fn remove(&self, task_id: Uuid) -> Option<AgentTask> {
        let slot = self.tasks.write().await.remove(&task_id)?;
        let task = slot.state.read().await;
        Some(task.clone())
    }

    async fn plan(&self, slot: &TaskSlot) {
        let (task_id, goal, tools, from) = {
            let task = slot.state.read().await;
            (task.id, task.goal.clone(), task.tools.clone(), task.status)
        };

        if from != TaskStatus::Planning {
            self.emit(
                slot,
                TaskEvent::StatusChanged {
                    from,
                    to: TaskStatus::Planning,
                },
            )
            .await;
        }

        let step = AgentStep::new(
            StepKind::Plan,
            json!({ "goal": goal, "tools": tool_names(&tools) }),
        );
        let step_id = step.id;
        self.emit(slot, TaskEvent::StepStarted { step }).await;

        let (steps, fallback) = match self.reasoning.plan(&goal, &tools).await {
            Ok(steps) => (steps, false),
            Err(e) => {
                tracing::warn!(task_id = %task_id, "Planning failed, using generic plan: {}", e);
                (vec![format!("Work toward the goal: {}", goal)], true)
            }
        };

        self.emit(
            slot,
            TaskEvent::PlanRecorded {
                steps: steps.clone(),
            },
        )
        .await;
        self.emit(
            slot,
            TaskEvent::StepFinished {
                step_id,
                status: StepStatus::Completed,
                output: Some(json!({ "steps": steps, "fallback": fallback })),
            },
        )
        .await;
        self.emit(
            slot,
            TaskEvent::StatusChanged {
                from: TaskStatus::Planning,
                to: TaskStatus::Executing,
            },
        )
        .await;
    }

    async fn execute(&self, slot: &TaskSlot) -> Result<TaskStatus, AgentError> {
        loop {
            let (task_id, status, iterations, max_iterations) = {
                let task = slot.state.read().await;
                (task.id, task.status, task.iterations, task.max_iterations)
            };

            if status != TaskStatus::Executing {
                return Ok(status);
            }

            if iterations >= max_iterations {
                let error = format!(
                    "Reached the iteration limit ({}) without completing the goal",
                    max_iterations
                );
                tracing::warn!(task_id = %task_id, "{}", error);
                self.emit(slot, TaskEvent::Failed { error }).await;
                continue;
            }

            self.emit(
                slot,
                TaskEvent::IterationStarted {
                    iteration: iterations + 1,
                },
            )
            .await;

            match self.think(slot).await {
                ThinkDecision::Complete { answer, .. } => {
                    tracing::info!(task_id = %task_id, "Task completed");
                    self.emit(slot, TaskEvent::Completed { result: answer })
                        .await;
                }
                ThinkDecision::Idle { reasoning } => {
                    self.observe(slot, format!("No action taken: {}", reasoning))
                        .await;
                }
                ThinkDecision::Act(intent) => self.act(slot, intent).await,
            }
        }
    }

    async fn think(&self, slot: &TaskSlot) -> ThinkDecision {
        let task = slot.state.read().await.clone();

        let step = AgentStep::new(StepKind::Think, json!({ "iteration": task.iterations }));
        let step_id = step.id;
        self.emit(slot, TaskEvent::StepStarted { step }).await;

        let ctx = ThinkContext {
            goal: &task.goal,
            plan: &task.plan,
            tools: &task.tools,
            actions: tail(&task.actions, self.config.action_window),
            observations: tail(&task.observations, self.config.observation_window),
            iteration: task.iterations,
            max_iterations: task.max_iterations,
        };

        let (decision, status) = match self.reasoning.think(&ctx).await {
            Ok(decision) => (decision, StepStatus::Completed),
            Err(e) => {
                tracing::warn!(task_id = %task.id, "Think failed: {}", e);
                (
                    ThinkDecision::Idle {
                        reasoning: format!("Inference failed: {}", e),
                    },
                    StepStatus::Failed,
                )
            }
        };

        self.emit(
            slot,
            TaskEvent::StepFinished {
                step_id,
                status,
                output: Some(describe_decision(&decision)),
            },
        )
        .await;
        decision
    }

    async fn act(&self, slot: &TaskSlot, intent: ToolIntent) {
        let assessment = self.gate.evaluate(&intent.tool_name, &intent.arguments);
        let requires_confirmation = assessment.requires_confirmation();
        let target = ToolTarget {
            server_id: intent.server_id,
            tool_name: intent.tool_name,
            arguments: intent.arguments,
            assessment,
        };

        let action = AgentStep::new(StepKind::Action, json!({ "reasoning": intent.reasoning }))
            .with_target(target.clone());
        let action_step_id = action.id;
        self.emit(slot, TaskEvent::StepStarted { step: action }).await;

        if !requires_confirmation {
            self.dispatch(slot, action_step_id, &target).await;
            return;
        }

        let (task_id, user_id) = {
            let task = slot.state.read().await;
            (task.id, task.user_id.clone())
        };
        let ticket = self
            .confirmations
            .create(
                &user_id,
                &target.tool_name,
                &target.server_id,
                target.arguments.clone(),
            )
            .await;

        let confirm = AgentStep::new(
            StepKind::Confirm,
            json!({
                "ticket_id": ticket.id,
                "level": ticket.risk_level,
                "warnings": ticket.warnings,
            }),
        )
        .with_target(target.clone());
        let confirm_step_id = confirm.id;
        self.emit(slot, TaskEvent::StepStarted { step: confirm }).await;

        let Some(callback) = &self.callback else {
            tracing::info!(
                task_id = %task_id,
                ticket_id = %ticket.id,
                tool = %target.tool_name,
                level = %ticket.risk_level,
                "Action parked awaiting confirmation"
            );
            self.emit(
                slot,
                TaskEvent::ConfirmationRequested {
                    parked: ParkedAction {
                        ticket_id: ticket.id,
                        action_step_id,
                        confirm_step_id,
                        target,
                    },
                },
            )
            .await;
            self.emit(
                slot,
                TaskEvent::StatusChanged {
                    from: TaskStatus::Executing,
                    to: TaskStatus::WaitingConfirmation,
                },
            )
            .await;
            return;
        };

        let approved = callback.confirm(&ticket).await;
        if slot.state.read().await.status.is_terminal() {
            self.confirmations
                .resolve(
                    ticket.id,
                    false,
                    Some("task finished during confirmation".to_string()),
                )
                .await;
            tracing::info!(
                task_id = %task_id,
                ticket_id = %ticket.id,
                tool = %target.tool_name,
                "Task ended while awaiting confirmation, action not run"
            );
            return;
        }

        let verdict = match self
            .confirmations
            .resolve(ticket.id, approved, Some("confirmation callback".to_string()))
            .await
        {
            Some(resolution) if resolution.approved => Verdict::Approved,
            Some(_) => Verdict::Declined,
            None => Verdict::Expired,
        };

        self.finish_confirmation(
            slot,
            ticket.id,
            verdict,
            action_step_id,
            confirm_step_id,
            &target,
        )
        .await;
    }

    async fn finish_confirmation(
        &self,
        slot: &TaskSlot,
        ticket_id: Uuid,
        verdict: Verdict,
        action_step_id: Uuid,
        confirm_step_id: Uuid,
        target: &ToolTarget,
    ) {
        let (approved, label) = match verdict {
            Verdict::Approved => (true, "approved"),
            Verdict::Declined => (false, "declined"),
            Verdict::Expired => (false, "expired"),
        };

        self.emit(
            slot,
            TaskEvent::ConfirmationResolved {
                ticket_id,
                approved,
            },
        )
        .await;
        self.emit(
            slot,
            TaskEvent::StepFinished {
                step_id: confirm_step_id,
                status: StepStatus::Completed,
                output: Some(json!({ "verdict": label })),
            },
        )
        .await;

        let observation = match verdict {
            Verdict::Approved => {
                self.dispatch(slot, action_step_id, target).await;
                return;
            }
            Verdict::Declined => format!(
                "User declined {} on {}; it was not run",
                target.tool_name, target.server_id
            ),
            Verdict::Expired => format!(
                "Confirmation for {} on {} expired before a decision; it was not run",
                target.tool_name, target.server_id
            ),
        };

        self.emit(
            slot,
            TaskEvent::StepFinished {
                step_id: action_step_id,
                status: StepStatus::Skipped,
                output: None,
            },
        )
        .await;
        self.observe(slot, observation).await;
    }

    /// Run an approved action through the bridge. Never retried here.
    async fn dispatch(&self, slot: &TaskSlot, step_id: Uuid, target: &ToolTarget) {
        let started = Instant::now();
        let outcome = self
            .bridge
            .call_tool(&target.server_id, &target.tool_name, target.arguments.clone())
            .await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let task_id = {
            let task = slot.state.read().await;
            if task.status.is_terminal() {
                tracing::debug!(
                    task_id = %task.id,
                    tool = %target.tool_name,
                    "Discarding tool result for finished task"
                );
                return;
            }
            task.id
        };

        let mut record = ActionRecord {
            step_id,
            server_id: target.server_id.clone(),
            tool_name: target.tool_name.clone(),
            arguments: target.arguments.clone(),
            success: false,
            result: None,
            error: None,
            duration_ms,
            executed_at: chrono::Utc::now(),
        };

        let (status, output, observation) = match outcome {
            Ok(result) => {
                let observation = format!(
                    "{} on {} succeeded: {}",
                    target.tool_name,
                    target.server_id,
                    preview(&result)
                );
                record.success = true;
                record.result = Some(result.clone());
                (
                    StepStatus::Completed,
                    json!({ "success": true, "result": result }),
                    observation,
                )
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task_id,
                    tool = %target.tool_name,
                    timeout = e.is_timeout(),
                    "Tool call failed: {}",
                    e
                );
                let observation = format!(
                    "{} on {} failed: {}",
                    target.tool_name, target.server_id, e
                );
                record.error = Some(e.to_string());
                (
                    StepStatus::Failed,
                    json!({ "success": false, "error": e.to_string(), "timeout": e.is_timeout() }),
                    observation,
                )
            }
        };

        self.emit(
            slot,
            TaskEvent::StepFinished {
                step_id,
                status,
                output: Some(output),
            },
        )
        .await;
        self.emit(slot, TaskEvent::ActionRecorded { record }).await;
        self.observe(slot, observation).await;
    }

    async fn observe(&self, slot: &TaskSlot, text: String) {
        let step = AgentStep::new(StepKind::Observe, json!({ "text": text }));
        let step_id = step.id;
        self.emit(slot, TaskEvent::StepStarted { step }).await;
        self.emit(slot, TaskEvent::Observed { text }).await;
        self.emit(
            slot,
            TaskEvent::StepFinished {
                step_id,
                status: StepStatus::Completed,
                output: None,
            },
        )
        .await;
    }

    /// Apply, broadcast and persist one event.
    async fn emit(&self, slot: &TaskSlot, event: TaskEvent) {
        let (task_id, record) = {
            let mut task = slot.state.write().await;
            let before = task.status;
            task.apply(&event);
            let changed = task.status != before || matches!(event, TaskEvent::Resumed { .. });
            let record = changed.then(|| task.to_record(slot.session_id.as_deref()));
            (task.id, record)
        };

        // No subscribers is fine.
        let _ = self.events.send((task_id, event.clone()));

        let Some(store) = &self.store else {
            return;
        };
        if let Some(record) = record
            && let Err(e) = store.save_task(&record).await
        {
            tracing::warn!(task_id = %task_id, "Failed to persist task record: {}", e);
        }
        if event.is_durable() {
            let data = serde_json::to_value(&event).unwrap_or(Value::Null);
            if let Err(e) = store.save_task_event(task_id, event.kind(), &data).await {
                tracing::warn!(task_id = %task_id, "Failed to persist task event: {}", e);
            }
        }
    }

    async fn persist_record(&self, record: &TaskRecord) {
        if let Some(store) = &self.store
            && let Err(e) = store.save_task(record).await
        {
            tracing::warn!(task_id = %record.id, "Failed to persist task record: {}", e);
        }
    }

    async fn discover_tools(&self) -> Vec<AvailableTool> {
        match collect_tools(self.bridge.as_ref()).await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!("Tool discovery failed, continuing without tools: {}", e);
                Vec::new()
            }
        }
    }

    async fn insert(&self, task: AgentTask, session_id: Option<&str>) -> Arc<TaskSlot> {
        let task_id = task.id;
        let slot = Arc::new(TaskSlot {
            state: RwLock::new(task),
            run_lock: Mutex::new(()),
            session_id: session_id.map(str::to_string),
        });
        self.tasks.write().await.insert(task_id, Arc::clone(&slot));
        slot
    }

    async fn slot(&self, task_id: Uuid) -> Result<Arc<TaskSlot>, AgentError> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or(AgentError::TaskNotFound(task_id))
    }
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

fn tool_names(tools: &[AvailableTool]) -> Vec<String> {
    tools
        .iter()
        .map(|t| format!("{}:{}", t.server_id, t.tool.name))
        .collect()
}

fn describe_decision(decision: &ThinkDecision) -> Value {
    match decision {
        ThinkDecision::Complete { answer, reasoning } => {
            json!({ "complete": true, "answer": answer, "reasoning": reasoning })
        }
        ThinkDecision::Act(intent) => json!({
            "complete": false,
            "reasoning": intent.reasoning,
            "action": {
                "server_id": intent.server_id,
                "tool": intent.tool_name,
                "arguments": intent.arguments,
            },
        }),
        ThinkDecision::Idle { reasoning } => json!({ "complete": false, "reasoning": reasoning }),
    }
}

fn preview(value: &Value) -> String {
    const MAX: usize = 200;
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= MAX {
        text
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeError;
    use crate::db::InMemoryDatabase;
    use crate::safety::ConfirmationConfig;
    use crate::testing::{MockBridge, ScriptedLlm, StaticCallback};
    use pretty_assertions::assert_eq;
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;

    const DONE: &str = r#"{"complete": true, "answer": "all done", "reasoning": "finished"}"#;
    const PLAN: &str = r#"{"steps": ["inspect", "deploy"]}"#;

    fn act(tool: &str, args: Value) -> &'static str {
        json!({
            "complete": false,
            "reasoning": "next",
            "action": {"server_id": "srv", "tool": tool, "arguments": args}
        })
        .to_string()
        .leak()
    }

    fn engine(llm: ScriptedLlm, bridge: Arc<MockBridge>) -> AgentEngine {
        AgentEngine::new(
            AgentConfig::default(),
            bridge,
            Arc::new(llm),
            Arc::new(ConfirmationManager::default()),
        )
    }

    #[tokio::test]
    async fn test_no_tools_completes_after_one_think() {
        let bridge = Arc::new(MockBridge::new());
        let engine = engine(ScriptedLlm::new([PLAN, DONE]), Arc::clone(&bridge));

        let id = engine.create_task("alice", "no-op").await;
        let status = engine.run(id).await.unwrap();
        let task = engine.snapshot(id).await.unwrap();

        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("all done"));
        assert_eq!(task.steps_of(StepKind::Plan).count(), 1);
        assert_eq!(task.steps_of(StepKind::Think).count(), 1);
        assert_eq!(task.steps_of(StepKind::Action).count(), 0);
        assert!(bridge.calls().is_empty());
    }

    #[tokio::test]
    async fn test_low_risk_action_runs_without_confirmation() {
        let bridge = Arc::new(MockBridge::new().with_tool("srv", "read_file"));
        let engine = engine(
            ScriptedLlm::new([PLAN, act("read_file", json!({"path": "a.txt"})), DONE]),
            Arc::clone(&bridge),
        );

        let id = engine.create_task("alice", "read a").await;
        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::Completed);

        let task = engine.snapshot(id).await.unwrap();
        assert_eq!(bridge.calls().len(), 1);
        assert_eq!(task.actions.len(), 1);
        assert!(task.actions[0].success);
        assert!(task.context.contains_key("srv:read_file"));
        assert_eq!(task.steps_of(StepKind::Confirm).count(), 0);
        assert_eq!(task.observations.len(), 1);
    }

    #[tokio::test]
    async fn test_high_risk_action_parks_until_resolved() {
        let bridge = Arc::new(MockBridge::new().with_tool("srv", "delete_file"));
        let engine = engine(
            ScriptedLlm::new([PLAN, act("delete_file", json!({"path": "old.log"})), DONE]),
            Arc::clone(&bridge),
        );

        let id = engine.create_task("alice", "clean up").await;
        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::WaitingConfirmation);
        assert!(bridge.calls().is_empty());

        let task = engine.snapshot(id).await.unwrap();
        let parked = task.parked.clone().unwrap();
        let pending = engine.confirmations().list_pending("alice").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, parked.ticket_id);

        let status = engine
            .resolve_confirmation(id, parked.ticket_id, true, None)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Executing);
        assert_eq!(bridge.calls().len(), 1);
        assert_eq!(bridge.calls()[0].1, "delete_file");

        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::Completed);
        let task = engine.snapshot(id).await.unwrap();
        assert_eq!(task.actions.len(), 1);
        assert!(task.parked.is_none());
    }

    #[tokio::test]
    async fn test_rejected_confirmation_skips_action() {
        let bridge = Arc::new(MockBridge::new());
        let engine = engine(
            ScriptedLlm::new([PLAN, act("bash", json!({"command": "make"})), DONE]),
            Arc::clone(&bridge),
        );

        let id = engine.create_task("alice", "build").await;
        engine.run(id).await.unwrap();
        let ticket = engine.snapshot(id).await.unwrap().parked.unwrap().ticket_id;

        engine
            .resolve_confirmation(id, ticket, false, Some("not now".into()))
            .await
            .unwrap();
        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::Completed);

        let task = engine.snapshot(id).await.unwrap();
        let action = task.steps_of(StepKind::Action).next().unwrap();
        assert_eq!(action.status, StepStatus::Skipped);
        assert!(task.actions.is_empty());
        assert!(bridge.calls().is_empty());
        assert!(task.observations[0].contains("declined"));
    }

    #[tokio::test]
    async fn test_expired_ticket_skips_parked_action() {
        let bridge = Arc::new(MockBridge::new());
        let confirmations = Arc::new(ConfirmationManager::new(ConfirmationConfig {
            ttl: Duration::from_millis(10),
            ..ConfirmationConfig::default()
        }));
        let engine = AgentEngine::new(
            AgentConfig::default(),
            Arc::clone(&bridge) as Arc<dyn ToolBridge>,
            Arc::new(ScriptedLlm::new([PLAN, act("bash", json!({})), DONE])),
            confirmations,
        );

        let id = engine.create_task("alice", "build").await;
        engine.run(id).await.unwrap();
        let ticket = engine.snapshot(id).await.unwrap().parked.unwrap().ticket_id;
        tokio::time::sleep(Duration::from_millis(30)).await;

        engine
            .resolve_confirmation(id, ticket, true, None)
            .await
            .unwrap();
        let task = engine.snapshot(id).await.unwrap();
        assert!(bridge.calls().is_empty());
        assert!(task.observations[0].contains("expired"));
    }

    #[tokio::test]
    async fn test_resolve_requires_waiting_task() {
        let engine = engine(ScriptedLlm::new([PLAN, DONE]), Arc::new(MockBridge::new()));
        let id = engine.create_task("alice", "no-op").await;
        engine.run(id).await.unwrap();

        let err = engine
            .resolve_confirmation(id, Uuid::new_v4(), true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidState { .. }));

        let err = engine.run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AgentError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_callback_decides_inline() {
        let bridge = Arc::new(MockBridge::new());
        let engine = engine(
            ScriptedLlm::new([
                PLAN,
                act("write_file", json!({"path": "a"})),
                act("delete_file", json!({"path": "b"})),
                DONE,
            ]),
            Arc::clone(&bridge),
        )
        .with_callback(Arc::new(StaticCallback::approving(["write_file"])));

        let id = engine.create_task("alice", "edit").await;
        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::Completed);

        let calls = bridge.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "write_file");
        let task = engine.snapshot(id).await.unwrap();
        assert_eq!(task.steps_of(StepKind::Confirm).count(), 2);
        assert!(engine.confirmations().is_empty().await);
    }

    /// Cancels the task from inside the callback, then approves anyway.
    #[derive(Default)]
    struct CancelThenApprove {
        engine: OnceLock<Weak<AgentEngine>>,
        task_id: OnceLock<Uuid>,
    }

    #[async_trait]
    impl ConfirmationCallback for CancelThenApprove {
        async fn confirm(&self, _ticket: &ConfirmationTicket) -> bool {
            let engine = self.engine.get().and_then(Weak::upgrade);
            if let (Some(engine), Some(id)) = (engine, self.task_id.get()) {
                engine.cancel(*id).await.unwrap();
            }
            true
        }
    }

    #[tokio::test]
    async fn test_cancel_during_callback_blocks_dispatch() {
        let bridge = Arc::new(MockBridge::new().with_tool("srv", "delete_file"));
        let callback = Arc::new(CancelThenApprove::default());
        let engine = Arc::new(
            engine(
                ScriptedLlm::new([PLAN, act("delete_file", json!({"path": "b"})), DONE]),
                Arc::clone(&bridge),
            )
            .with_callback(Arc::clone(&callback) as Arc<dyn ConfirmationCallback>),
        );
        let _ = callback.engine.set(Arc::downgrade(&engine));

        let id = engine.create_task("alice", "clean up").await;
        let _ = callback.task_id.set(id);

        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::Failed);
        assert!(bridge.calls().is_empty());

        let task = engine.snapshot(id).await.unwrap();
        assert_eq!(task.error.as_deref(), Some("Cancelled"));
        assert!(task.actions.is_empty());
        assert!(engine.confirmations().list_pending("alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_iteration_ceiling_fails_task() {
        let engine = engine(
            ScriptedLlm::new([PLAN]).with_fallback("I am not sure yet"),
            Arc::new(MockBridge::new()),
        );
        let id = engine.create_task("alice", "loop forever").await;

        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::Failed);
        let task = engine.snapshot(id).await.unwrap();
        assert_eq!(task.iterations, AgentConfig::default().max_iterations);
        assert!(task.error.unwrap().contains("iteration limit"));
    }

    #[tokio::test]
    async fn test_unusable_plan_falls_back_to_generic_step() {
        let engine = engine(
            ScriptedLlm::new(["no json at all", DONE]),
            Arc::new(MockBridge::new()),
        );
        let id = engine.create_task("alice", "ship it").await;
        engine.run(id).await.unwrap();

        let task = engine.snapshot(id).await.unwrap();
        assert_eq!(task.plan, vec!["Work toward the goal: ship it".to_string()]);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_tool_failure_is_recorded_and_loop_continues() {
        let bridge = Arc::new(MockBridge::new().failing_with(BridgeError::ToolFailed {
            tool: "read_file".into(),
            message: "no such file".into(),
        }));
        let engine = engine(
            ScriptedLlm::new([PLAN, act("read_file", json!({"path": "x"})), DONE]),
            Arc::clone(&bridge),
        );

        let id = engine.create_task("alice", "read").await;
        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::Completed);

        let task = engine.snapshot(id).await.unwrap();
        assert_eq!(task.actions.len(), 1);
        assert!(!task.actions[0].success);
        assert!(task.observations[0].contains("no such file"));
    }

    #[tokio::test]
    async fn test_cancel_fails_parked_task_and_rejects_ticket() {
        let engine = engine(
            ScriptedLlm::new([PLAN, act("bash", json!({}))]),
            Arc::new(MockBridge::new()),
        );
        let id = engine.create_task("alice", "build").await;
        engine.run(id).await.unwrap();

        assert_eq!(engine.cancel(id).await.unwrap(), TaskStatus::Failed);
        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::Failed);
        assert!(engine.confirmations().list_pending("alice").await.is_empty());
        assert_eq!(
            engine.snapshot(id).await.unwrap().error.as_deref(),
            Some("Cancelled")
        );
    }

    #[tokio::test]
    async fn test_quick_surfaces_only_outcome() {
        let engine = engine(ScriptedLlm::new([PLAN, DONE]), Arc::new(MockBridge::new()));
        let result = engine.quick("alice", "no-op").await;

        assert!(result.success);
        assert_eq!(result.result.as_deref(), Some("all done"));
        assert!(engine.snapshot(result.task_id).await.is_none());
    }

    #[tokio::test]
    async fn test_quick_uses_small_ceiling() {
        let engine = engine(
            ScriptedLlm::new([PLAN]).with_fallback("{}"),
            Arc::new(MockBridge::new()),
        );
        let result = engine.quick("alice", "spin").await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("(5)"));
    }

    #[tokio::test]
    async fn test_subscribe_streams_events() {
        let engine = engine(ScriptedLlm::new([PLAN, DONE]), Arc::new(MockBridge::new()));
        let mut events = Box::pin(engine.subscribe());

        let id = engine.create_task("alice", "no-op").await;
        engine.run(id).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(Some((task_id, event))) =
            tokio::time::timeout(Duration::from_millis(50), events.next()).await
        {
            assert_eq!(task_id, id);
            kinds.push(event.kind());
        }
        assert_eq!(kinds.first(), Some(&"status_changed"));
        assert!(kinds.contains(&"plan"));
        assert_eq!(kinds.last(), Some(&"completed"));
    }

    #[tokio::test]
    async fn test_store_receives_records_and_events() {
        let store = Arc::new(InMemoryDatabase::new());
        let engine = engine(ScriptedLlm::new([PLAN, DONE]), Arc::new(MockBridge::new()))
            .with_store(Arc::clone(&store) as Arc<dyn Database>);

        let id = engine.create_task("alice", "no-op").await;
        engine.run(id).await.unwrap();

        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.plan, vec!["inspect", "deploy"]);

        let events: Vec<_> = store
            .list_task_events(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(events, vec!["plan", "completed"]);
    }

    #[tokio::test]
    async fn test_restore_reparks_nothing_and_regates() {
        let bridge = Arc::new(MockBridge::new());
        let engine = engine(
            ScriptedLlm::new([act("bash", json!({"command": "deploy"}))]),
            Arc::clone(&bridge),
        );

        let mut memory = AgentMemory::new();
        memory.record("bash on srv needs approval");
        let record = TaskRecord {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            session_id: Some("s1".into()),
            goal: "deploy".into(),
            status: TaskStatus::WaitingConfirmation,
            plan: vec!["deploy".into()],
            iterations: 2,
            result: None,
            error: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let id = engine.restore(&record, HashMap::new(), memory).await.unwrap();
        let task = engine.snapshot(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Executing);
        assert_eq!(task.observations, vec!["bash on srv needs approval".to_string()]);

        assert_eq!(engine.run(id).await.unwrap(), TaskStatus::WaitingConfirmation);
        assert!(bridge.calls().is_empty());
    }

    #[tokio::test]
    async fn test_restore_rejects_finished_task() {
        let engine = engine(ScriptedLlm::new(Vec::new()), Arc::new(MockBridge::new()));
        let now = chrono::Utc::now();
        let record = TaskRecord {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            session_id: None,
            goal: "done".into(),
            status: TaskStatus::Completed,
            plan: vec![],
            iterations: 1,
            result: Some("ok".into()),
            error: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            engine.restore(&record, HashMap::new(), AgentMemory::new()).await,
            Err(AgentError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_tail_and_preview() {
        assert_eq!(tail(&[1, 2, 3, 4], 2), &[3, 4]);
        assert_eq!(tail(&[1], 5), &[1]);
        assert_eq!(preview(&json!("plain")), "plain");
        assert!(preview(&json!("x".repeat(500))).ends_with("..."));
    }
}
