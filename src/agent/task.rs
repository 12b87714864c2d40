//! Agent task model.
//!
//! A task only changes through [`TaskEvent`]s applied with
//! [`AgentTask::apply`]. The engine broadcasts every event it applies, so
//! observers can follow progress without touching the task itself.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::memory::AgentMemory;
use crate::bridge::AvailableTool;
use crate::safety::RiskAssessment;

/// Task lifecycle.
///
/// `pending -> planning -> executing -> {completed, failed}`, with
/// `executing <-> waiting_confirmation` while a gated action is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    WaitingConfirmation,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Started but not finished.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Planning | Self::Executing | Self::WaitingConfirmation
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::WaitingConfirmation => "waiting_confirmation",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "waiting_confirmation" => Ok(Self::WaitingConfirmation),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Phase a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Plan,
    Think,
    Action,
    Observe,
    Confirm,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Think => "think",
            Self::Action => "action",
            Self::Observe => "observe",
            Self::Confirm => "confirm",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// The tool an action or confirm step targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTarget {
    pub server_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub assessment: RiskAssessment,
}

/// One unit of the plan/think/act/observe cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub id: Uuid,
    pub kind: StepKind,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    /// Set for action and confirm steps.
    pub target: Option<ToolTarget>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentStep {
    pub fn new(kind: StepKind, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: StepStatus::Executing,
            input,
            output: None,
            target: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn with_target(mut self, target: ToolTarget) -> Self {
        self.target = Some(target);
        self
    }
}

/// An executed tool call and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step_id: Uuid,
    pub server_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
}

impl ActionRecord {
    /// Key under which the result lands in the task context.
    pub fn context_key(&self) -> String {
        format!("{}:{}", self.server_id, self.tool_name)
    }
}

/// A gated action waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedAction {
    pub ticket_id: Uuid,
    pub action_step_id: Uuid,
    pub confirm_step_id: Uuid,
    pub target: ToolTarget,
}

/// A single mutation of an [`AgentTask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    StatusChanged {
        from: TaskStatus,
        to: TaskStatus,
    },
    PlanRecorded {
        steps: Vec<String>,
    },
    IterationStarted {
        iteration: u32,
    },
    StepStarted {
        step: AgentStep,
    },
    StepFinished {
        step_id: Uuid,
        status: StepStatus,
        output: Option<Value>,
    },
    ConfirmationRequested {
        parked: ParkedAction,
    },
    ConfirmationResolved {
        ticket_id: Uuid,
        approved: bool,
    },
    ActionRecorded {
        record: ActionRecord,
    },
    Observed {
        text: String,
    },
    Resumed {
        from: TaskStatus,
    },
    Completed {
        result: String,
    },
    Failed {
        error: String,
    },
}

impl TaskEvent {
    /// Short name used for durable event rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::PlanRecorded { .. } => "plan",
            Self::IterationStarted { .. } => "iteration",
            Self::StepStarted { .. } => "step_started",
            Self::StepFinished { .. } => "step_finished",
            Self::ConfirmationRequested { .. } => "confirmation_requested",
            Self::ConfirmationResolved { .. } => "confirmation_resolved",
            Self::ActionRecorded { .. } => "action",
            Self::Observed { .. } => "observation",
            Self::Resumed { .. } => "resumed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether this event is worth a durable row.
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            Self::PlanRecorded { .. }
                | Self::ConfirmationRequested { .. }
                | Self::ConfirmationResolved { .. }
                | Self::ActionRecorded { .. }
                | Self::Resumed { .. }
                | Self::Completed { .. }
                | Self::Failed { .. }
        )
    }
}

/// One goal-directed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: Uuid,
    pub user_id: String,
    pub goal: String,
    pub status: TaskStatus,
    pub steps: Vec<AgentStep>,
    pub current_step: usize,
    pub plan: Vec<String>,
    /// Tool results accumulated so far.
    pub context: HashMap<String, Value>,
    pub actions: Vec<ActionRecord>,
    pub observations: Vec<String>,
    pub memory: AgentMemory,
    pub tools: Vec<AvailableTool>,
    pub iterations: u32,
    pub max_iterations: u32,
    pub parked: Option<ParkedAction>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentTask {
    pub fn new(user_id: impl Into<String>, goal: impl Into<String>, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            goal: goal.into(),
            status: TaskStatus::Pending,
            steps: Vec::new(),
            current_step: 0,
            plan: Vec::new(),
            context: HashMap::new(),
            actions: Vec::new(),
            observations: Vec::new(),
            memory: AgentMemory::new(),
            tools: Vec::new(),
            iterations: 0,
            max_iterations,
            parked: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply one event.
    ///
    /// Terminal status is final: later status events are ignored. Finished
    /// steps keep their status.
    pub fn apply(&mut self, event: &TaskEvent) {
        self.updated_at = Utc::now();

        match event {
            TaskEvent::StatusChanged { to, .. } => {
                if !self.status.is_terminal() {
                    self.status = *to;
                }
            }
            TaskEvent::PlanRecorded { steps } => {
                self.plan = steps.clone();
            }
            TaskEvent::IterationStarted { iteration } => {
                self.iterations = *iteration;
            }
            TaskEvent::StepStarted { step } => {
                self.steps.push(step.clone());
                self.current_step = self.steps.len() - 1;
            }
            TaskEvent::StepFinished {
                step_id,
                status,
                output,
            } => {
                if let Some(step) = self.steps.iter_mut().find(|s| s.id == *step_id) {
                    if !step.status.is_finished() {
                        step.status = *status;
                        step.finished_at = Some(Utc::now());
                    }
                    if output.is_some() {
                        step.output = output.clone();
                    }
                }
            }
            TaskEvent::ConfirmationRequested { parked } => {
                self.parked = Some(parked.clone());
            }
            TaskEvent::ConfirmationResolved { approved, .. } => {
                if let Some(parked) = self.parked.take()
                    && !approved
                {
                    self.memory.learn(format!(
                        "User declined {} on {}",
                        parked.target.tool_name, parked.target.server_id
                    ));
                }
            }
            TaskEvent::ActionRecorded { record } => {
                if record.success {
                    let result = record.result.clone().unwrap_or(Value::Null);
                    self.memory.set_working("last_result", result.clone());
                    self.context.insert(record.context_key(), result);
                }
                self.actions.push(record.clone());
            }
            TaskEvent::Observed { text } => {
                self.observations.push(text.clone());
                self.memory.record(text.clone());
            }
            TaskEvent::Resumed { .. } => {
                self.parked = None;
                if !self.status.is_terminal() {
                    self.status = if self.plan.is_empty() {
                        TaskStatus::Pending
                    } else {
                        TaskStatus::Executing
                    };
                }
            }
            TaskEvent::Completed { result } => {
                if !self.status.is_terminal() {
                    self.status = TaskStatus::Completed;
                    self.result = Some(result.clone());
                    self.memory.set_summary(format!("Completed '{}': {}", self.goal, result));
                }
            }
            TaskEvent::Failed { error } => {
                if !self.status.is_terminal() {
                    self.status = TaskStatus::Failed;
                    self.error = Some(error.clone());
                    self.memory.set_summary(format!("Failed '{}': {}", self.goal, error));
                }
            }
        }
    }

    pub fn step(&self, id: Uuid) -> Option<&AgentStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn steps_of(&self, kind: StepKind) -> impl Iterator<Item = &AgentStep> {
        self.steps.iter().filter(move |s| s.kind == kind)
    }

    /// Phase of the latest step, if any.
    pub fn current_phase(&self) -> Option<StepKind> {
        self.steps.get(self.current_step).map(|s| s.kind)
    }

    /// The durable projection of this task.
    pub fn to_record(&self, session_id: Option<&str>) -> TaskRecord {
        TaskRecord {
            id: self.id,
            user_id: self.user_id.clone(),
            session_id: session_id.map(str::to_string),
            goal: self.goal.clone(),
            status: self.status,
            plan: self.plan.clone(),
            iterations: self.iterations,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Durable task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: Option<String>,
    pub goal: String,
    pub status: TaskStatus,
    pub plan: Vec<String>,
    pub iterations: u32,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
