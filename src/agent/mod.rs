//! Core agent logic.
//!
//! - [`AgentEngine`] drives one goal through plan / think / act / observe,
//!   gating risky actions behind confirmation.
//! - [`LoopSupervisor`] keeps a (user, session) loop durable: heartbeat,
//!   checkpoints and crash recovery.
//! - [`SupervisorRegistry`] tracks live supervisors.

mod checkpoint;
mod engine;
mod heartbeat;
pub mod memory;
mod registry;
mod supervisor;
pub mod task;

pub use checkpoint::{CheckpointRunner, spawn_checkpoint};
pub use engine::{AgentConfig, AgentEngine, ConfirmationCallback, QuickResult};
pub use heartbeat::{HeartbeatRunner, spawn_heartbeat};
pub use memory::{AgentMemory, MemoryEntry, SHORT_TERM_CAPACITY};
pub use registry::SupervisorRegistry;
pub use supervisor::{LoopState, LoopStatus, LoopSupervisor, RecoveryOutcome, SupervisorConfig};
pub use task::{
    ActionRecord, AgentStep, AgentTask, ParkedAction, StepKind, StepStatus, TaskEvent, TaskRecord,
    TaskStatus, ToolTarget,
};
