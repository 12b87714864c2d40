//! Risk gate and confirmation workflow for tool calls.
//!
//! Every action the agent wants to run is classified and assessed first.
//! Anything above LOW risk needs a human decision, captured as an expiring
//! confirmation ticket.

mod confirmation;
mod risk;

pub use confirmation::{
    ConfirmationConfig, ConfirmationManager, ConfirmationTicket, Resolution, TicketStatus,
    spawn_sweeper,
};
pub(crate) use confirmation::to_chrono;
pub use risk::{ActionType, RiskAssessment, RiskGate, RiskLevel};
