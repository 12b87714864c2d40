//! Confirmation tickets for gated actions.
//!
//! A ticket parks one risky tool call until a human approves or rejects it.
//! Tickets expire after a fixed lifetime. Expiry is checked lazily on every
//! access and by a periodic sweep, so a late decision is always refused.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::safety::risk::{ActionType, RiskGate, RiskLevel};

/// Timing for the confirmation workflow.
#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    /// Lifetime of a pending ticket.
    pub ttl: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
    /// Tickets of any status older than this are dropped.
    pub retention: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            retention: Duration::from_secs(60 * 60),
        }
    }
}

/// Ticket lifecycle. Terminal once it leaves `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A time-boxed approval request for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationTicket {
    pub id: Uuid,
    pub user_id: String,
    pub action_type: ActionType,
    pub tool_name: String,
    pub server_id: String,
    pub arguments: Value,
    pub risk_level: RiskLevel,
    pub description: String,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TicketStatus,
}

impl ConfirmationTicket {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of resolving a ticket.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub ticket: ConfirmationTicket,
    pub approved: bool,
    pub reason: Option<String>,
}

/// In-memory ticket store.
pub struct ConfirmationManager {
    config: ConfirmationConfig,
    gate: RiskGate,
    tickets: RwLock<HashMap<Uuid, ConfirmationTicket>>,
}

impl ConfirmationManager {
    pub fn new(config: ConfirmationConfig) -> Self {
        Self {
            config,
            gate: RiskGate::new(),
            tickets: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConfirmationConfig {
        &self.config
    }

    /// Open a ticket for a tool call. Sweeps expired tickets first.
    pub async fn create(
        &self,
        user_id: &str,
        tool_name: &str,
        server_id: &str,
        arguments: Value,
    ) -> ConfirmationTicket {
        self.sweep_expired().await;

        let assessment = self.gate.evaluate(tool_name, &arguments);
        let now = Utc::now();
        let ticket = ConfirmationTicket {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            action_type: assessment.action_type,
            tool_name: tool_name.to_string(),
            server_id: server_id.to_string(),
            arguments,
            risk_level: assessment.level,
            description: format!(
                "{} risk {} via '{}' on server '{}'",
                assessment.level, assessment.action_type, tool_name, server_id
            ),
            warnings: assessment.warnings,
            created_at: now,
            expires_at: now + to_chrono(self.config.ttl),
            status: TicketStatus::Pending,
        };

        tracing::info!(
            ticket_id = %ticket.id,
            user_id = %ticket.user_id,
            tool = %ticket.tool_name,
            level = %ticket.risk_level,
            "Confirmation requested"
        );

        self.tickets.write().await.insert(ticket.id, ticket.clone());
        ticket
    }

    /// Approve or reject a pending ticket.
    ///
    /// Returns `None` if the ticket is unknown, already resolved, or past its
    /// expiry. A resolved ticket is removed from the store.
    pub async fn resolve(
        &self,
        ticket_id: Uuid,
        approved: bool,
        reason: Option<String>,
    ) -> Option<Resolution> {
        let mut tickets = self.tickets.write().await;
        let ticket = tickets.get_mut(&ticket_id)?;

        if ticket.status != TicketStatus::Pending {
            return None;
        }
        if ticket.is_expired_at(Utc::now()) {
            ticket.status = TicketStatus::Expired;
            tracing::info!(ticket_id = %ticket_id, "Rejected late resolution of expired ticket");
            return None;
        }

        let mut ticket = tickets.remove(&ticket_id)?;
        ticket.status = if approved {
            TicketStatus::Approved
        } else {
            TicketStatus::Rejected
        };

        tracing::info!(
            ticket_id = %ticket_id,
            status = %ticket.status,
            reason = reason.as_deref().unwrap_or(""),
            "Confirmation resolved"
        );

        Some(Resolution {
            ticket,
            approved,
            reason,
        })
    }

    /// Look up a ticket, marking it expired if its lifetime has passed.
    pub async fn get(&self, ticket_id: Uuid) -> Option<ConfirmationTicket> {
        let mut tickets = self.tickets.write().await;
        let ticket = tickets.get_mut(&ticket_id)?;
        if ticket.status == TicketStatus::Pending && ticket.is_expired_at(Utc::now()) {
            ticket.status = TicketStatus::Expired;
        }
        Some(ticket.clone())
    }

    /// Pending, unexpired tickets for a user, oldest first.
    pub async fn list_pending(&self, user_id: &str) -> Vec<ConfirmationTicket> {
        let now = Utc::now();
        let tickets = self.tickets.read().await;
        let mut pending: Vec<ConfirmationTicket> = tickets
            .values()
            .filter(|t| {
                t.user_id == user_id && t.status == TicketStatus::Pending && !t.is_expired_at(now)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        pending
    }

    /// Expire timed-out pending tickets and drop any ticket past retention.
    ///
    /// Returns how many tickets were newly expired.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let retention_cutoff = now - to_chrono(self.config.retention);
        let mut tickets = self.tickets.write().await;

        let mut expired = 0;
        for ticket in tickets.values_mut() {
            if ticket.status == TicketStatus::Pending && ticket.is_expired_at(now) {
                ticket.status = TicketStatus::Expired;
                expired += 1;
            }
        }

        let before = tickets.len();
        tickets.retain(|_, t| t.created_at > retention_cutoff);
        let dropped = before - tickets.len();

        if expired > 0 || dropped > 0 {
            tracing::debug!(expired, dropped, "Swept confirmation tickets");
        }
        expired
    }

    /// Number of tickets held, in any status.
    pub async fn len(&self) -> usize {
        self.tickets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tickets.read().await.is_empty()
    }
}

impl Default for ConfirmationManager {
    fn default() -> Self {
        Self::new(ConfirmationConfig::default())
    }
}

/// Spawn the periodic sweep as a background task.
pub fn spawn_sweeper(manager: Arc<ConfirmationManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = match manager.config.sweep_interval {
            zero if zero.is_zero() => {
                let fallback = ConfirmationConfig::default().sweep_interval;
                tracing::warn!("Sweep interval is zero, using {:?}", fallback);
                fallback
            }
            period => period,
        };
        let mut interval = tokio::time::interval(period);
        // Don't sweep immediately on startup
        interval.tick().await;

        loop {
            interval.tick().await;
            manager.sweep_expired().await;
        }
    })
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
