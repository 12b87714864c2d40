//! Command-line interface.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::agent::{AgentEngine, ConfirmationCallback, LoopSupervisor, TaskStatus};
use crate::bridge::{BridgeClient, ToolBridge};
use crate::config::Config;
use crate::db::{self, PgStore};
use crate::llm::create_llm_provider;
use crate::safety::{ConfirmationManager, ConfirmationTicket, RiskGate, spawn_sweeper};

#[derive(Parser, Debug)]
#[command(name = "ironloop", version, about = "Risk-gated autonomous agent loop")]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Drive a goal to completion under a supervised loop
    Run {
        /// Owning user
        #[arg(long, env = "IRONLOOP_USER", default_value = "local")]
        user: String,

        /// Session to attach to (recovered if abandoned)
        #[arg(long, env = "IRONLOOP_SESSION", default_value = "default")]
        session: String,

        /// Goal text
        goal: String,
    },

    /// Print the risk assessment of a tool call
    Assess {
        /// Tool name (e.g. "delete_file")
        tool: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        args: String,
    },

    /// Apply database migrations
    Migrate,
}

/// Run a CLI command.
pub async fn run_command(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Run {
            user,
            session,
            goal,
        } => run_goal(&user, &session, &goal).await,
        Command::Assess { tool, args } => assess(&tool, &args),
        Command::Migrate => migrate().await,
    }
}

async fn run_goal(user: &str, session: &str, goal: &str) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let store = db::connect(config.database.as_ref()).await?;
    let llm = create_llm_provider(&config.llm)?;

    let client = BridgeClient::new(config.bridge.clone());
    client
        .connect_configured()
        .await
        .context("connecting to the tool bridge")?;
    let bridge: Arc<dyn ToolBridge> = Arc::new(client.clone());

    let confirmations = Arc::new(ConfirmationManager::new(config.confirmation.clone()));
    let sweeper = spawn_sweeper(Arc::clone(&confirmations));

    let engine = Arc::new(
        AgentEngine::new(config.agent.clone(), bridge, llm, confirmations)
            .with_callback(Arc::new(StdinConfirmation))
            .with_store(Arc::clone(&store)),
    );

    let supervisor =
        LoopSupervisor::new(config.supervisor.clone(), user, session, store).with_engine(engine);
    let outcome = supervisor.start().await?;
    tracing::info!(outcome = ?outcome, "Supervisor ready");

    let task_id = supervisor.submit(goal).await?;
    let status = supervisor.drive().await;

    supervisor.stop().await?;
    sweeper.abort();
    client.disconnect().await;

    let status = status?;
    let task = match supervisor.engine() {
        Some(engine) => engine.snapshot(task_id).await,
        None => None,
    };

    match (status, task) {
        (TaskStatus::Completed, Some(task)) => {
            println!("{}", task.result.unwrap_or_default());
            Ok(())
        }
        (status, task) => {
            let reason = task.and_then(|t| t.error).unwrap_or_default();
            anyhow::bail!("task {} ended {}: {}", task_id, status, reason)
        }
    }
}

fn assess(tool: &str, args: &str) -> anyhow::Result<()> {
    let arguments: Value = serde_json::from_str(args).context("arguments must be JSON")?;
    let assessment = RiskGate::new().evaluate(tool, &arguments);

    println!("action:   {}", assessment.action_type);
    println!("level:    {}", assessment.level);
    println!("confirm:  {}", assessment.requires_confirmation());
    for warning in &assessment.warnings {
        println!("warning:  {}", warning);
    }
    Ok(())
}

async fn migrate() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let database = config
        .database
        .as_ref()
        .context("DATABASE_URL must be set to migrate")?;

    let store = PgStore::new(database).await?;
    store.run_migrations().await?;
    println!("Migrations applied");
    Ok(())
}

/// Asks on the terminal before a gated action runs.
struct StdinConfirmation;

#[async_trait]
impl ConfirmationCallback for StdinConfirmation {
    async fn confirm(&self, ticket: &ConfirmationTicket) -> bool {
        {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "\n{} ({})", ticket.description, ticket.risk_level);
            for warning in &ticket.warnings {
                let _ = writeln!(out, "  ! {}", warning);
            }
            let _ = write!(out, "Approve? [y/N] ");
            let _ = out.flush();
        }

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(e) => {
                tracing::warn!("Failed to read confirmation: {}", e);
                false
            }
        }
    }
}
