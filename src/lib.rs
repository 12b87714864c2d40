//! ironloop: crash-resilient execution core for autonomous agents.
//!
//! Goals are driven through a plan / think / act / observe loop. Tool calls
//! go to a remote peer over an authenticated WebSocket [`bridge`], risky
//! actions are held behind [`safety`] confirmation tickets, and each
//! (user, session) loop is kept durable by a supervisor in [`agent`].

pub mod agent;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod safety;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Result};
