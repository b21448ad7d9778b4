//! # Crewly Core
//!
//! Crewly Core is the continuation-and-quality control loop of the
//! Crewly agent orchestrator: it supervises long-running AI coding
//! assistants in pseudo-terminal sessions, detects stalls, decides
//! what to do next, verifies work against quality gates, and can
//! safely rewrite its own source across restarts.
//!
//! ## Architecture
//!
//! The core is a set of capabilities wired together explicitly:
//! - **Continuation Engine**: event loop that classifies agent state
//!   and injects follow-up prompts
//! - **Quality Gate Runner**: declarative verification pipelines run
//!   before a task is accepted
//! - **Auto Assigner**: matches open tasks to idle agents by role,
//!   priority, and dependency graph
//! - **Budget Guard**: append-only usage ledger with threshold
//!   detection and pause signaling
//! - **State Checkpointer**: atomic snapshots with resume
//!   instructions after restarts
//! - **Self-Improvement**: marker-file-driven plan/apply/validate/
//!   rollback across process restarts
//!
//! External collaborators (PTY sessions, task storage, chat surfaces)
//! are consumed through traits; the crate ships in-memory adapters
//! for composition and tests.

/// Output analysis: classify agent state from captured output
pub mod analyzer;
/// HTTP RPC surface
pub mod api;
/// API-key authentication middleware
pub mod auth;
/// Usage ledger, budget thresholds, pause signaling
pub mod budget;
/// Periodic check-ins and continuation triggers
pub mod checker;
/// Atomic state snapshots and resume instructions
pub mod checkpoint;
/// Runtime configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// The continuation engine
pub mod engine;
/// Error types and handling
pub mod error;
/// Quality gate configuration and execution
pub mod gates;
/// Core data models
pub mod models;
/// Notification seam
pub mod notify;
/// Built-in prompt templates
pub mod prompts;
/// Request rate limiting
pub mod rate_limit;
/// Orchestrator composition root
pub mod runtime;
/// Timer primitives and adaptive intervals
pub mod scheduler;
/// Self-improvement driver and startup reconciler
pub mod self_improve;
/// Session port: the only path for agent I/O
pub mod session;
/// Task queue, auto-assignment, completion contract
pub mod tasks;
/// Minimal prompt template renderer
pub mod template;

#[cfg(test)]
mod tests;

pub use error::{CrewlyError, Result};
