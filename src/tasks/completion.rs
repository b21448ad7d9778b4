//! Task completion contract.
//!
//! A task reaches `Completed` only through this path: quality gates
//! run first (unless explicitly bypassed), a gate failure increments
//! the iteration counter and feeds a retry back into the continuation
//! engine, and a success records the learning and hands the idle agent
//! its next task.

use super::assigner::AutoAssigner;
use super::registry::AgentRegistry;
use super::repo::TaskRepository;
use crate::engine::events::EngineEvent;
use crate::gates::{GateRunOptions, QualityGateRunner};
use crate::models::{
    AgentStatus, ContinuationEvent, ContinuationTrigger, GateResult, Recommendation, TaskStatus,
};
use crate::notify::Notifier;
use crate::{CrewlyError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Options for one completion attempt.
#[derive(Debug, Clone, Default)]
pub struct CompleteTaskOptions {
    /// Bypass quality gates entirely (owner override).
    pub skip_gates: bool,
    /// Learning recorded on the task when completion succeeds.
    pub summary: Option<String>,
}

/// Structured outcome returned to the RPC caller.
#[derive(Debug, Clone)]
pub struct CompleteTaskOutcome {
    pub success: bool,
    pub failed_gates: Vec<GateResult>,
    pub iterations: u32,
    pub max_iterations: u32,
    pub message: String,
}

#[derive(Clone)]
pub struct TaskCompletion {
    repo: Arc<dyn TaskRepository>,
    registry: AgentRegistry,
    gates: QualityGateRunner,
    #[allow(dead_code)]
    notifier: Arc<dyn Notifier>,
    assigner: AutoAssigner,
    /// Feeds failure retries back into the engine; absent in CLI
    /// one-shot mode.
    engine_tx: Option<mpsc::Sender<EngineEvent>>,
    auto_assign_next: bool,
    /// Used when the task has no bound agent to derive a path from.
    default_project_path: PathBuf,
}

impl TaskCompletion {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        registry: AgentRegistry,
        gates: QualityGateRunner,
        notifier: Arc<dyn Notifier>,
        assigner: AutoAssigner,
        engine_tx: Option<mpsc::Sender<EngineEvent>>,
        auto_assign_next: bool,
        default_project_path: PathBuf,
    ) -> Self {
        Self {
            repo,
            registry,
            gates,
            notifier,
            assigner,
            engine_tx,
            auto_assign_next,
            default_project_path,
        }
    }

    /// Attempt to complete `task_id` per the completion contract.
    pub async fn complete_task(
        &self,
        task_id: &str,
        options: &CompleteTaskOptions,
    ) -> Result<CompleteTaskOutcome> {
        let task = self
            .repo
            .get(task_id)
            .await?
            .ok_or_else(|| CrewlyError::NotFound(format!("task {task_id}")))?;

        if task.status != TaskStatus::InProgress {
            return Err(CrewlyError::InvalidTaskState {
                task_id: task_id.to_string(),
                message: format!("cannot complete task in state {:?}", task.status),
            });
        }

        if !options.skip_gates {
            let project_path = match &task.session {
                Some(session) => self
                    .registry
                    .get(session)
                    .await
                    .map(|a| PathBuf::from(a.project_path))
                    .unwrap_or_else(|| self.default_project_path.clone()),
                None => self.default_project_path.clone(),
            };

            let run = self
                .gates
                .run_all(&project_path, &GateRunOptions::default())
                .await?;

            // Persist the last-run snapshot on the task either way
            let results = run.results.clone();
            self.repo
                .update_with(
                    task_id,
                    Box::new(move |t| t.quality_gate_results = results),
                )
                .await?;

            if !run.all_required_passed {
                let failed: Vec<GateResult> =
                    run.results.iter().filter(|r| !r.passed).cloned().collect();
                let updated = self
                    .repo
                    .update_with(task_id, Box::new(|t| t.iterations += 1))
                    .await?;
                warn!(
                    "[TaskCompletion] Task {} failed gates: {:?} (iteration {})",
                    task_id,
                    failed.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
                    updated.iterations
                );

                if let (Some(tx), Some(session)) = (&self.engine_tx, &task.session) {
                    let event = ContinuationEvent::new(
                        session.clone(),
                        ContinuationTrigger::ExplicitRequest,
                    );
                    if tx
                        .send(EngineEvent::preseeded(event, Recommendation::RetryWithHints))
                        .await
                        .is_err()
                    {
                        warn!("[TaskCompletion] Engine queue closed, retry event dropped");
                    }
                }

                let names: Vec<&str> = failed.iter().map(|g| g.name.as_str()).collect();
                return Ok(CompleteTaskOutcome {
                    success: false,
                    failed_gates: failed.clone(),
                    iterations: updated.iterations,
                    max_iterations: updated.max_iterations,
                    message: format!("required gates failed: {}", names.join(", ")),
                });
            }
        }

        let summary = options.summary.clone();
        let completed = self
            .repo
            .update_with(
                task_id,
                Box::new(move |t| {
                    t.status = TaskStatus::Completed;
                    if let Some(summary) = summary {
                        t.learnings.push(summary);
                    }
                }),
            )
            .await?;
        info!("[TaskCompletion] Task {} completed", task_id);

        if let Some(session) = &task.session {
            self.registry.set_status(session, AgentStatus::Idle).await;
            if self.auto_assign_next {
                if let Err(e) = self.assigner.assign_next_task(session).await {
                    warn!(
                        "[TaskCompletion] Auto-assignment after completion failed: {}",
                        e
                    );
                }
            }
        }

        Ok(CompleteTaskOutcome {
            success: true,
            failed_gates: Vec::new(),
            iterations: completed.iterations,
            max_iterations: completed.max_iterations,
            message: "task completed".to_string(),
        })
    }
}
