//! Continuation engine: the event loop that keeps agents productive.
//!
//! Consumes detection signals (idle timeouts, process exits, explicit
//! requests, scheduled checks), classifies the session's state through
//! the analyzer, and executes exactly one action per event. Actions
//! form a closed sum type and the dispatcher matches exhaustively.
//!
//! Per-session transitions are serialized:
//!
//! ```text
//! MONITORED → ANALYZING → ACTING → MONITORED
//!                              ↘ PAUSED (budget, max-iterations, owner)
//!                              ↘ ESCALATED (terminal; external resume)
//! ```
//!
//! Every error inside `handle` is caught and logged; the session stays
//! in its prior stable state and prompt injection is at-most-once per
//! event. Lost events are acceptable — the next idle timeout or
//! scheduled check regenerates the signal.

pub mod events;

use crate::analyzer::{AnalysisInput, OutputAnalyzer};
use crate::budget::BudgetGuard;
use crate::constants::{EVENT_QUEUE_CAPACITY, HANDLE_TIMEOUT_SECS};
use crate::models::{
    AgentStateAnalysis, ContinuationEvent, ContinuationTrigger, Recommendation, SessionRef,
    TaskStatus,
};
use crate::notify::{NotificationKind, NotificationRecord, Notifier};
use crate::session::{OutputCursor, SessionPort};
use crate::tasks::{AgentRegistry, AutoAssigner, TaskRepository};
use crate::{prompts, Result};
use events::EngineEvent;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Engine behavior toggles, loaded at construction.
#[derive(Debug, Clone)]
pub struct ContinuationConfig {
    pub enabled: bool,
    pub auto_assign_next: bool,
    pub notify_on_max: bool,
    pub notify_on_error: bool,
    pub max_iterations: u32,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_assign_next: true,
            notify_on_max: true,
            notify_on_error: true,
            max_iterations: crate::constants::DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Session position in the engine's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Monitored,
    Analyzing,
    Acting,
    Paused,
    Escalated,
}

/// Per-session bookkeeping, readable through `get_session_status`.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub last_analysis: Option<AgentStateAnalysis>,
    pub last_action: Option<Recommendation>,
    pub last_action_at: Option<chrono::DateTime<chrono::Utc>>,
    pub max_iterations_override: Option<u32>,
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    last_analysis: Option<AgentStateAnalysis>,
    last_action: Option<Recommendation>,
    last_action_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Cursor from the previous capture; feeds the analyzer's
    /// output-growth rule.
    last_cursor: OutputCursor,
    max_iterations_override: Option<u32>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Monitored,
            last_analysis: None,
            last_action: None,
            last_action_at: None,
            last_cursor: OutputCursor::default(),
            max_iterations_override: None,
        }
    }
}

/// The closed set of actions the engine can take for one event.
#[derive(Debug, Clone)]
enum ContinuationAction {
    InjectPrompt { prompt: String, task_id: String },
    AssignNextTask,
    NotifyOwner { reason: String },
    RetryWithHints { prompt: String, task_id: String },
    PauseAgent { reason: String },
    NoAction,
}

/// Capabilities the engine consumes, passed explicitly — no hidden
/// process-global state.
#[derive(Clone)]
pub struct EngineDeps {
    pub port: Arc<dyn SessionPort>,
    pub repo: Arc<dyn TaskRepository>,
    pub registry: AgentRegistry,
    pub analyzer: Arc<OutputAnalyzer>,
    pub assigner: AutoAssigner,
    pub budget: BudgetGuard,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone)]
pub struct ContinuationEngine {
    deps: EngineDeps,
    config: ContinuationConfig,
    sessions: Arc<RwLock<HashMap<SessionRef, Arc<Mutex<SessionState>>>>>,
    tx: mpsc::Sender<EngineEvent>,
    rx: Arc<Mutex<Option<mpsc::Receiver<EngineEvent>>>>,
    /// Sessions with an idle-timeout event already queued; duplicates
    /// are dropped (backpressure policy).
    queued_idle: Arc<Mutex<HashSet<SessionRef>>>,
    running: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ContinuationEngine {
    pub fn new(deps: EngineDeps, config: ContinuationConfig) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            deps,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            queued_idle: Arc::new(Mutex::new(HashSet::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// Sender for components that feed events in (checker, completion).
    pub fn sender(&self) -> mpsc::Sender<EngineEvent> {
        self.tx.clone()
    }

    /// Start the event worker. Idempotent.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("[Engine] start() after a previous stop(); worker not restartable");
            return;
        };
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            info!("[Engine] Event worker started");
            while engine.running.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Some(envelope) => {
                        engine
                            .queued_idle
                            .lock()
                            .await
                            .remove(&envelope.event.session);
                        let engine = engine.clone();
                        // One logical worker per session: the spawned
                        // task serializes on the session's lock, so
                        // sessions advance independently
                        tokio::spawn(async move {
                            engine.handle_envelope(envelope).await;
                        });
                    }
                    None => break,
                }
            }
            info!("[Engine] Event worker stopped");
        });
        *self.worker.lock().await = Some(handle);
    }

    /// Stop accepting events. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
        }
    }

    /// Enqueue an event, dropping duplicate idle timeouts for a
    /// session that already has one waiting.
    pub async fn submit(&self, event: ContinuationEvent) {
        if event.trigger == ContinuationTrigger::IdleTimeout {
            let mut queued = self.queued_idle.lock().await;
            if !queued.insert(event.session.clone()) {
                debug!(
                    "[Engine] Dropping duplicate idle-timeout for {}",
                    event.session
                );
                return;
            }
        }
        if self.tx.send(event.into()).await.is_err() {
            warn!("[Engine] Event queue closed, event dropped");
        }
    }

    /// Handle one event inline (the RPC entry point). All errors are
    /// caught: the engine logs, emits an error event, and leaves the
    /// session in its prior state.
    pub async fn handle(&self, event: ContinuationEvent) {
        self.handle_envelope(event.into()).await;
    }

    async fn handle_envelope(&self, envelope: EngineEvent) {
        if !self.config.enabled {
            debug!("[Engine] Disabled, ignoring event for {}", envelope.event.session);
            return;
        }

        let session = envelope.event.session.clone();
        let state = self.session_state(&session).await;
        // Serializes this session's ANALYZING → ACTING transition;
        // tokio's mutex is FIFO so events stay in arrival order
        let mut guard = state.lock().await;

        if guard.phase == SessionPhase::Escalated {
            debug!("[Engine] Session {} escalated, ignoring event", session);
            return;
        }
        let prior_phase = guard.phase;
        guard.phase = SessionPhase::Analyzing;

        let outcome = tokio::time::timeout(
            Duration::from_secs(HANDLE_TIMEOUT_SECS),
            self.analyze_and_act(&envelope, &mut guard),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                if guard.phase == SessionPhase::Analyzing || guard.phase == SessionPhase::Acting {
                    guard.phase = SessionPhase::Monitored;
                }
            }
            Ok(Err(e)) => {
                error!(
                    "[Engine] handle failed for {} ({:?}): {}",
                    session, envelope.event.trigger, e
                );
                guard.phase = prior_phase;
                if self.config.notify_on_error {
                    self.notify(
                        NotificationRecord::new(
                            NotificationKind::EngineError,
                            format!("continuation failed: {e}"),
                        )
                        .for_session(session.clone()),
                    )
                    .await;
                }
            }
            Err(_) => {
                error!(
                    "[Engine] handle timed out after {}s for {}",
                    HANDLE_TIMEOUT_SECS, session
                );
                guard.phase = prior_phase;
            }
        }
    }

    async fn analyze_and_act(
        &self,
        envelope: &EngineEvent,
        state: &mut SessionState,
    ) -> Result<()> {
        let event = &envelope.event;
        let session = &event.session;

        // Step 2: capture output and current task
        let (output, cursor) = self.deps.port.capture_output(session, None).await?;
        let mut task = self.deps.repo.current_for(session).await?;
        if let (Some(task), Some(max)) = (task.as_mut(), state.max_iterations_override) {
            task.max_iterations = max;
        }

        // Step 3: classify
        let analysis = self.deps.analyzer.analyze(&AnalysisInput {
            session,
            output: &output,
            current_task: task.as_ref(),
            exit_code: event.exit_code,
            previous_output_len: state.last_cursor.0 as usize,
        });
        state.last_cursor = cursor;
        state.last_analysis = Some(analysis.clone());

        let recommendation = envelope.preseeded.unwrap_or(analysis.recommendation);

        // Step 5: budget guard runs before any injection
        if matches!(
            recommendation,
            Recommendation::InjectPrompt | Recommendation::RetryWithHints
        ) {
            let (agent_id, project) = match self.deps.registry.get(session).await {
                Some(agent) => (agent.agent_id, agent.project_path),
                None => (session.to_string(), String::new()),
            };
            if !self.deps.budget.is_within_budget(&agent_id, &project).await? {
                info!(
                    "[Engine] Budget exceeded for {}, downgrading to owner notification",
                    agent_id
                );
                state.phase = SessionPhase::Paused;
                let action = ContinuationAction::NotifyOwner {
                    reason: "budget_exceeded".to_string(),
                };
                return self.act(session, action, &analysis, state).await;
            }
        }

        // Step 4: build the action for the recommendation
        let action = match recommendation {
            Recommendation::InjectPrompt => match &task {
                Some(task) => {
                    let bumped = self
                        .deps
                        .repo
                        .update_with(&task.id, Box::new(|t| t.iterations += 1))
                        .await?;
                    ContinuationAction::InjectPrompt {
                        prompt: prompts::render_continuation(&bumped, &analysis)?,
                        task_id: bumped.id,
                    }
                }
                None => {
                    debug!("[Engine] No current task for {}, nothing to continue", session);
                    ContinuationAction::NoAction
                }
            },
            Recommendation::AssignNextTask => {
                if self.config.auto_assign_next {
                    ContinuationAction::AssignNextTask
                } else {
                    ContinuationAction::NotifyOwner {
                        reason: "task complete; auto-assignment disabled".to_string(),
                    }
                }
            }
            Recommendation::NotifyOwner => ContinuationAction::NotifyOwner {
                reason: analysis
                    .evidence
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "agent needs attention".to_string()),
            },
            Recommendation::RetryWithHints => match &task {
                Some(task) => {
                    let bumped = self
                        .deps
                        .repo
                        .update_with(&task.id, Box::new(|t| t.iterations += 1))
                        .await?;
                    let hint = analysis
                        .evidence
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "previous attempt failed".to_string());
                    ContinuationAction::RetryWithHints {
                        prompt: prompts::render_retry(&bumped, &hint)?,
                        task_id: bumped.id,
                    }
                }
                None => ContinuationAction::NoAction,
            },
            Recommendation::PauseAgent => ContinuationAction::PauseAgent {
                reason: analysis
                    .evidence
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "paused by analyzer".to_string()),
            },
            Recommendation::NoAction => ContinuationAction::NoAction,
        };

        state.phase = SessionPhase::Acting;
        self.act(session, action, &analysis, state).await
    }

    /// Execute one action. Exhaustive over the action type.
    async fn act(
        &self,
        session: &SessionRef,
        action: ContinuationAction,
        analysis: &AgentStateAnalysis,
        state: &mut SessionState,
    ) -> Result<()> {
        state.last_action_at = Some(chrono::Utc::now());
        match action {
            ContinuationAction::InjectPrompt { prompt, task_id } => {
                state.last_action = Some(Recommendation::InjectPrompt);
                // Restart the assistant runtime if the adapter reports
                // it gone; injection into a dead session is wasted
                self.deps.port.ensure_runtime(session).await?;
                self.deps
                    .port
                    .write_input(session, &format!("{prompt}\n"))
                    .await?;
                info!(
                    "[Engine] Injected continuation prompt for task {} into {}",
                    task_id, session
                );
            }
            ContinuationAction::AssignNextTask => {
                state.last_action = Some(Recommendation::AssignNextTask);
                // The completion signature already matched; close out
                // the current task before assigning the next one
                if let Some(current) = self.deps.repo.current_for(session).await? {
                    self.deps
                        .repo
                        .update_with(
                            &current.id,
                            Box::new(|t| {
                                if t.status == TaskStatus::InProgress {
                                    t.status = TaskStatus::Completed;
                                }
                            }),
                        )
                        .await?;
                    info!("[Engine] Task {} completed on {}", current.id, session);
                }
                let result = self.deps.assigner.assign_next_task(session).await?;
                debug!("[Engine] Assignment result for {}: {:?}", session, result);
            }
            ContinuationAction::NotifyOwner { reason } => {
                state.last_action = Some(Recommendation::NotifyOwner);
                self.notify(
                    NotificationRecord::new(NotificationKind::Continuation, reason)
                        .for_session(session.clone())
                        .with_analysis(analysis.clone()),
                )
                .await;
            }
            ContinuationAction::RetryWithHints { prompt, task_id } => {
                state.last_action = Some(Recommendation::RetryWithHints);
                self.deps.port.ensure_runtime(session).await?;
                self.deps
                    .port
                    .write_input(session, &format!("{prompt}\n"))
                    .await?;
                info!(
                    "[Engine] Injected retry prompt for task {} into {}",
                    task_id, session
                );
            }
            ContinuationAction::PauseAgent { reason } => {
                state.last_action = Some(Recommendation::PauseAgent);
                state.phase = SessionPhase::Paused;
                warn!("[Engine] Paused session {}: {}", session, reason);
                if self.config.notify_on_max {
                    self.notify(
                        NotificationRecord::new(
                            NotificationKind::Continuation,
                            format!("session paused: {reason}"),
                        )
                        .for_session(session.clone())
                        .with_analysis(analysis.clone()),
                    )
                    .await;
                }
            }
            ContinuationAction::NoAction => {
                state.last_action = Some(Recommendation::NoAction);
            }
        }
        Ok(())
    }

    /// Override the iteration cap for a session's tasks.
    pub async fn set_max_iterations(&self, session: &SessionRef, max: u32) -> Result<()> {
        let state = self.session_state(session).await;
        state.lock().await.max_iterations_override = Some(max);
        if let Some(task) = self.deps.repo.current_for(session).await? {
            self.deps
                .repo
                .update_with(&task.id, Box::new(move |t| t.max_iterations = max))
                .await?;
        }
        Ok(())
    }

    pub async fn get_session_status(&self, session: &SessionRef) -> Option<SessionStatus> {
        let sessions = self.sessions.read().await;
        let state = sessions.get(session)?;
        let guard = state.lock().await;
        Some(SessionStatus {
            phase: guard.phase,
            last_analysis: guard.last_analysis.clone(),
            last_action: guard.last_action,
            last_action_at: guard.last_action_at,
            max_iterations_override: guard.max_iterations_override,
        })
    }

    /// External resume for paused or escalated sessions.
    pub async fn resume_session(&self, session: &SessionRef) {
        let state = self.session_state(session).await;
        let mut guard = state.lock().await;
        if matches!(guard.phase, SessionPhase::Paused | SessionPhase::Escalated) {
            guard.phase = SessionPhase::Monitored;
            info!("[Engine] Session {} resumed", session);
        }
    }

    /// Escalate a session to a human; the engine will not touch it
    /// again until `resume_session`.
    pub async fn escalate_session(&self, session: &SessionRef, reason: &str) {
        let state = self.session_state(session).await;
        state.lock().await.phase = SessionPhase::Escalated;
        self.notify(
            NotificationRecord::new(
                NotificationKind::Continuation,
                format!("session escalated: {reason}"),
            )
            .for_session(session.clone()),
        )
        .await;
    }

    async fn session_state(&self, session: &SessionRef) -> Arc<Mutex<SessionState>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(state) = sessions.get(session) {
                return state.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::default())))
            .clone()
    }

    async fn notify(&self, record: NotificationRecord) {
        if let Err(e) = self.deps.notifier.notify(record).await {
            warn!("[Engine] Notification failed: {}", e);
        }
    }
}
