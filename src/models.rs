use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque reference to a pseudo-terminal session hosting an agent.
///
/// Sessions are created and destroyed by an external session manager;
/// the core holds only the reference and performs all I/O through
/// [`crate::session::SessionPort`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef(pub String);

impl SessionRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role an agent fills when matching tasks (e.g. "developer", "qa").
///
/// Role hierarchy and exclusivity are evaluated by the auto-assigner's
/// match rules, not by the role itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRole(pub String);

impl AgentRole {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One agent bound to one session.
///
/// `status` is derived from session liveness and engine state; it is
/// never persisted as a source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub session: SessionRef,
    pub agent_id: String,
    pub role: AgentRole,
    pub project_path: String,
    pub status: AgentStatus,
}

/// Derived agent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Busy,
    Idle,
    Error,
}

/// A unit of work assigned to agents.
///
/// Tasks are the fundamental unit of the continuation loop. Iterations
/// count continuation cycles and are monotonically nondecreasing; a
/// task reaches `Completed` only after its required quality gates pass
/// (unless gates were explicitly bypassed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    /// Role required to pick this task up, if restricted.
    pub required_role: Option<AgentRole>,
    /// Task ids that must complete before this task is eligible.
    pub dependencies: Vec<String>,
    /// Optional type tag matched against assignment rules.
    pub task_type: Option<String>,
    /// Optional deadline used by deadline prioritization.
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub iterations: u32,
    pub max_iterations: u32,
    /// Last-run snapshot per quality gate, persisted by `complete_task`.
    pub quality_gate_results: Vec<GateResult>,
    /// Free-form progress note enabling resume-from-checkpoint.
    pub checkpoint: Option<String>,
    /// Lessons recorded at completion, surfaced in continuation prompts.
    pub learnings: Vec<String>,
    /// Session currently working the task, if any.
    pub session: Option<SessionRef>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    /// Creates an open task with defaults and a fresh id.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Open,
            priority: Priority::Medium,
            required_role: None,
            dependencies: Vec::new(),
            task_type: None,
            deadline: None,
            iterations: 0,
            max_iterations: crate::constants::DEFAULT_MAX_ITERATIONS,
            quality_gate_results: Vec::new(),
            checkpoint: None,
            learnings: Vec::new(),
            session: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.required_role = Some(role);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Paused,
    Completed,
}

/// Task priority levels. Higher priorities are assigned first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank for sorting; larger means more urgent.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// What caused a continuation pass for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationTrigger {
    IdleTimeout,
    ProcessExit,
    ExplicitRequest,
    ScheduledCheck,
}

/// A single detection signal consumed by the continuation engine.
///
/// Events are immutable and never persisted; losing one is acceptable
/// (the next idle timeout or scheduled check regenerates the signal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationEvent {
    pub session: SessionRef,
    pub trigger: ContinuationTrigger,
    pub exit_code: Option<i32>,
    pub last_output_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ts: chrono::DateTime<chrono::Utc>,
}

impl ContinuationEvent {
    pub fn new(session: SessionRef, trigger: ContinuationTrigger) -> Self {
        Self {
            session,
            trigger,
            exit_code: None,
            last_output_at: None,
            ts: chrono::Utc::now(),
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

/// What the analyzer concluded about an agent's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisConclusion {
    TaskComplete,
    Incomplete,
    StuckOrError,
    WaitingForInput,
    Unknown,
}

/// What the engine should do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    InjectPrompt,
    AssignNextTask,
    NotifyOwner,
    RetryWithHints,
    PauseAgent,
    NoAction,
}

/// Result of classifying captured session output.
///
/// A pure function of its inputs; cacheable by
/// `(session, output hash, task id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateAnalysis {
    pub conclusion: AnalysisConclusion,
    /// Heuristic over the count of matched signatures, in `[0, 1]`.
    pub confidence: f64,
    /// Human-readable reasons, most significant first.
    pub evidence: Vec<String>,
    pub recommendation: Recommendation,
    pub iterations: u32,
    pub max_iterations: u32,
}

/// Outcome of one quality gate execution, persisted onto the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub required: bool,
    pub duration_ms: u64,
    /// Captured stdout+stderr, truncated head and tail.
    pub output: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One append-only usage ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub agent_id: String,
    pub session: SessionRef,
    pub project_path: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    /// Opaque operation tag ("continuation", "skill:web-search", ...).
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}
