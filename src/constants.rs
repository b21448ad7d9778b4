//! System-wide configuration values
//!
//! Defaults here are overridable through [`crate::config::Config`] or the
//! per-project YAML files; the constants are the documented fallbacks.

// ⚙️ CONTINUATION ENGINE
/// Maximum continuation iterations per task before the analyzer
/// recommends pausing the agent.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Upper bound on one `handle(event)` pass, including output capture,
/// analysis, and prompt injection. A session's ACTING transition may not
/// be re-entered until the prior one completes or hits this deadline.
pub const HANDLE_TIMEOUT_SECS: u64 = 60;

/// Bound on the per-session event queue. Duplicate idle-timeout events
/// for a session already queued are dropped rather than enqueued.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

// 🚧 QUALITY GATES
/// Per-gate default timeout when the project config omits one.
pub const DEFAULT_GATE_TIMEOUT_MS: u64 = 60_000;

/// Default timeout for the `tests` gate.
pub const TESTS_GATE_TIMEOUT_MS: u64 = 120_000;

/// Default timeout for the `build` gate.
pub const BUILD_GATE_TIMEOUT_MS: u64 = 180_000;

/// Aggregate ceiling for a full `run_all` pass.
pub const TOTAL_GATE_TIMEOUT_MS: u64 = 300_000;

/// Captured gate output beyond this is truncated, preserving head and
/// tail around an elision marker.
pub const GATE_OUTPUT_MAX_BYTES: usize = 16 * 1024;

/// Concurrent gate subprocesses in parallel mode.
pub const GATE_WORKER_POOL_SIZE: usize = 4;

// ⏱️ PERIODIC CHECKER
/// One-shot initial check-in after a session starts.
pub const INITIAL_CHECK_DELAY_SECS: u64 = 5 * 60;

/// Recurring progress check interval.
pub const PROGRESS_CHECK_INTERVAL_SECS: u64 = 30 * 60;

/// Recurring commit reminder interval.
pub const COMMIT_REMINDER_INTERVAL_SECS: u64 = 25 * 60;

/// Adaptive scheduling bounds and factor (see `scheduler::AdaptiveInterval`).
pub const ADAPTIVE_MIN_INTERVAL_SECS: u64 = 60;
pub const ADAPTIVE_MAX_INTERVAL_SECS: u64 = 60 * 60;
pub const ADAPTIVE_FACTOR: f64 = 2.0;

// 💾 STATE CHECKPOINTER
/// Periodic checkpoint interval.
pub const CHECKPOINT_INTERVAL_MS: u64 = 60_000;

/// A conversation retains at most this many recent messages in a
/// snapshot; older turns collapse into the summary field.
pub const MAX_PERSISTED_MESSAGES: usize = 50;

/// Snapshot schema version written into every state file.
pub const STATE_VERSION: u32 = 1;

// 🔄 SELF-IMPROVEMENT
/// Reconciler gives up and forces rollback once the marker has been
/// picked up on more than this many startups.
pub const MAX_RESTART_COUNT: u32 = 3;

/// Completed markers kept in the history directory.
pub const MARKER_HISTORY_LIMIT: usize = 20;

/// Per-check default timeout during post-restart validation.
pub const VALIDATION_CHECK_TIMEOUT_SECS: u64 = 300;

// 💰 BUDGET
/// Warning threshold when a budget block omits one.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

// 📁 ON-DISK LAYOUT (all under the crewly home, default `~/.crewly`)
pub const CREWLY_DIR: &str = ".crewly";
pub const USAGE_DIR: &str = "usage";
pub const STATE_DIR: &str = "state";
pub const STATE_FILE: &str = "orchestrator-state.json";
pub const STATE_BACKUP_DIR: &str = "backups";
pub const SELF_IMPROVEMENT_DIR: &str = "self-improvement";
pub const MARKER_FILE: &str = "pending.json";
pub const MARKER_HISTORY_DIR: &str = "history";
pub const MARKER_BACKUP_DIR: &str = "backups";
pub const BUDGETS_FILE: &str = "budgets.yaml";
/// Project-relative quality gate config path.
pub const GATES_CONFIG_RELPATH: &str = ".crewly/config/quality-gates.yaml";
