//! Self-improvement data structures.
//!
//! The [`ImprovementMarker`] is the single JSON record that makes a
//! code change to the orchestrator itself survive a process restart.
//! All types serialize for persistence.
//!
//! # Phase machine
//!
//! `planning → backing_up → changes_applied → validating → complete`
//! with `rolling_back → rolled_back → complete` on any failure after
//! files were touched. At most one non-complete marker exists at any
//! time; `changes_applied` is never reached without a persisted
//! backup.

use serde::{Deserialize, Serialize};

/// Where the marker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementPhase {
    Planning,
    BackingUp,
    ChangesApplied,
    Validating,
    RollingBack,
    RolledBack,
    Complete,
}

impl ImprovementPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImprovementPhase::Planning => "planning",
            ImprovementPhase::BackingUp => "backing_up",
            ImprovementPhase::ChangesApplied => "changes_applied",
            ImprovementPhase::Validating => "validating",
            ImprovementPhase::RollingBack => "rolling_back",
            ImprovementPhase::RolledBack => "rolled_back",
            ImprovementPhase::Complete => "complete",
        }
    }
}

/// Startup risk of touching a set of files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
}

/// One file change in the plan. `content` carries the full new file
/// body for create/modify so an interrupted execute can resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedChange {
    pub file: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub applied: bool,
}

/// One backed-up target file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFileRecord {
    pub original_path: String,
    pub backup_path: String,
    /// SHA-256 of the backed-up content; empty when `existed` is false.
    pub checksum: String,
    pub existed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub files: Vec<BackupFileRecord>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One configured validation check command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub command: String,
    pub timeout_secs: u64,
    pub required: bool,
}

/// Outcome of one validation check, appended as it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub check: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationState {
    /// Names of the checks that must pass.
    pub required: Vec<String>,
    pub results: Vec<ValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackInfo {
    pub reason: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub files_restored: Vec<String>,
    pub git_reset: bool,
}

/// Slack thread to report progress into, carried across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackThread {
    pub channel_id: String,
    pub thread_ts: String,
    pub user_id: String,
}

/// The persistent marker. One non-complete marker at most; everything
/// the reconciler needs after a crash lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementMarker {
    pub id: String,
    pub description: String,
    pub phase: ImprovementPhase,
    /// Incremented by the reconciler on every startup that observes
    /// this marker.
    pub restart_count: u32,
    pub target_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupInfo>,
    pub changes: Vec<PlannedChange>,
    #[serde(default)]
    pub validation: ValidationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackThread>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub risk_level: RiskLevel,
    pub requires_restart: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ImprovementMarker {
    pub fn is_complete(&self) -> bool {
        self.phase == ImprovementPhase::Complete
    }
}

/// How a finished marker is filed in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerOutcome {
    Success,
    Failed,
}

impl MarkerOutcome {
    pub fn suffix(&self) -> &'static str {
        match self {
            MarkerOutcome::Success => "success",
            MarkerOutcome::Failed => "failed",
        }
    }
}

/// Classify startup risk by target path.
///
/// Root entry files, the package manifest, and compiler configuration
/// can prevent the process from starting at all; service and
/// controller layers can break behavior but not startup.
pub fn risk_level_for(target_files: &[String]) -> RiskLevel {
    let high_names = [
        "package.json",
        "tsconfig.json",
        "Cargo.toml",
    ];
    let high_prefixes = ["src/index.", "src/main.", "src/server."];

    let mut level = RiskLevel::Low;
    for target in target_files {
        let name = target.rsplit('/').next().unwrap_or(target);
        if high_names.contains(&name)
            || high_prefixes.iter().any(|p| target.starts_with(p))
        {
            return RiskLevel::High;
        }
        if target.contains("/services/")
            || target.contains("/controllers/")
            || target.contains("/middleware/")
        {
            level = RiskLevel::Medium;
        }
    }
    level
}

/// Whether changing these files requires a process restart to take
/// effect (running code or the manifest, as opposed to docs/config
/// read on demand).
pub fn requires_restart_for(target_files: &[String]) -> bool {
    target_files.iter().any(|target| {
        let name = target.rsplit('/').next().unwrap_or(target);
        name == "package.json"
            || name == "Cargo.toml"
            || [".ts", ".js", ".mjs", ".rs"]
                .iter()
                .any(|ext| target.ends_with(ext))
    })
}
