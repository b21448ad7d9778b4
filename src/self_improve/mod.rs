//! 🔄 Self-improvement: safe mutation of the orchestrator's own source
//! across hot-reload restarts.
//!
//! The subsystem is built around a single persistent marker file. The
//! driver plans and applies changes; an external watcher restarts the
//! process; the startup reconciler (which runs before every other
//! subsystem) validates the changes and either completes the
//! improvement or rolls the files back.
//!
//! # Safety guarantees
//!
//! 1. At most one non-complete marker exists at any time.
//! 2. The backup is persisted strictly before any target file mutates.
//! 3. Validation and rollback both resume cleanly after a crash.
//! 4. A marker that keeps crashing the process is force-rolled-back
//!    after `MAX_RESTART_COUNT` startups.

mod backup;
mod driver;
mod git_ops;
mod marker_store;
mod reconciler;
mod types;
mod validation;

pub use backup::BackupStore;
pub use driver::{
    ExecuteResponse, PlanRequest, PlanResponse, ProposedChange, SelfImprovementDriver,
};
pub use git_ops::{GitCheckpoint, GitOperations};
pub use marker_store::MarkerStore;
pub use reconciler::{ReconcileDisposition, ReconcileOutcome, StartupReconciler};
pub use types::{
    BackupFileRecord, BackupInfo, ChangeType, ImprovementMarker, ImprovementPhase, MarkerOutcome,
    PlannedChange, RiskLevel, RollbackInfo, SlackThread, ValidationCheck, ValidationResult,
    ValidationState,
};
pub use validation::{default_checks, ValidationRunner, ValidationSettings};
