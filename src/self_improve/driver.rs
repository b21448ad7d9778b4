//! Self-improvement driver: the plan / execute / cancel / status /
//! history surface.
//!
//! Plan touches no files. Execute backs everything up, persists the
//! backup into the marker strictly before the first target-file
//! mutation, applies the changes, and stops at `changes_applied` —
//! validation belongs to the next startup's reconciler, because the
//! process is expected to be restarted by an external watcher once
//! its own source changed.

use super::backup::BackupStore;
use super::git_ops::GitOperations;
use super::marker_store::MarkerStore;
use super::types::{
    BackupInfo, ChangeType, ImprovementMarker, ImprovementPhase, MarkerOutcome, PlannedChange,
    RiskLevel, SlackThread, ValidationState, requires_restart_for, risk_level_for,
};
use crate::checkpoint::{CheckpointReason, SelfImprovementStatus, StateCheckpointer};
use crate::notify::{NotificationKind, NotificationRecord, Notifier};
use crate::{CrewlyError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One proposed change in a plan request.
#[derive(Debug, Clone)]
pub struct ProposedChange {
    pub file: String,
    pub change_type: ChangeType,
    pub description: String,
    /// Full new file body; required for create/modify.
    pub content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub description: String,
    pub target_files: Vec<String>,
    pub changes: Vec<ProposedChange>,
    pub slack: Option<SlackThread>,
}

#[derive(Debug, Clone)]
pub struct PlanResponse {
    pub marker_id: String,
    pub risk_level: RiskLevel,
    pub requires_restart: bool,
}

#[derive(Debug, Clone)]
pub struct ExecuteResponse {
    pub marker_id: String,
    pub phase: ImprovementPhase,
    pub changes_applied: usize,
    /// Set when a post-backup failure was recorded into the marker
    /// for the reconciler instead of being raised.
    pub recorded_error: Option<String>,
}

#[derive(Clone)]
pub struct SelfImprovementDriver {
    store: MarkerStore,
    backup: BackupStore,
    repo_root: PathBuf,
    notifier: Arc<dyn Notifier>,
    checkpointer: Option<StateCheckpointer>,
}

impl SelfImprovementDriver {
    pub fn new(
        store: MarkerStore,
        backup: BackupStore,
        repo_root: PathBuf,
        notifier: Arc<dyn Notifier>,
        checkpointer: Option<StateCheckpointer>,
    ) -> Self {
        Self {
            store,
            backup,
            repo_root,
            notifier,
            checkpointer,
        }
    }

    /// Create the marker in `planning`. No files are touched.
    pub async fn plan(&self, request: PlanRequest) -> Result<PlanResponse> {
        self.store.ensure_no_pending().await?;

        if request.changes.is_empty() {
            return Err(CrewlyError::Validation(
                "a plan needs at least one change".to_string(),
            ));
        }
        for change in &request.changes {
            if matches!(change.change_type, ChangeType::Create | ChangeType::Modify)
                && change.content.is_none()
            {
                return Err(CrewlyError::Validation(format!(
                    "change for {} needs content",
                    change.file
                )));
            }
        }

        let mut target_files = request.target_files;
        for change in &request.changes {
            if !target_files.contains(&change.file) {
                target_files.push(change.file.clone());
            }
        }

        let risk_level = risk_level_for(&target_files);
        let requires_restart = requires_restart_for(&target_files);

        let marker = ImprovementMarker {
            id: format!("imp-{}", Uuid::new_v4()),
            description: request.description,
            phase: ImprovementPhase::Planning,
            restart_count: 0,
            target_files,
            backup: None,
            changes: request
                .changes
                .into_iter()
                .map(|c| PlannedChange {
                    file: c.file,
                    change_type: c.change_type,
                    description: c.description,
                    content: c.content,
                    applied: false,
                })
                .collect(),
            validation: ValidationState::default(),
            rollback: None,
            slack: request.slack,
            error: None,
            risk_level,
            requires_restart,
            created_at: chrono::Utc::now(),
        };
        self.store.save(&marker).await?;

        info!(
            "[SelfImprove] Planned {} ({:?} risk, restart: {})",
            marker.id, risk_level, requires_restart
        );
        Ok(PlanResponse {
            marker_id: marker.id,
            risk_level,
            requires_restart,
        })
    }

    /// Apply the planned changes. Setup failures before the backup is
    /// persisted raise; anything after is recorded into the marker and
    /// left for the reconciler.
    pub async fn execute(&self) -> Result<ExecuteResponse> {
        let mut marker = self
            .store
            .load()
            .await?
            .ok_or_else(|| CrewlyError::NotFound("no pending improvement marker".to_string()))?;

        if marker.phase != ImprovementPhase::Planning {
            return Err(CrewlyError::MarkerConflict(format!(
                "execute requires phase planning, marker {} is in {}",
                marker.id,
                marker.phase.as_str()
            )));
        }

        marker.phase = ImprovementPhase::BackingUp;
        self.store.save(&marker).await?;

        // Git checkpoint is best-effort; file backups are the floor
        let git_checkpoint = if GitOperations::is_available(&self.repo_root) {
            match GitOperations::checkpoint(&self.repo_root) {
                Ok(checkpoint) => Some(checkpoint),
                Err(e) => {
                    warn!("[SelfImprove] Git checkpoint failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut files = Vec::with_capacity(marker.target_files.len());
        for target in &marker.target_files {
            files.push(
                self.backup
                    .backup_file(&marker.id, &self.repo_root, target)
                    .await?,
            );
        }

        marker.backup = Some(BackupInfo {
            git_commit: git_checkpoint.as_ref().map(|c| c.commit.clone()),
            git_branch: git_checkpoint.map(|c| c.branch),
            files,
            created_at: chrono::Utc::now(),
        });
        // 🔒 ORDERING: the marker with its backup reaches disk before
        // any target file is mutated
        self.store.save(&marker).await?;

        if let Some(checkpointer) = &self.checkpointer {
            checkpointer
                .set_self_improvement(Some(SelfImprovementStatus {
                    marker_id: marker.id.clone(),
                    phase: marker.phase.as_str().to_string(),
                    description: marker.description.clone(),
                }))
                .await;
            if let Err(e) = checkpointer
                .save_state(CheckpointReason::SelfImprovement)
                .await
            {
                warn!("[SelfImprove] Pre-change checkpoint failed: {}", e);
            }
        }

        // From here on, failures are the reconciler's problem
        match self.apply_changes(&mut marker).await {
            Ok(applied) => {
                marker.phase = ImprovementPhase::ChangesApplied;
                self.store.save(&marker).await?;
                self.notify(&format!(
                    "improvement {} applied {} change(s), awaiting restart validation",
                    marker.id, applied
                ))
                .await;
                Ok(ExecuteResponse {
                    marker_id: marker.id,
                    phase: ImprovementPhase::ChangesApplied,
                    changes_applied: applied,
                    recorded_error: None,
                })
            }
            Err(e) => {
                error!("[SelfImprove] Apply failed, recorded for reconciler: {}", e);
                // Some target files may already be mutated; the marker
                // must route to the rollback path, not to the
                // nothing-happened cancellation path
                marker.phase = ImprovementPhase::ChangesApplied;
                marker.error = Some(format!("apply failed: {e}"));
                self.store.save(&marker).await?;
                self.notify(&format!(
                    "improvement {} failed mid-apply: {e}; rollback on next startup",
                    marker.id
                ))
                .await;
                Ok(ExecuteResponse {
                    marker_id: marker.id,
                    phase: marker.phase,
                    changes_applied: marker.changes.iter().filter(|c| c.applied).count(),
                    recorded_error: Some(e.to_string()),
                })
            }
        }
    }

    async fn apply_changes(&self, marker: &mut ImprovementMarker) -> Result<usize> {
        let mut applied = 0;
        for index in 0..marker.changes.len() {
            if marker.changes[index].applied {
                applied += 1;
                continue;
            }
            let change = marker.changes[index].clone();
            let path = self.repo_root.join(&change.file);
            match change.change_type {
                ChangeType::Create | ChangeType::Modify => {
                    let content = change.content.as_deref().ok_or_else(|| {
                        CrewlyError::Validation(format!("change for {} has no content", change.file))
                    })?;
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&path, content).await?;
                }
                ChangeType::Delete => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
            marker.changes[index].applied = true;
            applied += 1;
            self.store.save(marker).await?;
            info!("[SelfImprove] Applied change to {}", change.file);
        }
        Ok(applied)
    }

    /// Abort a plan that has not touched any files.
    pub async fn cancel(&self) -> Result<()> {
        let marker = self
            .store
            .load()
            .await?
            .ok_or_else(|| CrewlyError::NotFound("no pending improvement marker".to_string()))?;

        match marker.phase {
            ImprovementPhase::Planning | ImprovementPhase::BackingUp => {
                self.store.delete_pending().await?;
                self.notify(&format!("improvement {} cancelled", marker.id)).await;
                Ok(())
            }
            phase => Err(CrewlyError::MarkerConflict(format!(
                "cannot cancel marker {} in phase {}; rollback happens at next startup",
                marker.id,
                phase.as_str()
            ))),
        }
    }

    pub async fn status(&self) -> Result<Option<ImprovementMarker>> {
        self.store.load().await
    }

    pub async fn history(&self) -> Result<Vec<(ImprovementMarker, MarkerOutcome)>> {
        self.store.history().await
    }

    async fn notify(&self, reason: &str) {
        let record = NotificationRecord::new(NotificationKind::SelfImprovement, reason);
        if let Err(e) = self.notifier.notify(record).await {
            warn!("[SelfImprove] Notification failed: {}", e);
        }
    }
}
