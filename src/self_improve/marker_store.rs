//! Persistent marker store.
//!
//! A single pending marker at `pending.json` plus a bounded history
//! directory. Writes go through a temp file and rename under a global
//! lock, so readers always see a complete marker and there is exactly
//! one writer at a time.

use super::types::{ImprovementMarker, MarkerOutcome};
use crate::constants::{MARKER_FILE, MARKER_HISTORY_DIR, MARKER_HISTORY_LIMIT};
use crate::{CrewlyError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone)]
pub struct MarkerStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl MarkerStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn pending_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    fn history_dir(&self) -> PathBuf {
        self.dir.join(MARKER_HISTORY_DIR)
    }

    /// The pending marker, or `None`.
    pub async fn load(&self) -> Result<Option<ImprovementMarker>> {
        let path = self.pending_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let marker = serde_json::from_str(&raw)?;
        Ok(Some(marker))
    }

    /// Persist the marker atomically.
    pub async fn save(&self, marker: &ImprovementMarker) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let payload = serde_json::to_vec_pretty(marker)?;
        let tmp = self.dir.join(format!(".{MARKER_FILE}.tmp"));
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, self.pending_path()).await?;
        Ok(())
    }

    /// Remove the pending marker (cancelled or stale).
    pub async fn delete_pending(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.pending_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// File the marker in history and remove it from pending. History
    /// is capped; the oldest entries are pruned.
    pub async fn move_to_history(
        &self,
        marker: &ImprovementMarker,
        outcome: MarkerOutcome,
    ) -> Result<()> {
        {
            let _guard = self.write_lock.lock().await;
            let history = self.history_dir();
            tokio::fs::create_dir_all(&history).await?;
            let name = format!("{}-{}.json", marker.id, outcome.suffix());
            tokio::fs::write(history.join(&name), serde_json::to_vec_pretty(marker)?).await?;
            info!("[MarkerStore] Filed marker {} as {}", marker.id, outcome.suffix());
        }
        self.delete_pending().await?;
        self.prune_history().await;
        Ok(())
    }

    /// Completed markers, newest first, with their outcome.
    pub async fn history(&self) -> Result<Vec<(ImprovementMarker, MarkerOutcome)>> {
        let history = self.history_dir();
        let mut entries = match std::fs::read_dir(&history) {
            Ok(dir) => dir
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect::<Vec<_>>(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        entries.sort_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH)
        });
        entries.reverse();

        let mut markers = Vec::new();
        for path in entries {
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<ImprovementMarker>(&raw) {
                Ok(marker) => {
                    let outcome = if path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .is_some_and(|s| s.ends_with("-success"))
                    {
                        MarkerOutcome::Success
                    } else {
                        MarkerOutcome::Failed
                    };
                    markers.push((marker, outcome));
                }
                Err(e) => warn!(
                    "[MarkerStore] Skipping unreadable history entry {}: {}",
                    path.display(),
                    e
                ),
            }
        }
        Ok(markers)
    }

    /// Reject a new plan while another marker is still in flight.
    pub async fn ensure_no_pending(&self) -> Result<()> {
        if let Some(existing) = self.load().await? {
            if !existing.is_complete() {
                return Err(CrewlyError::MarkerConflict(format!(
                    "marker {} is in phase {}",
                    existing.id,
                    existing.phase.as_str()
                )));
            }
        }
        Ok(())
    }

    async fn prune_history(&self) {
        let history = self.history_dir();
        let Ok(dir) = std::fs::read_dir(&history) else {
            return;
        };
        let mut entries: Vec<_> = dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        if entries.len() <= MARKER_HISTORY_LIMIT {
            return;
        }
        entries.sort_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH)
        });
        let excess = entries.len() - MARKER_HISTORY_LIMIT;
        for path in entries.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(
                    "[MarkerStore] Failed to prune history entry {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_improve::types::{ImprovementPhase, RiskLevel, ValidationState};

    fn marker(id: &str, phase: ImprovementPhase) -> ImprovementMarker {
        ImprovementMarker {
            id: id.to_string(),
            description: "test improvement".to_string(),
            phase,
            restart_count: 0,
            target_files: vec!["src/services/engine.ts".to_string()],
            backup: None,
            changes: Vec::new(),
            validation: ValidationState::default(),
            rollback: None,
            slack: None,
            error: None,
            risk_level: RiskLevel::Medium,
            requires_restart: true,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path().to_path_buf());

        assert!(store.load().await.unwrap().is_none());

        store
            .save(&marker("imp-1", ImprovementPhase::Planning))
            .await
            .unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.id, "imp-1");
        assert_eq!(loaded.phase, ImprovementPhase::Planning);

        store.delete_pending().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_detection() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path().to_path_buf());

        store.ensure_no_pending().await.unwrap();
        store
            .save(&marker("imp-1", ImprovementPhase::ChangesApplied))
            .await
            .unwrap();

        let err = store.ensure_no_pending().await.unwrap_err();
        assert!(matches!(err, CrewlyError::MarkerConflict(_)));
    }

    #[tokio::test]
    async fn test_history_filing_and_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path().to_path_buf());

        let m = marker("imp-1", ImprovementPhase::Complete);
        store.save(&m).await.unwrap();
        store
            .move_to_history(&m, MarkerOutcome::Success)
            .await
            .unwrap();

        assert!(store.load().await.unwrap().is_none());
        let history = store.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].0.id, "imp-1");
        assert_eq!(history[0].1, MarkerOutcome::Success);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path().to_path_buf());

        for i in 0..(MARKER_HISTORY_LIMIT + 5) {
            let m = marker(&format!("imp-{i}"), ImprovementPhase::Complete);
            store
                .move_to_history(&m, MarkerOutcome::Failed)
                .await
                .unwrap();
        }

        let history = store.history().await.unwrap();
        assert!(history.len() <= MARKER_HISTORY_LIMIT);
    }
}
