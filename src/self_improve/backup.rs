//! Backup store for self-improvement targets.
//!
//! Pre-change copies of target files keyed by marker id, each with a
//! SHA-256 checksum recorded in the marker. Restore reverses the
//! change set: backed-up files are copied back, files that did not
//! exist before are deleted.

use super::types::BackupFileRecord;
use crate::constants::MARKER_BACKUP_DIR;
use crate::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            dir: base_dir.join(MARKER_BACKUP_DIR),
        }
    }

    /// Copy `target` (relative to `root`) into the backup store for
    /// `marker_id` and return its record. Absent targets yield a
    /// record with `existed: false`.
    pub async fn backup_file(
        &self,
        marker_id: &str,
        root: &Path,
        target: &str,
    ) -> Result<BackupFileRecord> {
        let source = root.join(target);
        if !source.exists() {
            return Ok(BackupFileRecord {
                original_path: target.to_string(),
                backup_path: String::new(),
                checksum: String::new(),
                existed: false,
            });
        }

        let contents = tokio::fs::read(&source).await?;
        let checksum = hex_digest(&contents);

        let backup_dir = self.dir.join(marker_id);
        tokio::fs::create_dir_all(&backup_dir).await?;
        let backup_path = backup_dir.join(sanitize_name(target));
        tokio::fs::write(&backup_path, &contents).await?;

        info!(
            "[BackupStore] Backed up {} ({} bytes, {})",
            target,
            contents.len(),
            &checksum[..12]
        );
        Ok(BackupFileRecord {
            original_path: target.to_string(),
            backup_path: backup_path.display().to_string(),
            checksum,
            existed: true,
        })
    }

    /// Restore one record: copy the backup over the target, or delete
    /// the target if it had not existed. Returns whether the target
    /// was touched.
    pub async fn restore_file(&self, root: &Path, record: &BackupFileRecord) -> Result<bool> {
        let target = root.join(&record.original_path);
        if !record.existed {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {
                    info!(
                        "[BackupStore] Removed {} (did not exist before change)",
                        record.original_path
                    );
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }

        let contents = tokio::fs::read(&record.backup_path).await?;
        let checksum = hex_digest(&contents);
        if checksum != record.checksum {
            warn!(
                "[BackupStore] Checksum mismatch restoring {} (backup may be corrupt)",
                record.original_path
            );
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &contents).await?;
        info!("[BackupStore] Restored {}", record.original_path);
        Ok(true)
    }

    /// Drop the backup directory for a finished marker.
    pub async fn cleanup(&self, marker_id: &str) {
        let dir = self.dir.join(marker_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "[BackupStore] Failed to clean up backups for {}: {}",
                    marker_id, e
                );
            }
        }
    }
}

fn hex_digest(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    format!("{:x}", hasher.finalize())
}

/// Flatten a relative path into a single file name.
fn sanitize_name(target: &str) -> String {
    target.replace(['/', '\\'], "__")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backup_and_restore_existing_file() {
        let store_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = BackupStore::new(store_dir.path().to_path_buf());

        std::fs::create_dir_all(root.path().join("src")).unwrap();
        std::fs::write(root.path().join("src/engine.ts"), "original body").unwrap();

        let record = store
            .backup_file("imp-1", root.path(), "src/engine.ts")
            .await
            .unwrap();
        assert!(record.existed);
        assert_eq!(record.checksum.len(), 64);

        // Mutate, then restore
        std::fs::write(root.path().join("src/engine.ts"), "broken body").unwrap();
        let restored = store.restore_file(root.path(), &record).await.unwrap();
        assert!(restored);
        assert_eq!(
            std::fs::read_to_string(root.path().join("src/engine.ts")).unwrap(),
            "original body"
        );
    }

    #[tokio::test]
    async fn test_absent_target_round_trip() {
        let store_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = BackupStore::new(store_dir.path().to_path_buf());

        let record = store
            .backup_file("imp-1", root.path(), "src/new_module.ts")
            .await
            .unwrap();
        assert!(!record.existed);
        assert!(record.checksum.is_empty());

        // The change created the file; restore deletes it
        std::fs::create_dir_all(root.path().join("src")).unwrap();
        std::fs::write(root.path().join("src/new_module.ts"), "created").unwrap();
        let touched = store.restore_file(root.path(), &record).await.unwrap();
        assert!(touched);
        assert!(!root.path().join("src/new_module.ts").exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_marker_backups() {
        let store_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = BackupStore::new(store_dir.path().to_path_buf());

        std::fs::write(root.path().join("a.ts"), "x").unwrap();
        store.backup_file("imp-1", root.path(), "a.ts").await.unwrap();
        store.cleanup("imp-1").await;
        assert!(!store_dir
            .path()
            .join(MARKER_BACKUP_DIR)
            .join("imp-1")
            .exists());
    }
}
