//! Git operations for self-improvement checkpoints and rollback.
//!
//! All commands use explicit argument arrays against a given repo
//! root; no shell strings and no reliance on process cwd. Git being
//! unavailable is not an error for callers — backup-file restore is
//! the fallback path.

use crate::{CrewlyError, Result};
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

/// A captured git position to roll back to.
#[derive(Debug, Clone)]
pub struct GitCheckpoint {
    pub commit: String,
    pub branch: String,
}

pub struct GitOperations;

impl GitOperations {
    /// Whether `root` is a usable git work tree.
    pub fn is_available(root: &Path) -> bool {
        Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(root)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Record the current commit and branch.
    pub fn checkpoint(root: &Path) -> Result<GitCheckpoint> {
        let commit = Self::capture(root, &["rev-parse", "HEAD"])?;
        let branch = Self::capture(root, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        info!(
            "[GitOps] Checkpoint at {} on branch {}",
            &commit[..commit.len().min(12)],
            branch
        );
        Ok(GitCheckpoint { commit, branch })
    }

    /// Current branch name, for gate `runOn` filtering.
    pub fn current_branch(root: &Path) -> Option<String> {
        Self::capture(root, &["rev-parse", "--abbrev-ref", "HEAD"]).ok()
    }

    /// Hard-reset the work tree to `commit`.
    pub fn reset_hard(root: &Path, commit: &str) -> Result<()> {
        // Commits come from our own rev-parse output; reject anything
        // that does not look like one anyway
        if !commit.chars().all(|c| c.is_ascii_hexdigit()) || commit.len() < 7 {
            return Err(CrewlyError::Git {
                message: format!("refusing reset to suspicious ref '{commit}'"),
            });
        }

        let output = Command::new("git")
            .args(["reset", "--hard", commit])
            .current_dir(root)
            .output()
            .map_err(|e| CrewlyError::Git {
                message: format!("failed to run git reset: {e}"),
            })?;

        if output.status.success() {
            info!("[GitOps] Reset to {}", &commit[..12.min(commit.len())]);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("[GitOps] Reset failed: {}", stderr.trim());
            Err(CrewlyError::Git {
                message: format!("git reset failed: {}", stderr.trim()),
            })
        }
    }

    fn capture(root: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(root)
            .output()
            .map_err(|e| CrewlyError::Git {
                message: format!("failed to run git {}: {e}", args.join(" ")),
            })?;
        if !output.status.success() {
            return Err(CrewlyError::Git {
                message: format!(
                    "git {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
