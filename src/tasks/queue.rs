//! Eligible-task queue.
//!
//! Rebuilt from the repository on demand: open tasks annotated with
//! the set of incomplete dependencies. A task is eligible when that
//! set is empty (or blocking is not respected). Unknown dependency ids
//! block forever and are logged — a dependency that does not exist can
//! never complete.

use super::repo::TaskRepository;
use crate::models::{Task, TaskStatus};
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// One queue entry: an open task plus what still blocks it.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task: Task,
    pub blocked_by: Vec<String>,
}

impl QueueEntry {
    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    repo: Arc<dyn TaskRepository>,
    respect_blocking: bool,
}

impl TaskQueue {
    pub fn new(repo: Arc<dyn TaskRepository>, respect_blocking: bool) -> Self {
        Self {
            repo,
            respect_blocking,
        }
    }

    /// Rebuild the queue from the repository snapshot.
    pub async fn rebuild(&self) -> Result<Vec<QueueEntry>> {
        let tasks = self.repo.list().await?;
        let completed: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();
        let known: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        let entries = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Open)
            .map(|task| {
                let blocked_by: Vec<String> = task
                    .dependencies
                    .iter()
                    .filter(|dep| {
                        if !known.contains_key(dep.as_str()) {
                            warn!(
                                "[TaskQueue] Task {} depends on unknown task {}",
                                task.id, dep
                            );
                            return true;
                        }
                        !completed.contains(dep.as_str())
                    })
                    .cloned()
                    .collect();
                QueueEntry {
                    task: task.clone(),
                    blocked_by,
                }
            })
            .collect();

        Ok(entries)
    }

    /// Open tasks that may be assigned right now.
    pub async fn eligible(&self) -> Result<Vec<Task>> {
        let entries = self.rebuild().await?;
        Ok(entries
            .into_iter()
            .filter(|e| !self.respect_blocking || !e.is_blocked())
            .map(|e| e.task)
            .collect())
    }
}
