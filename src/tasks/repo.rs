//! Task repository seam.
//!
//! Task storage on disk belongs to an external collaborator; the core
//! reads and writes through this trait. Writes are read-modify-write
//! under a per-task critical section; reads are non-blocking snapshots.

use crate::models::{SessionRef, Task, TaskStatus};
use crate::{CrewlyError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage abstraction for tasks.
#[async_trait::async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: Task) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Snapshot of every task.
    async fn list(&self) -> Result<Vec<Task>>;

    /// Atomically apply `mutate` to the stored task. Returns the
    /// updated task, or `NotFound` if the id is unknown.
    async fn update_with(
        &self,
        id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Task) + Send>,
    ) -> Result<Task>;

    /// The in-progress task currently bound to `session`, if any.
    async fn current_for(&self, session: &SessionRef) -> Result<Option<Task>>;
}

/// In-memory repository used in tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(CrewlyError::Validation(format!(
                "task {} already exists",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn update_with(
        &self,
        id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Task) + Send>,
    ) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| CrewlyError::NotFound(format!("task {id}")))?;
        mutate(&mut *task);
        task.updated_at = chrono::Utc::now();
        Ok(task.clone())
    }

    async fn current_for(&self, session: &SessionRef) -> Result<Option<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .find(|t| t.status == TaskStatus::InProgress && t.session.as_ref() == Some(session))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let repo = InMemoryTaskRepository::new();
        let task = Task::new("Add search", "Implement search endpoint");
        let id = task.id.clone();
        repo.insert(task).await.unwrap();

        let fetched = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Add search");
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let repo = InMemoryTaskRepository::new();
        let task = Task::new("A", "a");
        repo.insert(task.clone()).await.unwrap();
        assert!(repo.insert(task).await.is_err());
    }

    #[tokio::test]
    async fn test_update_with_bumps_updated_at() {
        let repo = InMemoryTaskRepository::new();
        let task = Task::new("A", "a");
        let id = task.id.clone();
        let before = task.updated_at;
        repo.insert(task).await.unwrap();

        let updated = repo
            .update_with(&id, Box::new(|t| t.iterations += 1))
            .await
            .unwrap();
        assert_eq!(updated.iterations, 1);
        assert!(updated.updated_at >= before);
    }

    #[tokio::test]
    async fn test_current_for_session() {
        let repo = InMemoryTaskRepository::new();
        let session = SessionRef::new("s1");

        let mut bound = Task::new("bound", "b");
        bound.status = TaskStatus::InProgress;
        bound.session = Some(session.clone());
        let bound_id = bound.id.clone();
        repo.insert(bound).await.unwrap();
        repo.insert(Task::new("other", "o")).await.unwrap();

        let current = repo.current_for(&session).await.unwrap().unwrap();
        assert_eq!(current.id, bound_id);

        let none = repo.current_for(&SessionRef::new("s2")).await.unwrap();
        assert!(none.is_none());
    }
}
