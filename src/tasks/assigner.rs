//! Auto-assignment scheduler.
//!
//! Matches eligible open tasks to idle agents by role, priority, and
//! the dependency graph. The assigner is a leaf: the engine calls it
//! synchronously and it talks only to the repository, registry,
//! session port, and notifier.
//!
//! Dependency ordering invariant: a task never transitions to
//! in-progress while any of its dependencies is non-completed.

use super::queue::TaskQueue;
use super::registry::AgentRegistry;
use super::repo::TaskRepository;
use crate::models::{AgentRole, AgentStatus, SessionRef, Task, TaskStatus};
use crate::notify::{NotificationKind, NotificationRecord, Notifier};
use crate::session::SessionPort;
use crate::{prompts, CrewlyError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ordering applied to eligible tasks before taking the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prioritization {
    /// Numeric priority descending, created-at ascending on ties.
    #[default]
    Priority,
    /// Created-at ascending.
    Fifo,
    /// Deadline ascending (tasks without one last), then priority.
    Deadline,
}

/// How an agent role picks up tasks.
#[derive(Debug, Clone)]
pub struct RoleMatchRule {
    pub role: AgentRole,
    /// Roles whose tasks this role may also take (hierarchy).
    pub parent_roles: Vec<AgentRole>,
    /// Exclusive roles take only tasks that name them explicitly.
    pub exclusive: bool,
    /// Task types this role accepts; empty accepts all.
    pub task_types: Vec<String>,
}

impl RoleMatchRule {
    pub fn exact(role: AgentRole) -> Self {
        Self {
            role,
            parent_roles: Vec::new(),
            exclusive: false,
            task_types: Vec::new(),
        }
    }

    /// Whether this rule's role may take `task`.
    fn matches(&self, task: &Task) -> bool {
        if let Some(task_type) = &task.task_type {
            if !self.task_types.is_empty() && !self.task_types.contains(task_type) {
                return false;
            }
        }
        match &task.required_role {
            None => !self.exclusive,
            Some(required) => {
                if *required == self.role {
                    return true;
                }
                if self.exclusive {
                    return false;
                }
                self.parent_roles.contains(required)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssignerConfig {
    pub prioritization: Prioritization,
    pub max_concurrent_tasks: usize,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            prioritization: Prioritization::Priority,
            max_concurrent_tasks: 1,
        }
    }
}

/// Outcome of an assignment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAssignmentResult {
    Assigned { task_id: String, title: String },
    NoTasks,
    AtCapacity,
}

#[derive(Clone)]
pub struct AutoAssigner {
    repo: Arc<dyn TaskRepository>,
    queue: TaskQueue,
    registry: AgentRegistry,
    port: Arc<dyn SessionPort>,
    notifier: Arc<dyn Notifier>,
    config: AssignerConfig,
    rules: HashMap<AgentRole, RoleMatchRule>,
}

impl AutoAssigner {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        queue: TaskQueue,
        registry: AgentRegistry,
        port: Arc<dyn SessionPort>,
        notifier: Arc<dyn Notifier>,
        config: AssignerConfig,
        rules: Vec<RoleMatchRule>,
    ) -> Self {
        let rules = rules.into_iter().map(|r| (r.role.clone(), r)).collect();
        Self {
            repo,
            queue,
            registry,
            port,
            notifier,
            config,
            rules,
        }
    }

    /// Best eligible task for `role`, or `None`.
    pub async fn find_next_task(&self, role: &AgentRole) -> Result<Option<Task>> {
        let rule = self
            .rules
            .get(role)
            .cloned()
            .unwrap_or_else(|| RoleMatchRule::exact(role.clone()));

        let mut candidates: Vec<Task> = self
            .queue
            .eligible()
            .await?
            .into_iter()
            .filter(|task| rule.matches(task))
            .collect();

        sort_by_prioritization(&mut candidates, self.config.prioritization);
        Ok(candidates.into_iter().next())
    }

    /// Assign the best eligible task to the agent on `session`.
    pub async fn assign_next_task(&self, session: &SessionRef) -> Result<TaskAssignmentResult> {
        let agent = self
            .registry
            .get(session)
            .await
            .ok_or_else(|| CrewlyError::SessionNotFound(session.to_string()))?;

        let in_flight = self.concurrent_tasks(session).await?;
        if in_flight >= self.config.max_concurrent_tasks {
            debug!(
                "[AutoAssigner] Session {} at capacity ({}/{})",
                session, in_flight, self.config.max_concurrent_tasks
            );
            return Ok(TaskAssignmentResult::AtCapacity);
        }

        let Some(candidate) = self.find_next_task(&agent.role).await? else {
            self.notifier
                .notify(
                    NotificationRecord::new(
                        NotificationKind::NoTasks,
                        format!("no eligible tasks for role {}", agent.role),
                    )
                    .for_session(session.clone()),
                )
                .await?;
            return Ok(TaskAssignmentResult::NoTasks);
        };

        // Claim under the repository's write lock; a concurrent claim
        // leaves the task bound to the other session and we report
        // NoTasks rather than double-assign.
        let session_clone = session.clone();
        let claimed = self
            .repo
            .update_with(
                &candidate.id,
                Box::new(move |task| {
                    if task.status == TaskStatus::Open {
                        task.status = TaskStatus::InProgress;
                        task.session = Some(session_clone);
                    }
                }),
            )
            .await?;

        if claimed.status != TaskStatus::InProgress || claimed.session.as_ref() != Some(session) {
            warn!(
                "[AutoAssigner] Task {} claimed by another session",
                candidate.id
            );
            return Ok(TaskAssignmentResult::NoTasks);
        }

        let prompt = prompts::render_assignment(&claimed)?;
        self.port
            .write_input(session, &format!("{prompt}\n"))
            .await?;
        self.registry.set_status(session, AgentStatus::Busy).await;

        info!(
            "[AutoAssigner] Assigned task {} ('{}') to session {}",
            claimed.id, claimed.title, session
        );
        self.notifier
            .notify(
                NotificationRecord::new(
                    NotificationKind::TaskAssigned,
                    format!("task '{}' assigned", claimed.title),
                )
                .for_session(session.clone()),
            )
            .await?;

        Ok(TaskAssignmentResult::Assigned {
            task_id: claimed.id,
            title: claimed.title,
        })
    }

    async fn concurrent_tasks(&self, session: &SessionRef) -> Result<usize> {
        Ok(self
            .repo
            .list()
            .await?
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress && t.session.as_ref() == Some(session))
            .count())
    }
}

fn sort_by_prioritization(tasks: &mut [Task], prioritization: Prioritization) {
    match prioritization {
        Prioritization::Priority => {
            tasks.sort_by(|a, b| {
                b.priority
                    .rank()
                    .cmp(&a.priority.rank())
                    .then(a.created_at.cmp(&b.created_at))
            });
        }
        Prioritization::Fifo => {
            tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }
        Prioritization::Deadline => {
            tasks.sort_by(|a, b| {
                match (a.deadline, b.deadline) {
                    (Some(da), Some(db)) => da.cmp(&db),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
                .then(b.priority.rank().cmp(&a.priority.rank()))
            });
        }
    }
}
