//! State checkpointer: periodic atomic snapshots of conversations,
//! tasks, and agent state, plus resume instructions after a restart.
//!
//! Snapshots are written with a temp-file-and-rename so readers always
//! see a complete file. Conversations are trimmed to the most recent
//! messages with older turns collapsed into a summary line.

use crate::constants::{
    CHECKPOINT_INTERVAL_MS, MAX_PERSISTED_MESSAGES, STATE_BACKUP_DIR, STATE_FILE, STATE_VERSION,
};
use crate::models::{Agent, SessionRef, Task, TaskStatus};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::tasks::{AgentRegistry, TaskRepository};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Scheduled,
    BeforeRestart,
    TaskCompleted,
    UserRequest,
    SelfImprovement,
    ErrorRecovery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub ts: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRef>,
    pub messages: Vec<ConversationMessage>,
    /// Collapsed description of turns trimmed from `messages`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, session: Option<SessionRef>) -> Self {
        Self {
            id: id.into(),
            session,
            messages: Vec::new(),
            summary: None,
            last_activity: chrono::Utc::now(),
        }
    }
}

/// Lightweight reference to a mid-flight self-improvement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfImprovementStatus {
    pub marker_id: String,
    pub phase: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMetadata {
    pub hostname: String,
    pub pid: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub uptime_seconds: u64,
    pub restart_count: u32,
}

/// The snapshot format on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub id: String,
    pub version: u32,
    pub checkpointed_at: chrono::DateTime<chrono::Utc>,
    pub checkpoint_reason: CheckpointReason,
    pub conversations: Vec<Conversation>,
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub projects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_improvement: Option<SelfImprovementStatus>,
    pub metadata: StateMetadata,
}

/// One task entry in the resume plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResume {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub resume_from_checkpoint: bool,
}

/// What a fresh engine should do with the previous snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeInstructions {
    pub tasks_to_resume: Vec<TaskResume>,
    pub conversations_to_resume: Vec<String>,
    pub notifications: Vec<String>,
}

/// Shared in-memory conversation store the chat layer feeds.
#[derive(Clone, Default)]
pub struct ConversationStore {
    conversations: Arc<RwLock<Vec<Conversation>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, conversation: Conversation) {
        let mut conversations = self.conversations.write().await;
        match conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => conversations.push(conversation),
        }
    }

    pub async fn push_message(&self, id: &str, message: ConversationMessage) {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.iter_mut().find(|c| c.id == id) {
            conversation.last_activity = message.ts;
            conversation.messages.push(message);
        }
    }

    pub async fn snapshot(&self) -> Vec<Conversation> {
        self.conversations.read().await.clone()
    }

    pub async fn replace_all(&self, conversations: Vec<Conversation>) {
        *self.conversations.write().await = conversations;
    }
}

#[derive(Clone)]
pub struct StateCheckpointer {
    dir: PathBuf,
    repo: Arc<dyn TaskRepository>,
    registry: AgentRegistry,
    conversations: ConversationStore,
    scheduler: Scheduler,
    timer: Arc<Mutex<Option<TimerHandle>>>,
    started_at: chrono::DateTime<chrono::Utc>,
    restart_count: u32,
    self_improvement: Arc<RwLock<Option<SelfImprovementStatus>>>,
}

impl StateCheckpointer {
    pub fn new(
        dir: PathBuf,
        repo: Arc<dyn TaskRepository>,
        registry: AgentRegistry,
        conversations: ConversationStore,
        scheduler: Scheduler,
        restart_count: u32,
    ) -> Self {
        Self {
            dir,
            repo,
            registry,
            conversations,
            scheduler,
            timer: Arc::new(Mutex::new(None)),
            started_at: chrono::Utc::now(),
            restart_count,
            self_improvement: Arc::new(RwLock::new(None)),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Publish (or clear) the mid-flight self-improvement reference
    /// included in snapshots.
    pub async fn set_self_improvement(&self, status: Option<SelfImprovementStatus>) {
        *self.self_improvement.write().await = status;
    }

    /// Take a snapshot now.
    pub async fn save_state(&self, reason: CheckpointReason) -> Result<PathBuf> {
        let tasks = self.repo.list().await?;
        let agents = self.registry.all().await;
        let mut projects: Vec<String> =
            agents.iter().map(|a| a.project_path.clone()).collect();
        projects.sort();
        projects.dedup();

        let conversations = self
            .conversations
            .snapshot()
            .await
            .into_iter()
            .map(trim_conversation)
            .collect();

        let state = OrchestratorState {
            id: Uuid::new_v4().to_string(),
            version: STATE_VERSION,
            checkpointed_at: chrono::Utc::now(),
            checkpoint_reason: reason,
            conversations,
            tasks,
            agents,
            projects,
            self_improvement: self.self_improvement.read().await.clone(),
            metadata: StateMetadata {
                hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
                pid: std::process::id(),
                started_at: self.started_at,
                uptime_seconds: (chrono::Utc::now() - self.started_at).num_seconds().max(0)
                    as u64,
                restart_count: self.restart_count,
            },
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.state_path();
        let payload = serde_json::to_vec_pretty(&state)?;

        // Atomic replace: write to a temp file in the same directory,
        // then rename over the live snapshot
        let tmp = self.dir.join(format!(".{STATE_FILE}.tmp"));
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let backup_dir = self.dir.join(STATE_BACKUP_DIR);
        tokio::fs::create_dir_all(&backup_dir).await?;
        let backup_name = format!(
            "orchestrator-state-{}.json",
            state.checkpointed_at.format("%Y%m%dT%H%M%S%.3f")
        );
        tokio::fs::write(backup_dir.join(backup_name), &payload).await?;
        prune_backups(&backup_dir, 10).await;

        info!(
            "[Checkpointer] Saved state ({:?}, {} tasks, {} conversations)",
            reason,
            state.tasks.len(),
            state.conversations.len()
        );
        Ok(path)
    }

    /// Load the last snapshot, or `None` when there is none.
    pub async fn load_state(&self) -> Result<Option<OrchestratorState>> {
        let path = self.state_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: OrchestratorState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "[Checkpointer] Snapshot at {} unreadable: {}",
                    path.display(),
                    e
                );
                return Ok(None);
            }
        };

        if state.version != STATE_VERSION {
            warn!(
                "[Checkpointer] Snapshot version {} (current {}), loading best-effort",
                state.version, STATE_VERSION
            );
        }
        Ok(Some(state))
    }

    /// Start the periodic checkpoint timer.
    pub async fn start_periodic(&self) {
        let this = self.clone();
        let handle = self
            .scheduler
            .every(Duration::from_millis(CHECKPOINT_INTERVAL_MS), move || {
                let this = this.clone();
                async move {
                    if let Err(e) = this.save_state(CheckpointReason::Scheduled).await {
                        warn!("[Checkpointer] Scheduled save failed: {}", e);
                    }
                }
            })
            .await;
        *self.timer.lock().await = Some(handle);
    }

    /// Final save before the process exits; cancels the timer.
    pub async fn prepare_for_shutdown(&self) -> Result<()> {
        if let Some(handle) = self.timer.lock().await.take() {
            self.scheduler.cancel(handle).await;
        }
        self.save_state(CheckpointReason::BeforeRestart).await?;
        Ok(())
    }

    /// Build the resume plan from a previous snapshot.
    pub fn generate_resume_instructions(previous: &OrchestratorState) -> ResumeInstructions {
        let tasks_to_resume: Vec<TaskResume> = previous
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::InProgress | TaskStatus::Paused))
            .map(|t| TaskResume {
                task_id: t.id.clone(),
                title: t.title.clone(),
                status: t.status,
                resume_from_checkpoint: t.checkpoint.is_some(),
            })
            .collect();

        let hour_ago = chrono::Utc::now() - chrono::Duration::hours(1);
        let conversations_to_resume: Vec<String> = previous
            .conversations
            .iter()
            .filter(|c| c.last_activity > hour_ago)
            .map(|c| c.id.clone())
            .collect();

        let mut notifications = vec![format!(
            "Restart #{}: {} task(s) and {} conversation(s) to resume",
            previous.metadata.restart_count + 1,
            tasks_to_resume.len(),
            conversations_to_resume.len()
        )];
        if let Some(si) = &previous.self_improvement {
            notifications.push(format!(
                "Warning: self-improvement '{}' was mid-flight in phase {}",
                si.marker_id, si.phase
            ));
        }

        ResumeInstructions {
            tasks_to_resume,
            conversations_to_resume,
            notifications,
        }
    }
}

/// Keep the last `MAX_PERSISTED_MESSAGES` messages; fold the overflow
/// count into the summary.
fn trim_conversation(mut conversation: Conversation) -> Conversation {
    let len = conversation.messages.len();
    if len > MAX_PERSISTED_MESSAGES {
        let trimmed = len - MAX_PERSISTED_MESSAGES;
        conversation.messages.drain(..trimmed);
        let note = format!("{trimmed} earlier message(s) trimmed from this snapshot");
        conversation.summary = Some(match conversation.summary.take() {
            Some(existing) => format!("{existing}; {note}"),
            None => note,
        });
    }
    conversation
}

async fn prune_backups(dir: &std::path::Path, keep: usize) {
    let Ok(mut entries) = std::fs::read_dir(dir).map(|d| {
        d.filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>()
    }) else {
        return;
    };
    if entries.len() <= keep {
        return;
    }
    entries.sort();
    let excess = entries.len() - keep;
    for path in entries.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(
                "[Checkpointer] Failed to prune backup {}: {}",
                path.display(),
                e
            );
        }
    }
}
