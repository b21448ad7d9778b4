//! Notification seam.
//!
//! Every output-producing component emits [`NotificationRecord`]s
//! through the [`Notifier`] trait; the chat UI, Slack bridge, and
//! dashboard are external sinks behind this seam. Records are stored
//! so the dashboard can list and acknowledge them.

pub mod webhook;

use crate::models::{AgentStateAnalysis, SessionRef};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use webhook::WebhookNotifier;

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Continuation,
    BudgetWarning,
    BudgetExceeded,
    TaskAssigned,
    NoTasks,
    EngineError,
    SelfImprovement,
}

/// A persisted notification for the owner/dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub kind: NotificationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRef>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AgentStateAnalysis>,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub acknowledged: bool,
}

impl NotificationRecord {
    pub fn new(kind: NotificationKind, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            session: None,
            reason: reason.into(),
            analysis: None,
            ts: chrono::Utc::now(),
            acknowledged: false,
        }
    }

    pub fn for_session(mut self, session: SessionRef) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_analysis(mut self, analysis: AgentStateAnalysis) -> Self {
        self.analysis = Some(analysis);
        self
    }
}

/// Sink for notification records.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, record: NotificationRecord) -> Result<()>;
}

/// Stores records in memory for the dashboard; the default sink.
#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    records: Arc<RwLock<Vec<NotificationRecord>>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<NotificationRecord> {
        self.records.read().await.clone()
    }

    pub async fn unacknowledged(&self) -> Vec<NotificationRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| !r.acknowledged)
            .cloned()
            .collect()
    }

    pub async fn acknowledge(&self, id: &str) -> bool {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.acknowledged = true;
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, record: NotificationRecord) -> Result<()> {
        tracing::info!(
            "[Notify] {:?}: {} (session: {:?})",
            record.kind,
            record.reason,
            record.session.as_ref().map(|s| s.as_str())
        );
        self.records.write().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_acknowledge() {
        let notifier = InMemoryNotifier::new();
        let record = NotificationRecord::new(NotificationKind::Continuation, "agent stalled")
            .for_session(SessionRef::new("s1"));
        let id = record.id.clone();

        notifier.notify(record).await.unwrap();
        assert_eq!(notifier.unacknowledged().await.len(), 1);

        assert!(notifier.acknowledge(&id).await);
        assert!(notifier.unacknowledged().await.is_empty());
        assert_eq!(notifier.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_id() {
        let notifier = InMemoryNotifier::new();
        assert!(!notifier.acknowledge("nope").await);
    }
}
