//! Agent registry: which agent sits in which session.
//!
//! One agent per session. Status here is derived bookkeeping for
//! assignment decisions, never persisted as a source of truth.

use crate::models::{Agent, AgentRole, AgentStatus, SessionRef};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<SessionRef, Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, agent: Agent) {
        info!(
            "[AgentRegistry] Registered agent {} ({}) on session {}",
            agent.agent_id, agent.role, agent.session
        );
        self.agents.write().await.insert(agent.session.clone(), agent);
    }

    pub async fn deregister(&self, session: &SessionRef) -> Option<Agent> {
        self.agents.write().await.remove(session)
    }

    pub async fn get(&self, session: &SessionRef) -> Option<Agent> {
        self.agents.read().await.get(session).cloned()
    }

    pub async fn by_agent_id(&self, agent_id: &str) -> Option<Agent> {
        self.agents
            .read()
            .await
            .values()
            .find(|a| a.agent_id == agent_id)
            .cloned()
    }

    pub async fn role_of(&self, session: &SessionRef) -> Option<AgentRole> {
        self.agents.read().await.get(session).map(|a| a.role.clone())
    }

    pub async fn set_status(&self, session: &SessionRef, status: AgentStatus) {
        if let Some(agent) = self.agents.write().await.get_mut(session) {
            agent.status = status;
        }
    }

    pub async fn all(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }
}
