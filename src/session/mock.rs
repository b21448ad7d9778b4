//! Scripted in-memory session port for tests and local composition.
//!
//! Mirrors the behavior contract of a real PTY adapter: incremental
//! cursors, per-session write serialization, and liveness flags that
//! tests can flip mid-scenario.

use super::{OutputCursor, SessionPort};
use crate::{models::SessionRef, CrewlyError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct ScriptedSession {
    scrollback: String,
    written: Vec<String>,
    alive: bool,
    assistant_idle: bool,
    reject_writes: bool,
}

/// In-memory [`SessionPort`] whose sessions are driven by the caller.
#[derive(Clone, Default)]
pub struct ScriptedSessionPort {
    sessions: Arc<RwLock<HashMap<SessionRef, ScriptedSession>>>,
}

impl ScriptedSessionPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live, idle session with an empty scrollback.
    pub async fn register(&self, session: &SessionRef) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.clone(),
            ScriptedSession {
                alive: true,
                assistant_idle: true,
                ..Default::default()
            },
        );
    }

    /// Append output to the session's scrollback.
    pub async fn push_output(&self, session: &SessionRef, output: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(session) {
            s.scrollback.push_str(output);
        }
    }

    /// Mark the session's PTY as dead.
    pub async fn kill(&self, session: &SessionRef) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(session) {
            s.alive = false;
        }
    }

    /// Flip the assistant-idle heuristic for the session.
    pub async fn set_assistant_idle(&self, session: &SessionRef, idle: bool) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(session) {
            s.assistant_idle = idle;
        }
    }

    /// Make subsequent writes fail with `WriteRejected`.
    pub async fn reject_writes(&self, session: &SessionRef) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(session) {
            s.reject_writes = true;
        }
    }

    /// Everything written to the session so far, in order.
    pub async fn written_inputs(&self, session: &SessionRef) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session)
            .map(|s| s.written.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl SessionPort for ScriptedSessionPort {
    async fn write_input(&self, session: &SessionRef, input: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let s = sessions
            .get_mut(session)
            .ok_or_else(|| CrewlyError::SessionNotFound(session.to_string()))?;
        if !s.alive {
            return Err(CrewlyError::SessionDead(session.to_string()));
        }
        if s.reject_writes {
            return Err(CrewlyError::WriteRejected {
                session: session.to_string(),
                message: "input rejected by adapter".to_string(),
            });
        }
        s.written.push(input.to_string());
        Ok(())
    }

    async fn capture_output(
        &self,
        session: &SessionRef,
        since: Option<OutputCursor>,
    ) -> Result<(String, OutputCursor)> {
        let sessions = self.sessions.read().await;
        let s = sessions
            .get(session)
            .ok_or_else(|| CrewlyError::SessionNotFound(session.to_string()))?;
        let start = since.unwrap_or_default().0 as usize;
        let start = start.min(s.scrollback.len());
        let chunk = s.scrollback[start..].to_string();
        Ok((chunk, OutputCursor(s.scrollback.len() as u64)))
    }

    async fn is_alive(&self, session: &SessionRef) -> Result<bool> {
        let sessions = self.sessions.read().await;
        let s = sessions
            .get(session)
            .ok_or_else(|| CrewlyError::SessionNotFound(session.to_string()))?;
        Ok(s.alive)
    }

    async fn is_assistant_idle(&self, session: &SessionRef) -> Result<bool> {
        let sessions = self.sessions.read().await;
        let s = sessions
            .get(session)
            .ok_or_else(|| CrewlyError::SessionNotFound(session.to_string()))?;
        Ok(s.assistant_idle)
    }

    async fn ensure_runtime(&self, session: &SessionRef) -> Result<()> {
        let sessions = self.sessions.read().await;
        let s = sessions
            .get(session)
            .ok_or_else(|| CrewlyError::SessionNotFound(session.to_string()))?;
        if !s.alive {
            return Err(CrewlyError::SessionDead(session.to_string()));
        }
        Ok(())
    }
}
