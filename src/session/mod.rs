//! Session port: the only path for agent I/O.
//!
//! A session is one pseudo-terminal hosting a long-running AI coding
//! assistant. The PTY lifecycle belongs to an external session manager;
//! the core reads output and writes input exclusively through
//! [`SessionPort`] and never issues shell commands against session names.

pub mod mock;

use crate::{models::SessionRef, Result};
use serde::{Deserialize, Serialize};

pub use mock::ScriptedSessionPort;

/// Position in a session's scrollback, returned by `capture_output`
/// and passed back on the next capture for incremental reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputCursor(pub u64);

/// Abstract PTY I/O supplied by the session adapter.
///
/// Implementations must serialize writes per session; reads are
/// incremental through the cursor. Failures surface as
/// `SessionNotFound`, `SessionDead`, or `WriteRejected`.
#[async_trait::async_trait]
pub trait SessionPort: Send + Sync {
    /// Write raw input (typically a rendered prompt plus newline) to
    /// the session's stdin.
    async fn write_input(&self, session: &SessionRef, input: &str) -> Result<()>;

    /// Capture output since `since`, returning the new bytes and the
    /// cursor to resume from. `None` captures the full buffer.
    async fn capture_output(
        &self,
        session: &SessionRef,
        since: Option<OutputCursor>,
    ) -> Result<(String, OutputCursor)>;

    /// Whether the PTY process is running.
    async fn is_alive(&self, session: &SessionRef) -> Result<bool>;

    /// Adapter-supplied heuristic: the assistant inside the session is
    /// idle (no streaming output, prompt visible).
    async fn is_assistant_idle(&self, session: &SessionRef) -> Result<bool>;

    /// Best-effort hook to restart the assistant runtime inside the
    /// session if it is not running. The precise liveness check is the
    /// adapter's concern; failure maps to `SessionDead`.
    async fn ensure_runtime(&self, session: &SessionRef) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CrewlyError;

    #[tokio::test]
    async fn test_capture_is_incremental() {
        let port = ScriptedSessionPort::new();
        let s = SessionRef::new("s1");
        port.register(&s).await;
        port.push_output(&s, "first chunk\n").await;

        let (out, cursor) = port.capture_output(&s, None).await.unwrap();
        assert_eq!(out, "first chunk\n");

        port.push_output(&s, "second chunk\n").await;
        let (out, cursor2) = port.capture_output(&s, Some(cursor)).await.unwrap();
        assert_eq!(out, "second chunk\n");
        assert!(cursor2.0 > cursor.0);

        // No new output: empty capture, cursor unchanged
        let (out, cursor3) = port.capture_output(&s, Some(cursor2)).await.unwrap();
        assert_eq!(out, "");
        assert_eq!(cursor3, cursor2);
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let port = ScriptedSessionPort::new();
        let s = SessionRef::new("ghost");
        let err = port.capture_output(&s, None).await.unwrap_err();
        assert!(matches!(err, CrewlyError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_dead_session_rejects_writes() {
        let port = ScriptedSessionPort::new();
        let s = SessionRef::new("s1");
        port.register(&s).await;
        port.kill(&s).await;

        let err = port.write_input(&s, "hello\n").await.unwrap_err();
        assert!(matches!(err, CrewlyError::SessionDead(_)));
        assert!(!port.is_alive(&s).await.unwrap());
    }

    #[tokio::test]
    async fn test_writes_are_recorded() {
        let port = ScriptedSessionPort::new();
        let s = SessionRef::new("s1");
        port.register(&s).await;

        port.write_input(&s, "continue with the task\n").await.unwrap();
        let writes = port.written_inputs(&s).await;
        assert_eq!(writes, vec!["continue with the task\n".to_string()]);
    }
}
