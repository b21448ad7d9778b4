use thiserror::Error;

/// Convenience type alias for Results with CrewlyError
pub type Result<T> = std::result::Result<T, CrewlyError>;

/// Main error type for Crewly Core
///
/// This enum represents all possible errors that can occur within
/// the continuation and quality control core, providing detailed
/// error context for debugging and error handling.
#[derive(Error, Debug)]
pub enum CrewlyError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is dead: {0}")]
    SessionDead(String),

    #[error("Write rejected by session {session}: {message}")]
    WriteRejected { session: String, message: String },

    #[error("Invalid task state: {task_id} - {message}")]
    InvalidTaskState { task_id: String, message: String },

    #[error("Task {task_id} is blocked by incomplete dependencies: {blocked_by:?}")]
    DependencyBlocked {
        task_id: String,
        blocked_by: Vec<String>,
    },

    #[error("Quality gate '{gate}' timed out after {timeout_ms}ms")]
    GateTimeout { gate: String, timeout_ms: u64 },

    #[error("Required quality gate failed: {gate}")]
    GateFailed { gate: String },

    #[error("Budget exceeded for {scope_id}: {message}")]
    BudgetExceeded { scope_id: String, message: String },

    #[error("Budget warning for {scope_id}: {percent_used:.0}% used")]
    BudgetWarning { scope_id: String, percent_used: f64 },

    #[error("Configuration parse error: {path} - {message}")]
    ConfigParse { path: String, message: String },

    #[error("Improvement marker conflict: {0}")]
    MarkerConflict(String),

    #[error("Validation failed: {check} - {message}")]
    ValidationFailed { check: String, message: String },

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Iteration limit reached: {task_id} ({iterations}/{max_iterations})")]
    IterationLimit {
        task_id: String,
        iterations: u32,
        max_iterations: u32,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {message}")]
    Git { message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl CrewlyError {
    /// Exit code for the CLI wrapper.
    ///
    /// 0 success, 1 generic failure, 2 validation failure,
    /// 3 budget exceeded, 4 required gate failed.
    pub fn exit_code(&self) -> i32 {
        match self {
            CrewlyError::ValidationFailed { .. } | CrewlyError::Validation(_) => 2,
            CrewlyError::BudgetExceeded { .. } => 3,
            CrewlyError::GateFailed { .. } => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            CrewlyError::Validation("bad input".to_string()).exit_code(),
            2
        );
        assert_eq!(
            CrewlyError::BudgetExceeded {
                scope_id: "agent-1".to_string(),
                message: "daily limit".to_string(),
            }
            .exit_code(),
            3
        );
        assert_eq!(
            CrewlyError::GateFailed {
                gate: "tests".to_string()
            }
            .exit_code(),
            4
        );
        assert_eq!(CrewlyError::Unauthorized.exit_code(), 1);
    }
}
