//! Event envelope consumed by the continuation engine.

use crate::models::{ContinuationEvent, Recommendation};

/// A continuation event, optionally carrying a pre-seeded
/// recommendation that overrides the analyzer (used by the task
/// completion path to force a retry after failed gates).
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub event: ContinuationEvent,
    pub preseeded: Option<Recommendation>,
}

impl From<ContinuationEvent> for EngineEvent {
    fn from(event: ContinuationEvent) -> Self {
        Self {
            event,
            preseeded: None,
        }
    }
}

impl EngineEvent {
    pub fn preseeded(event: ContinuationEvent, recommendation: Recommendation) -> Self {
        Self {
            event,
            preseeded: Some(recommendation),
        }
    }
}
