//! Task queue, auto-assignment, and the completion contract.

mod assigner;
mod completion;
mod queue;
mod registry;
mod repo;

pub use assigner::{
    AssignerConfig, AutoAssigner, Prioritization, RoleMatchRule, TaskAssignmentResult,
};
pub use completion::{CompleteTaskOptions, CompleteTaskOutcome, TaskCompletion};
pub use queue::{QueueEntry, TaskQueue};
pub use registry::AgentRegistry;
pub use repo::{InMemoryTaskRepository, TaskRepository};
