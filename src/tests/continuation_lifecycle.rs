//! End-to-end continuation scenarios over the wired loop.

use super::test_helpers::{eventually, wired};
use crate::checkpoint::{
    CheckpointReason, ConversationStore, StateCheckpointer,
};
use crate::models::{
    ContinuationEvent, ContinuationTrigger, Task, TaskStatus, UsageRecord,
};
use crate::notify::NotificationKind;
use crate::scheduler::Scheduler;
use crate::tasks::{AgentRegistry, CompleteTaskOptions, InMemoryTaskRepository, TaskRepository};
use std::sync::Arc;

const PASSING_GATES: &str = "required:\n  - name: tests\n    command: \"true\"\n";
const FAILING_GATES: &str =
    "required:\n  - name: tests\n    command: \"echo '2 failed'; exit 1\"\n";

#[tokio::test]
async fn test_s1_continuation_after_idle_through_worker() {
    // S1 through the queued path: idle timeout arrives while the
    // engine worker is running
    let w = wired("{}", PASSING_GATES).await;
    let session = w.register_agent("s1").await;
    let t1 = w.in_progress_task(&session, "T1").await;
    w.repo.insert(Task::new("T2", "next task")).await.unwrap();
    w.port
        .push_output(&session, "Running tests...\nAll tests passed\n")
        .await;

    w.engine.start().await;
    w.engine
        .submit(
            ContinuationEvent::new(session.clone(), ContinuationTrigger::IdleTimeout)
                .with_exit_code(0),
        )
        .await;

    let repo = w.repo.clone();
    let t1_id = t1.clone();
    assert!(
        eventually(|| {
            let repo = repo.clone();
            let t1_id = t1_id.clone();
            async move {
                repo.get(&t1_id)
                    .await
                    .unwrap()
                    .is_some_and(|t| t.status == TaskStatus::Completed)
            }
        })
        .await,
        "T1 never completed"
    );

    let tasks = w.repo.list().await.unwrap();
    let t2 = tasks.iter().find(|t| t.title == "T2").unwrap();
    assert_eq!(t2.status, TaskStatus::InProgress);
    assert_eq!(t2.session.as_ref(), Some(&session));

    let writes = w.port.written_inputs(&session).await;
    assert_eq!(writes.len(), 1, "exactly one prompt expected");
    assert!(writes[0].contains("T2"));

    w.engine.stop().await;
}

#[tokio::test]
async fn test_s2_gate_failure_feeds_retry_back_through_engine() {
    // S2 across modules: completion fails the tests gate, emits a
    // preseeded retry event, the engine injects the retry prompt
    let w = wired("{}", FAILING_GATES).await;
    let session = w.register_agent("s1").await;
    let t1 = w.in_progress_task(&session, "T1").await;
    w.port.push_output(&session, "done I think\n").await;

    w.engine.start().await;

    let outcome = w
        .completion
        .complete_task(&t1, &CompleteTaskOptions::default())
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.failed_gates[0].name, "tests");
    assert_eq!(outcome.failed_gates[0].exit_code, Some(1));
    assert_eq!(outcome.iterations, 1);

    // Task unchanged except the iteration bump
    let stored = w.repo.get(&t1).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);

    // The engine picks up the preseeded retry event and injects
    let port = w.port.clone();
    let session_clone = session.clone();
    assert!(
        eventually(|| {
            let port = port.clone();
            let session = session_clone.clone();
            async move { !port.written_inputs(&session).await.is_empty() }
        })
        .await,
        "retry prompt never injected"
    );
    let writes = w.port.written_inputs(&session).await;
    assert!(writes[0].contains("hit a problem"));

    w.engine.stop().await;
}

#[tokio::test]
async fn test_s3_budget_exhaustion_pauses_loop() {
    let budgets = r#"
agents:
  agent-s1:
    dailyLimit: 5.0
rates:
  default:
    inputRate: 1000000.0
    outputRate: 1000000.0
"#;
    let w = wired(budgets, PASSING_GATES).await;
    let session = w.register_agent("s1").await;
    w.in_progress_task(&session, "T1").await;
    w.port.push_output(&session, "chugging along\n").await;

    // Cross the daily limit
    w.budget
        .record_usage(UsageRecord {
            agent_id: "agent-s1".to_string(),
            session: session.clone(),
            project_path: w.project_dir.path().display().to_string(),
            ts: chrono::Utc::now(),
            input_tokens: 6,
            output_tokens: 0,
            model: "default".to_string(),
            operation: "continuation".to_string(),
            task_id: None,
        })
        .await
        .unwrap();

    w.engine
        .handle(ContinuationEvent::new(
            session.clone(),
            ContinuationTrigger::IdleTimeout,
        ))
        .await;

    assert!(w.port.written_inputs(&session).await.is_empty());
    let records = w.notifier.records().await;
    assert!(records
        .iter()
        .any(|r| r.kind == NotificationKind::BudgetExceeded));
    assert!(records
        .iter()
        .any(|r| r.kind == NotificationKind::Continuation && r.reason == "budget_exceeded"));
}

#[tokio::test]
async fn test_iteration_bound_invariant() {
    // For all tasks: iterations <= max_iterations + 1, no matter how
    // many continuation events arrive
    let w = wired("{}", PASSING_GATES).await;
    let session = w.register_agent("s1").await;
    let t1 = w.in_progress_task(&session, "T1").await;
    w.repo
        .update_with(&t1, Box::new(|t| t.max_iterations = 3))
        .await
        .unwrap();

    for round in 0..8 {
        w.port
            .push_output(&session, &format!("still going, round {round}\n"))
            .await;
        w.engine
            .handle(ContinuationEvent::new(
                session.clone(),
                ContinuationTrigger::IdleTimeout,
            ))
            .await;
    }

    let task = w.repo.get(&t1).await.unwrap().unwrap();
    assert!(
        task.iterations <= task.max_iterations + 1,
        "iterations {} exceeded max {} + 1",
        task.iterations,
        task.max_iterations
    );
}

#[tokio::test]
async fn test_checkpoint_resume_round_trip_is_idempotent() {
    // checkpoint → load → resume instructions → fresh engine →
    // checkpoint again yields the same instructions
    let w = wired("{}", PASSING_GATES).await;
    let session = w.register_agent("s1").await;
    let t1 = w.in_progress_task(&session, "T1").await;
    w.repo
        .update_with(&t1, Box::new(|t| t.checkpoint = Some("phase 2 of 3".to_string())))
        .await
        .unwrap();

    let state_dir = tempfile::tempdir().unwrap();
    let checkpointer = StateCheckpointer::new(
        state_dir.path().to_path_buf(),
        w.repo.clone(),
        w.registry.clone(),
        ConversationStore::new(),
        Scheduler::new(),
        0,
    );
    checkpointer
        .save_state(CheckpointReason::BeforeRestart)
        .await
        .unwrap();
    let first_state = checkpointer.load_state().await.unwrap().unwrap();
    let first = StateCheckpointer::generate_resume_instructions(&first_state);
    assert_eq!(first.tasks_to_resume.len(), 1);
    assert!(first.tasks_to_resume[0].resume_from_checkpoint);

    // A fresh repo restored from the snapshot produces identical
    // instructions on the next checkpoint
    let restored_repo = Arc::new(InMemoryTaskRepository::new());
    for task in &first_state.tasks {
        restored_repo.insert(task.clone()).await.unwrap();
    }
    let second_dir = tempfile::tempdir().unwrap();
    let second_checkpointer = StateCheckpointer::new(
        second_dir.path().to_path_buf(),
        restored_repo,
        AgentRegistry::new(),
        ConversationStore::new(),
        Scheduler::new(),
        first_state.metadata.restart_count + 1,
    );
    second_checkpointer
        .save_state(CheckpointReason::Scheduled)
        .await
        .unwrap();
    let second_state = second_checkpointer.load_state().await.unwrap().unwrap();
    let second = StateCheckpointer::generate_resume_instructions(&second_state);

    let ids_first: Vec<&str> = first
        .tasks_to_resume
        .iter()
        .map(|t| t.task_id.as_str())
        .collect();
    let ids_second: Vec<&str> = second
        .tasks_to_resume
        .iter()
        .map(|t| t.task_id.as_str())
        .collect();
    assert_eq!(ids_first, ids_second);
    assert_eq!(
        first.tasks_to_resume[0].resume_from_checkpoint,
        second.tasks_to_resume[0].resume_from_checkpoint
    );
}

#[tokio::test]
async fn test_usage_summary_independent_of_append_order() {
    // recordUsage commutativity for identical timestamps
    let w = wired("{}", PASSING_GATES).await;
    let ts = chrono::Utc::now();
    let record = |input: u64, output: u64| UsageRecord {
        agent_id: "agent-x".to_string(),
        session: crate::models::SessionRef::new("s1"),
        project_path: "/repo".to_string(),
        ts,
        input_tokens: input,
        output_tokens: output,
        model: "claude-sonnet-4".to_string(),
        operation: "continuation".to_string(),
        task_id: None,
    };

    w.budget.record_usage(record(100, 10)).await.unwrap();
    w.budget.record_usage(record(50, 5)).await.unwrap();
    let forward = w
        .budget
        .get_usage("agent-x", crate::budget::UsagePeriod::Day)
        .await
        .unwrap();

    let w2 = wired("{}", PASSING_GATES).await;
    w2.budget.record_usage(record(50, 5)).await.unwrap();
    w2.budget.record_usage(record(100, 10)).await.unwrap();
    let reversed = w2
        .budget
        .get_usage("agent-x", crate::budget::UsagePeriod::Day)
        .await
        .unwrap();

    assert_eq!(forward.total_tokens, reversed.total_tokens);
    assert!((forward.cost - reversed.cost).abs() < 1e-9);
}
