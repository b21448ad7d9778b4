//! Self-improvement across simulated process restarts, driven through
//! the composition root so the reconciler runs exactly where it does
//! in production: before everything else.

use crate::config::{ApiConfig, Config, ContinuationSettings, HomeConfig, NotifyConfig};
use crate::notify::InMemoryNotifier;
use crate::runtime::Orchestrator;
use crate::self_improve::{
    BackupStore, ChangeType, MarkerOutcome, MarkerStore, PlanRequest, ProposedChange,
    ReconcileDisposition, SelfImprovementDriver,
};
use crate::session::ScriptedSessionPort;
use std::sync::Arc;

struct Fixture {
    home: tempfile::TempDir,
    repo_root: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            home: tempfile::tempdir().unwrap(),
            repo_root: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self) -> Config {
        Config {
            home: HomeConfig {
                base_dir: self.home.path().to_path_buf(),
                project_path: self.repo_root.path().to_path_buf(),
                repo_root: self.repo_root.path().to_path_buf(),
            },
            continuation: ContinuationSettings {
                enabled: true,
                auto_assign_next: true,
                notify_on_max: true,
                notify_on_error: true,
                max_iterations: 10,
            },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                api_key: None,
                allowed_origins: vec![],
            },
            notify: NotifyConfig { webhook_url: None },
        }
    }

    fn marker_store(&self) -> MarkerStore {
        MarkerStore::new(self.config().home.self_improvement_dir())
    }

    fn driver(&self) -> SelfImprovementDriver {
        let config = self.config();
        SelfImprovementDriver::new(
            self.marker_store(),
            BackupStore::new(config.home.self_improvement_dir()),
            config.home.repo_root.clone(),
            Arc::new(InMemoryNotifier::new()),
            None,
        )
    }

    async fn bootstrap(&self) -> Orchestrator {
        Orchestrator::bootstrap(self.config(), Arc::new(ScriptedSessionPort::new()))
            .await
            .unwrap()
    }
}

async fn plan_and_execute(fixture: &Fixture) {
    std::fs::write(fixture.repo_root.path().join("engine.ts"), "old engine").unwrap();
    let driver = fixture.driver();
    driver
        .plan(PlanRequest {
            description: "smarter stall detection".to_string(),
            target_files: vec![],
            changes: vec![ProposedChange {
                file: "engine.ts".to_string(),
                change_type: ChangeType::Modify,
                description: "rewrite detection".to_string(),
                content: Some("new engine".to_string()),
            }],
            slack: None,
        })
        .await
        .unwrap();
    driver.execute().await.unwrap();
    assert_eq!(
        std::fs::read_to_string(fixture.repo_root.path().join("engine.ts")).unwrap(),
        "new engine"
    );
}

#[tokio::test]
async fn test_s4_restart_validates_then_rolls_back() {
    // Changes applied, process "crashes" (first orchestrator never
    // existed), next bootstrap validates. The default validation
    // pipeline cannot pass in an empty repo, so the change rolls back.
    let fixture = Fixture::new();
    plan_and_execute(&fixture).await;

    let orchestrator = fixture.bootstrap().await;
    assert!(orchestrator.reconcile_outcome.had_pending);
    assert_eq!(
        orchestrator.reconcile_outcome.disposition,
        Some(ReconcileDisposition::RolledBack)
    );

    // File restored to its pre-change content
    assert_eq!(
        std::fs::read_to_string(fixture.repo_root.path().join("engine.ts")).unwrap(),
        "old engine"
    );

    // History records the failure with its validation and rollback
    // evidence
    let history = fixture.marker_store().history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].1, MarkerOutcome::Failed);
    assert!(!history[0].0.validation.results.is_empty());
    assert!(history[0].0.rollback.is_some());

    // A second restart observes no pending marker
    let second = fixture.bootstrap().await;
    assert!(!second.reconcile_outcome.had_pending);
}

#[tokio::test]
async fn test_s6_infinite_restart_safety() {
    // Every validation cycle "crashes": simulate the three failed
    // startups by bumping the counter, then bootstrap a fourth time
    let fixture = Fixture::new();
    plan_and_execute(&fixture).await;

    let store = fixture.marker_store();
    let mut marker = store.load().await.unwrap().unwrap();
    marker.restart_count = 3;
    store.save(&marker).await.unwrap();

    let orchestrator = fixture.bootstrap().await;
    assert_eq!(
        orchestrator.reconcile_outcome.disposition,
        Some(ReconcileDisposition::RolledBack)
    );

    let history = store.history().await.unwrap();
    assert_eq!(history[0].0.error.as_deref(), Some("too many restarts"));
    // Validation was bypassed entirely on the forced path
    assert!(history[0].0.validation.results.is_empty());
    assert_eq!(
        std::fs::read_to_string(fixture.repo_root.path().join("engine.ts")).unwrap(),
        "old engine"
    );
}

#[tokio::test]
async fn test_planning_marker_cancelled_at_bootstrap() {
    let fixture = Fixture::new();
    fixture
        .driver()
        .plan(PlanRequest {
            description: "never executed".to_string(),
            target_files: vec![],
            changes: vec![ProposedChange {
                file: "engine.ts".to_string(),
                change_type: ChangeType::Modify,
                description: "x".to_string(),
                content: Some("x".to_string()),
            }],
            slack: None,
        })
        .await
        .unwrap();

    let orchestrator = fixture.bootstrap().await;
    assert_eq!(
        orchestrator.reconcile_outcome.disposition,
        Some(ReconcileDisposition::CancelledBeforeChanges)
    );
    assert!(fixture.marker_store().load().await.unwrap().is_none());
}

#[tokio::test]
async fn test_at_most_one_non_complete_marker() {
    let fixture = Fixture::new();
    plan_and_execute(&fixture).await;

    // A second plan while the first is mid-flight must conflict
    let err = fixture
        .driver()
        .plan(PlanRequest {
            description: "second".to_string(),
            target_files: vec![],
            changes: vec![ProposedChange {
                file: "other.ts".to_string(),
                change_type: ChangeType::Create,
                description: "x".to_string(),
                content: Some("x".to_string()),
            }],
            slack: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, crate::CrewlyError::MarkerConflict(_)));
}
