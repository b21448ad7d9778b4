//! Composition root.
//!
//! Wires the capability graph from a [`Config`] in the order the
//! design requires: the startup reconciler runs before anything else,
//! then the stores, guard, assigner, engine, checker, checkpointer,
//! and API surface are built with their dependencies passed
//! explicitly.

use crate::analyzer::OutputAnalyzer;
use crate::api::{ApiServer, ApiState};
use crate::budget::{BudgetGuard, BudgetsConfig, UsageLedger};
use crate::checker::{CheckerConfig, PeriodicChecker};
use crate::checkpoint::{ConversationStore, StateCheckpointer};
use crate::config::Config;
use crate::engine::{ContinuationConfig, ContinuationEngine, EngineDeps};
use crate::gates::QualityGateRunner;
use crate::notify::{InMemoryNotifier, Notifier, WebhookNotifier};
use crate::self_improve::{
    BackupStore, MarkerStore, ReconcileOutcome, SelfImprovementDriver, StartupReconciler,
    ValidationSettings,
};
use crate::session::SessionPort;
use crate::tasks::{
    AgentRegistry, AssignerConfig, AutoAssigner, InMemoryTaskRepository, TaskCompletion,
    TaskQueue, TaskRepository,
};
use crate::Result;
use crate::scheduler::Scheduler;
use std::sync::Arc;
use tracing::{info, warn};

/// Fan-out notifier: store locally for the dashboard, mirror to the
/// webhook when one is configured.
struct FanOutNotifier {
    store: Arc<InMemoryNotifier>,
    webhook: Option<WebhookNotifier>,
}

#[async_trait::async_trait]
impl Notifier for FanOutNotifier {
    async fn notify(&self, record: crate::notify::NotificationRecord) -> Result<()> {
        if let Some(webhook) = &self.webhook {
            webhook.notify(record.clone()).await?;
        }
        self.store.notify(record).await
    }
}

/// The assembled orchestrator core.
pub struct Orchestrator {
    pub config: Config,
    pub engine: ContinuationEngine,
    pub checker: PeriodicChecker,
    pub checkpointer: StateCheckpointer,
    pub api: ApiServer,
    pub scheduler: Scheduler,
    pub reconcile_outcome: ReconcileOutcome,
}

impl Orchestrator {
    /// Build everything. The reconciler runs first — before any other
    /// subsystem touches disk or sessions.
    pub async fn bootstrap(config: Config, port: Arc<dyn SessionPort>) -> Result<Self> {
        let store_notifier = Arc::new(InMemoryNotifier::new());
        let notifier: Arc<dyn Notifier> = Arc::new(FanOutNotifier {
            store: store_notifier.clone(),
            webhook: config.notify.webhook_url.as_deref().map(WebhookNotifier::new),
        });

        // Startup reconciler: decide the fate of any pending
        // self-improvement marker before anything else runs
        let marker_store = MarkerStore::new(config.home.self_improvement_dir());
        let backup_store = BackupStore::new(config.home.self_improvement_dir());
        let reconciler = StartupReconciler::new(
            marker_store.clone(),
            backup_store.clone(),
            config.home.repo_root.clone(),
            ValidationSettings::with_default_checks(config.home.repo_root.clone()),
            notifier.clone(),
        );
        let reconcile_outcome = reconciler.reconcile().await;
        if reconcile_outcome.had_pending {
            info!(
                "[Bootstrap] Reconciler disposition: {:?}",
                reconcile_outcome.disposition
            );
        }

        let repo: Arc<dyn TaskRepository> = Arc::new(InMemoryTaskRepository::new());
        let registry = AgentRegistry::new();
        let scheduler = Scheduler::new();

        let budgets = BudgetsConfig::load(&config.home.budgets_file())?;
        let budget = BudgetGuard::new(
            UsageLedger::new(config.home.usage_dir()),
            budgets,
            notifier.clone(),
        );

        let queue = TaskQueue::new(repo.clone(), true);
        let assigner = AutoAssigner::new(
            repo.clone(),
            queue,
            registry.clone(),
            port.clone(),
            notifier.clone(),
            AssignerConfig::default(),
            Vec::new(),
        );

        let engine = ContinuationEngine::new(
            EngineDeps {
                port: port.clone(),
                repo: repo.clone(),
                registry: registry.clone(),
                analyzer: Arc::new(OutputAnalyzer::with_defaults()),
                assigner: assigner.clone(),
                budget: budget.clone(),
                notifier: notifier.clone(),
            },
            ContinuationConfig {
                enabled: config.continuation.enabled,
                auto_assign_next: config.continuation.auto_assign_next,
                notify_on_max: config.continuation.notify_on_max,
                notify_on_error: config.continuation.notify_on_error,
                max_iterations: config.continuation.max_iterations,
            },
        );

        // Resume context from the previous snapshot, if any
        let conversations = ConversationStore::new();
        let probe = StateCheckpointer::new(
            config.home.state_dir(),
            repo.clone(),
            registry.clone(),
            conversations.clone(),
            scheduler.clone(),
            0,
        );
        let restart_count = match probe.load_state().await? {
            Some(previous) => {
                let instructions = StateCheckpointer::generate_resume_instructions(&previous);
                for line in &instructions.notifications {
                    info!("[Bootstrap] {}", line);
                }
                conversations.replace_all(previous.conversations.clone()).await;
                for task in previous.tasks {
                    if let Err(e) = repo.insert(task).await {
                        warn!("[Bootstrap] Could not restore task: {}", e);
                    }
                }
                previous.metadata.restart_count + 1
            }
            None => 0,
        };
        let checkpointer = StateCheckpointer::new(
            config.home.state_dir(),
            repo.clone(),
            registry.clone(),
            conversations,
            scheduler.clone(),
            restart_count,
        );

        let gates = QualityGateRunner::new();
        let completion = TaskCompletion::new(
            repo.clone(),
            registry.clone(),
            gates.clone(),
            notifier.clone(),
            assigner.clone(),
            Some(engine.sender()),
            config.continuation.auto_assign_next,
            config.home.project_path.clone(),
        );

        let driver = SelfImprovementDriver::new(
            marker_store,
            backup_store,
            config.home.repo_root.clone(),
            notifier.clone(),
            Some(checkpointer.clone()),
        );

        let checker = PeriodicChecker::new(
            port,
            scheduler.clone(),
            engine.sender(),
            CheckerConfig::default(),
        );

        let api = ApiServer::new(
            &config,
            ApiState {
                engine: engine.clone(),
                completion,
                assigner,
                budget,
                driver,
                gates,
                notifier: store_notifier,
                default_project_path: config.home.project_path.clone(),
            },
        );

        Ok(Self {
            config,
            engine,
            checker,
            checkpointer,
            api,
            scheduler,
            reconcile_outcome,
        })
    }

    /// Start background work: engine worker and checkpoint timer.
    pub async fn start(&self) {
        self.engine.start().await;
        self.checkpointer.start_periodic().await;
    }

    /// Graceful shutdown: cancel timers, stop event intake, take a
    /// final `before_restart` snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        info!("[Bootstrap] Shutting down");
        self.checker.stop_all().await;
        self.scheduler.cancel_all().await;
        self.engine.stop().await;
        self.checkpointer.prepare_for_shutdown().await?;
        Ok(())
    }
}
