use super::super::{map_error, ApiServer, ApiState};
use crate::analyzer::OutputAnalyzer;
use crate::budget::{BudgetGuard, BudgetsConfig, UsageLedger};
use crate::config::{ApiConfig, Config, ContinuationSettings, HomeConfig, NotifyConfig};
use crate::engine::{ContinuationConfig, ContinuationEngine, EngineDeps};
use crate::gates::QualityGateRunner;
use crate::notify::{InMemoryNotifier, Notifier};
use crate::self_improve::{BackupStore, MarkerStore, SelfImprovementDriver};
use crate::session::ScriptedSessionPort;
use crate::tasks::{
    AgentRegistry, AssignerConfig, AutoAssigner, InMemoryTaskRepository, TaskCompletion,
    TaskQueue,
};
use crate::CrewlyError;
use axum::http::StatusCode;
use std::sync::Arc;
use tokio::net::TcpListener;

const TEST_KEY: &str = "test-secret-key-1234567890123456789012345678901234567890";

fn create_test_config(api_key: Option<&str>, base_dir: &std::path::Path) -> Config {
    Config {
        home: HomeConfig {
            base_dir: base_dir.to_path_buf(),
            project_path: base_dir.join("project"),
            repo_root: base_dir.join("repo"),
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
            port: 0, // Use random port for testing
            api_key: api_key.map(|k| k.to_string()),
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
        notify: NotifyConfig { webhook_url: None },
    }
}

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    _base_dir: tempfile::TempDir,
}

/// Wire a full ApiState against in-memory components and serve the
/// router on a random port.
async fn spawn_server(api_key: Option<&str>) -> TestServer {
    let base_dir = tempfile::tempdir().unwrap();
    let config = create_test_config(api_key, base_dir.path());

    let repo = Arc::new(InMemoryTaskRepository::new());
    let port = Arc::new(ScriptedSessionPort::new());
    let store_notifier = Arc::new(InMemoryNotifier::new());
    let notifier: Arc<dyn Notifier> = store_notifier.clone();
    let registry = AgentRegistry::new();

    let budget = BudgetGuard::new(
        UsageLedger::new(config.home.usage_dir()),
        BudgetsConfig::default(),
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
        vec![],
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
        ContinuationConfig::default(),
    );
    let gates = QualityGateRunner::new();
    let completion = TaskCompletion::new(
        repo.clone(),
        registry,
        gates.clone(),
        notifier.clone(),
        assigner.clone(),
        Some(engine.sender()),
        true,
        config.home.project_path.clone(),
    );
    let driver = SelfImprovementDriver::new(
        MarkerStore::new(config.home.self_improvement_dir()),
        BackupStore::new(config.home.self_improvement_dir()),
        config.home.repo_root.clone(),
        notifier,
        None,
    );

    let server = ApiServer::new(
        &config,
        ApiState {
            engine,
            completion,
            assigner,
            budget,
            driver,
            gates,
            notifier: store_notifier,
            default_project_path: config.home.project_path.clone(),
        },
    );

    // Start server on random port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.build_router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Wait for server to start
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _base_dir: base_dir,
    }
}

#[tokio::test]
async fn test_api_authentication() {
    let server = spawn_server(Some(TEST_KEY)).await;

    // No key: rejected
    let response = server
        .client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401, "missing key should be rejected");

    // Wrong key: rejected
    let response = server
        .client
        .get(format!("{}/health", server.base_url))
        .header("x-api-key", "wrong-key-1234567890123456789012345678901234567890")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401, "wrong key should be rejected");

    // Correct x-api-key header
    let response = server
        .client
        .get(format!("{}/health", server.base_url))
        .header("x-api-key", TEST_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Correct Bearer token
    let response = server
        .client
        .get(format!("{}/health", server.base_url))
        .header("Authorization", format!("Bearer {TEST_KEY}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Authorization header without the Bearer prefix: rejected
    let response = server
        .client
        .get(format!("{}/health", server.base_url))
        .header("Authorization", TEST_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_cors_preflight_bypasses_auth() {
    let server = spawn_server(Some(TEST_KEY)).await;

    // A browser preflight carries no API key and must still succeed
    let response = server
        .client
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/health", server.base_url),
        )
        .header("Origin", "http://localhost:3000")
        .header("Access-Control-Request-Method", "GET")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn test_no_key_configured_disables_auth() {
    let server = spawn_server(None).await;

    let response = server
        .client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_continuation_endpoints_round_trip() {
    let server = spawn_server(Some(TEST_KEY)).await;

    // Events are accepted for queuing
    let response = server
        .client
        .post(format!("{}/continuation/handle", server.base_url))
        .header("x-api-key", TEST_KEY)
        .json(&serde_json::json!({
            "session": "s1",
            "trigger": "idle_timeout",
            "exit_code": 0,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    // An unknown session surfaces as 404 through map_error
    let response = server
        .client
        .get(format!("{}/continuation/sessions/ghost", server.base_url))
        .header("x-api-key", TEST_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_self_improve_rate_limit() {
    let server = spawn_server(Some(TEST_KEY)).await;

    // The self-improvement bucket is tighter than the general one;
    // the burst allowance runs dry within a dozen requests
    let mut saw_too_many = false;
    for i in 0..12 {
        let response = server
            .client
            .get(format!("{}/self-improve/status", server.base_url))
            .header("x-api-key", TEST_KEY)
            .send()
            .await
            .unwrap();
        if i == 0 {
            assert_eq!(response.status(), 200);
        }
        if response.status() == 429 {
            saw_too_many = true;
        }
    }
    assert!(saw_too_many, "self-improve quota never exhausted");
}

#[test]
fn test_error_status_mapping() {
    assert_eq!(
        map_error(CrewlyError::SessionNotFound("s1".to_string())).0,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        map_error(CrewlyError::NotFound("task t1".to_string())).0,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        map_error(CrewlyError::BudgetExceeded {
            scope_id: "a1".to_string(),
            message: "daily limit".to_string(),
        })
        .0,
        StatusCode::PAYMENT_REQUIRED
    );
    assert_eq!(
        map_error(CrewlyError::Unauthorized).0,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        map_error(CrewlyError::MarkerConflict("pending".to_string())).0,
        StatusCode::CONFLICT
    );
    assert_eq!(
        map_error(CrewlyError::Validation("bad input".to_string())).0,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        map_error(CrewlyError::InvalidTaskState {
            task_id: "t1".to_string(),
            message: "not in progress".to_string(),
        })
        .0,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        map_error(CrewlyError::Timeout {
            message: "handle deadline".to_string(),
        })
        .0,
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
