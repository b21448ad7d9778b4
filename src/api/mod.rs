//! HTTP RPC surface for the core.
//!
//! Transport for the inbound operations: continuation handling, task
//! completion, gate checks, assignment, budget status, and the
//! self-improvement driver. Sits behind API-key auth and a request
//! rate limit; CORS and tracing come from tower-http.

use crate::auth::{auth_middleware, create_auth_state};
use crate::budget::{BudgetGuard, UsagePeriod};
use crate::config::{ApiConfig, Config};
use crate::engine::ContinuationEngine;
use crate::models::{
    ContinuationEvent, ContinuationTrigger, GateResult, SessionRef, UsageRecord,
};
use crate::notify::InMemoryNotifier;
use crate::rate_limit::{rate_limit_middleware, RateLimitConfig};
use crate::self_improve::{
    ChangeType, PlanRequest, ProposedChange, SelfImprovementDriver, SlackThread,
};
use crate::tasks::{AutoAssigner, CompleteTaskOptions, TaskAssignmentResult, TaskCompletion};
use crate::gates::{GateRunOptions, QualityGateRunner};
use crate::self_improve::GitOperations;
use crate::CrewlyError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

const SERVICE_NAME: &str = "crewly-core";
const SERVICE_VERSION: &str = "0.1.0";

const ROUTE_HEALTH: &str = "/health";
const ROUTE_CONTINUATION_HANDLE: &str = "/continuation/handle";
const ROUTE_CONTINUATION_MAX_ITERATIONS: &str = "/continuation/max-iterations";
const ROUTE_CONTINUATION_SESSION: &str = "/continuation/sessions/{session}";
const ROUTE_TASKS_COMPLETE: &str = "/tasks/complete";
const ROUTE_TASKS_CHECK_GATES: &str = "/tasks/check-gates";
const ROUTE_ASSIGN_NEXT: &str = "/assign/next";
const ROUTE_BUDGET_STATUS: &str = "/budget/{agent_id}";
const ROUTE_BUDGET_RECORD: &str = "/budget/record";
const ROUTE_SELF_IMPROVE_PLAN: &str = "/self-improve/plan";
const ROUTE_SELF_IMPROVE_EXECUTE: &str = "/self-improve/execute";
const ROUTE_SELF_IMPROVE_CANCEL: &str = "/self-improve/cancel";
const ROUTE_SELF_IMPROVE_STATUS: &str = "/self-improve/status";
const ROUTE_SELF_IMPROVE_HISTORY: &str = "/self-improve/history";
const ROUTE_NOTIFICATIONS: &str = "/notifications";

/// Everything the handlers need, injected explicitly.
#[derive(Clone)]
pub struct ApiState {
    pub engine: ContinuationEngine,
    pub completion: TaskCompletion,
    pub assigner: AutoAssigner,
    pub budget: BudgetGuard,
    pub driver: SelfImprovementDriver,
    pub gates: QualityGateRunner,
    pub notifier: Arc<InMemoryNotifier>,
    pub default_project_path: PathBuf,
}

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    state: ApiState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn map_error(e: CrewlyError) -> ApiError {
    let status = match &e {
        CrewlyError::NotFound(_) | CrewlyError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        CrewlyError::Validation(_)
        | CrewlyError::InvalidTaskState { .. }
        | CrewlyError::ConfigParse { .. } => StatusCode::BAD_REQUEST,
        CrewlyError::MarkerConflict(_) => StatusCode::CONFLICT,
        CrewlyError::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
        CrewlyError::Unauthorized => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct HandleEventRequest {
    pub session: String,
    pub trigger: ContinuationTrigger,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct MaxIterationsRequest {
    pub session: String,
    pub max_iterations: u32,
}

#[derive(Debug, Deserialize)]
pub struct CompleteTaskRequest {
    pub task_id: String,
    #[serde(default)]
    pub skip_gates: bool,
    pub summary: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompleteTaskResponse {
    pub success: bool,
    pub failed_gates: Vec<GateResult>,
    pub iterations: u32,
    pub max_iterations: u32,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckGatesRequest {
    pub project_path: Option<String>,
    pub gates: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct CheckGatesResponse {
    pub all_required_passed: bool,
    pub duration_ms: u64,
    pub results: Vec<GateResult>,
}

#[derive(Debug, Deserialize)]
pub struct AssignNextRequest {
    pub session: String,
}

#[derive(Debug, Serialize)]
pub struct AssignNextResponse {
    pub assigned: bool,
    pub task_id: Option<String>,
    pub title: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub file: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub description: String,
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlanImprovementRequest {
    pub description: String,
    #[serde(default)]
    pub target_files: Vec<String>,
    pub changes: Vec<PlanChangeRequest>,
    pub slack: Option<SlackThread>,
}

impl ApiServer {
    pub fn new(config: &Config, state: ApiState) -> Self {
        Self {
            config: config.api.clone(),
            state,
        }
    }

    pub async fn run(&self) -> crate::Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| CrewlyError::Internal(e.into()))?;
        info!(
            "[Api] {} {} listening on {}:{}",
            SERVICE_NAME, SERVICE_VERSION, self.config.host, self.config.port
        );
        axum::serve(listener, app)
            .await
            .map_err(|e| CrewlyError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.clone());
        let rate_limit = RateLimitConfig::new();

        Router::new()
            .route(ROUTE_HEALTH, get(health))
            .route(ROUTE_CONTINUATION_HANDLE, post(handle_event))
            .route(ROUTE_CONTINUATION_MAX_ITERATIONS, post(set_max_iterations))
            .route(ROUTE_CONTINUATION_SESSION, get(session_status))
            .route(ROUTE_TASKS_COMPLETE, post(complete_task))
            .route(ROUTE_TASKS_CHECK_GATES, post(check_gates))
            .route(ROUTE_ASSIGN_NEXT, post(assign_next))
            .route(ROUTE_BUDGET_STATUS, get(budget_status))
            .route(ROUTE_BUDGET_RECORD, post(record_usage))
            .route(ROUTE_SELF_IMPROVE_PLAN, post(self_improve_plan))
            .route(ROUTE_SELF_IMPROVE_EXECUTE, post(self_improve_execute))
            .route(ROUTE_SELF_IMPROVE_CANCEL, post(self_improve_cancel))
            .route(ROUTE_SELF_IMPROVE_STATUS, get(self_improve_status))
            .route(ROUTE_SELF_IMPROVE_HISTORY, get(self_improve_history))
            .route(ROUTE_NOTIFICATIONS, get(notifications))
            .layer(middleware::from_fn_with_state(
                auth_state,
                auth_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                rate_limit,
                rate_limit_middleware,
            ))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(self.state.clone())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "status": "ok",
    }))
}

async fn handle_event(
    State(state): State<ApiState>,
    Json(request): Json<HandleEventRequest>,
) -> Result<StatusCode, ApiError> {
    let mut event = ContinuationEvent::new(SessionRef::new(request.session), request.trigger);
    event.exit_code = request.exit_code;
    state.engine.submit(event).await;
    Ok(StatusCode::ACCEPTED)
}

async fn set_max_iterations(
    State(state): State<ApiState>,
    Json(request): Json<MaxIterationsRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .set_max_iterations(&SessionRef::new(request.session), request.max_iterations)
        .await
        .map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn session_status(
    State(state): State<ApiState>,
    Path(session): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state
        .engine
        .get_session_status(&SessionRef::new(session.clone()))
        .await
        .ok_or_else(|| map_error(CrewlyError::SessionNotFound(session)))?;
    Ok(Json(serde_json::json!({
        "phase": format!("{:?}", status.phase),
        "last_analysis": status.last_analysis,
        "last_action": status.last_action,
        "last_action_at": status.last_action_at,
        "max_iterations_override": status.max_iterations_override,
    })))
}

async fn complete_task(
    State(state): State<ApiState>,
    Json(request): Json<CompleteTaskRequest>,
) -> Result<Json<CompleteTaskResponse>, ApiError> {
    let outcome = state
        .completion
        .complete_task(
            &request.task_id,
            &CompleteTaskOptions {
                skip_gates: request.skip_gates,
                summary: request.summary,
            },
        )
        .await
        .map_err(map_error)?;
    Ok(Json(CompleteTaskResponse {
        success: outcome.success,
        failed_gates: outcome.failed_gates,
        iterations: outcome.iterations,
        max_iterations: outcome.max_iterations,
        message: outcome.message,
    }))
}

async fn check_gates(
    State(state): State<ApiState>,
    Json(request): Json<CheckGatesRequest>,
) -> Result<Json<CheckGatesResponse>, ApiError> {
    let project_path = request
        .project_path
        .map(PathBuf::from)
        .unwrap_or_else(|| state.default_project_path.clone());
    let options = GateRunOptions {
        gate_names: request.gates,
        current_branch: GitOperations::current_branch(&project_path),
        ..Default::default()
    };
    let run = state
        .gates
        .run_all(&project_path, &options)
        .await
        .map_err(map_error)?;
    Ok(Json(CheckGatesResponse {
        all_required_passed: run.all_required_passed,
        duration_ms: run.duration_ms,
        results: run.results,
    }))
}

async fn assign_next(
    State(state): State<ApiState>,
    Json(request): Json<AssignNextRequest>,
) -> Result<Json<AssignNextResponse>, ApiError> {
    let result = state
        .assigner
        .assign_next_task(&SessionRef::new(request.session))
        .await
        .map_err(map_error)?;
    let response = match result {
        TaskAssignmentResult::Assigned { task_id, title } => AssignNextResponse {
            assigned: true,
            task_id: Some(task_id),
            title: Some(title),
            reason: None,
        },
        TaskAssignmentResult::NoTasks => AssignNextResponse {
            assigned: false,
            task_id: None,
            title: None,
            reason: Some("no eligible tasks".to_string()),
        },
        TaskAssignmentResult::AtCapacity => AssignNextResponse {
            assigned: false,
            task_id: None,
            title: None,
            reason: Some("agent at max concurrent tasks".to_string()),
        },
    };
    Ok(Json(response))
}

async fn budget_status(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = state.default_project_path.display().to_string();
    let status = state
        .budget
        .check_budget(&agent_id, &project)
        .await
        .map_err(map_error)?;
    let summary = state
        .budget
        .get_usage(&agent_id, UsagePeriod::Day)
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({
        "within_budget": status.within_budget,
        "daily_used": status.daily_used,
        "daily_limit": status.daily_limit,
        "percent_used": status.percent_used,
        "estimated_runway": status.estimated_runway,
        "total_tokens": summary.total_tokens,
        "operation_breakdown": summary.operation_breakdown,
        "model_breakdown": summary.model_breakdown,
    })))
}

async fn record_usage(
    State(state): State<ApiState>,
    Json(record): Json<UsageRecord>,
) -> Result<StatusCode, ApiError> {
    state.budget.record_usage(record).await.map_err(map_error)?;
    Ok(StatusCode::ACCEPTED)
}

async fn self_improve_plan(
    State(state): State<ApiState>,
    Json(request): Json<PlanImprovementRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let plan = state
        .driver
        .plan(PlanRequest {
            description: request.description,
            target_files: request.target_files,
            changes: request
                .changes
                .into_iter()
                .map(|c| ProposedChange {
                    file: c.file,
                    change_type: c.change_type,
                    description: c.description,
                    content: c.content,
                })
                .collect(),
            slack: request.slack,
        })
        .await
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({
        "marker_id": plan.marker_id,
        "risk_level": plan.risk_level,
        "requires_restart": plan.requires_restart,
    })))
}

async fn self_improve_execute(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = state.driver.execute().await.map_err(map_error)?;
    Ok(Json(serde_json::json!({
        "marker_id": response.marker_id,
        "phase": response.phase,
        "changes_applied": response.changes_applied,
        "recorded_error": response.recorded_error,
    })))
}

async fn self_improve_cancel(
    State(state): State<ApiState>,
) -> Result<StatusCode, ApiError> {
    state.driver.cancel().await.map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn self_improve_status(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let marker = state.driver.status().await.map_err(map_error)?;
    Ok(Json(serde_json::json!({ "pending": marker })))
}

async fn self_improve_history(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let history = state.driver.history().await.map_err(map_error)?;
    let entries: Vec<serde_json::Value> = history
        .into_iter()
        .map(|(marker, outcome)| {
            serde_json::json!({
                "marker": marker,
                "outcome": outcome,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "history": entries })))
}

async fn notifications(
    State(state): State<ApiState>,
) -> Json<serde_json::Value> {
    let records = state.notifier.records().await;
    Json(serde_json::json!({ "notifications": records }))
}

#[cfg(test)]
mod tests;
