use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

/// API-key middleware for the RPC surface.
///
/// Accepts `x-api-key` or `Authorization: Bearer`. Key comparison is
/// constant-time; CORS preflights pass through unauthenticated.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let path = request.uri().path().to_string();

    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let Some(expected_key) = &auth_state.config.api_key else {
        // No key configured: the surface is local-only by config and
        // authentication is disabled
        return Ok(next.run(request).await);
    };

    let provided = if let Some(value) = headers.get("x-api-key") {
        match value.to_str() {
            Ok(v) => v,
            Err(_) => {
                warn!("[Auth] Malformed x-api-key header for {}", path);
                return Err(unauthorized());
            }
        }
    } else if let Some(value) = headers.get("authorization") {
        let auth_str = match value.to_str() {
            Ok(v) => v,
            Err(_) => {
                warn!("[Auth] Malformed authorization header for {}", path);
                return Err(unauthorized());
            }
        };
        match auth_str.strip_prefix("Bearer ") {
            Some(token) => token,
            None => {
                warn!("[Auth] Authorization header without Bearer prefix for {}", path);
                return Err(unauthorized());
            }
        }
    } else {
        warn!("[Auth] Missing API key in request to {}", path);
        return Err(unauthorized());
    };

    use subtle::ConstantTimeEq;
    if provided.as_bytes().ct_eq(expected_key.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        warn!("[Auth] Invalid API key for {}", path);
        Err(unauthorized())
    }
}
