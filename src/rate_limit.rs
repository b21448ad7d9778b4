use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};
use tracing::warn;

/// Request budget for the whole RPC surface.
pub const REQUESTS_PER_MINUTE: u32 = 120;
/// Tighter budget for self-improvement mutations.
pub const SELF_IMPROVE_REQUESTS_PER_MINUTE: u32 = 10;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub general_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    pub self_improve_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitConfig {
    pub fn new() -> Self {
        let general_quota =
            Quota::per_minute(NonZeroU32::new(REQUESTS_PER_MINUTE).expect("nonzero"));
        let self_improve_quota =
            Quota::per_minute(NonZeroU32::new(SELF_IMPROVE_REQUESTS_PER_MINUTE).expect("nonzero"));
        Self {
            general_limiter: Arc::new(RateLimiter::direct(general_quota)),
            self_improve_limiter: Arc::new(RateLimiter::direct(self_improve_quota)),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject requests over quota with 429. Self-improvement endpoints
/// draw from their own, tighter bucket.
pub async fn rate_limit_middleware(
    State(config): State<RateLimitConfig>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = request.uri().path();

    if path.starts_with("/self-improve") && config.self_improve_limiter.check().is_err() {
        warn!("[RateLimit] Self-improvement quota exhausted for {}", path);
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    if config.general_limiter.check().is_err() {
        warn!("[RateLimit] Request quota exhausted for {}", path);
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}
