//! HTTP request throttling for the introspection API.
//!
//! Unrelated to the execution queue's own sliding window, which protects the
//! exchange rather than this server.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::config::ServerConfig;

pub type ApiRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// One shared bucket for all callers; zero is treated as one request per minute
pub fn create_rate_limiter(requests_per_minute: u32) -> ApiRateLimiter {
    let per_minute = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)))
}

pub async fn rate_limit_middleware(limiter: ApiRateLimiter, request: Request, next: Next) -> Response {
    match limiter.check() {
        Ok(_) => next.run(request).await,
        Err(_) => {
            tracing::warn!("API rate limit exceeded: {} {}", request.method(), request.uri().path());
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please try again later.",
            )
                .into_response()
        }
    }
}

/// Wrap every route of `router` in the limiter from `config`
pub fn with_rate_limit(router: Router, config: &ServerConfig) -> Router {
    let limiter = create_rate_limiter(config.requests_per_minute);
    router.layer(middleware::from_fn(move |request: Request, next: Next| {
        rate_limit_middleware(limiter.clone(), request, next)
    }))
}
