//! Security middleware for rate limiting, request size limits and CORS handling.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
};
use tracing::warn;

use crate::settings::SecurityConfig;

/// Rate limiter type
pub type AppRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create rate limiter from configuration; a zero rate falls back to one per minute.
pub fn create_rate_limiter(config: &SecurityConfig) -> Arc<AppRateLimiter> {
    let per_minute = NonZeroU32::new(config.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)))
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(rate_limiter): State<Arc<AppRateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    match rate_limiter.check() {
        Ok(_) => Ok(next.run(request).await),
        Err(_) => {
            warn!("Rate limit exceeded for request to {}", request.uri().path());
            Err(StatusCode::TOO_MANY_REQUESTS)
        }
    }
}

/// Security headers middleware
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );

    response
}

/// Create CORS layer from security configuration
pub fn create_cors_layer(config: &SecurityConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if config.cors_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
}

/// Create request body size limit layer
pub fn create_body_limit_layer(max_size_mb: usize) -> RequestBodyLimitLayer {
    RequestBodyLimitLayer::new(max_size_mb * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_enforces_quota() {
        let config = SecurityConfig {
            rate_limit_per_minute: 2,
            ..Default::default()
        };
        let rate_limiter = create_rate_limiter(&config);

        assert!(rate_limiter.check().is_ok());
        assert!(rate_limiter.check().is_ok());
        assert!(rate_limiter.check().is_err());
    }

    #[test]
    fn zero_rate_does_not_panic() {
        let config = SecurityConfig {
            rate_limit_per_minute: 0,
            ..Default::default()
        };
        assert!(create_rate_limiter(&config).check().is_ok());
    }
}
