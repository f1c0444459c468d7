//! Bearer-token middleware and the auth-failure limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;

use voidrunner_core::AppError;

use crate::auth::models::AuthUser;
use crate::error::HttpAppError;
use crate::state::AppState;

/// Sliding-window counter of failed credential checks per key (email).
/// Once a key trips the limit it stays blocked for the rest of the
/// window.
#[derive(Clone)]
pub struct AuthFailureLimiter {
    inner: Arc<Mutex<HashMap<String, (u32, Instant)>>>,
    max_failures: u32,
    window: Duration,
}

impl AuthFailureLimiter {
    pub fn new(max_failures: u32, window_seconds: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_failures,
            window: Duration::from_secs(window_seconds),
        }
    }

    /// Records a failure; returns whether the key is now blocked.
    pub async fn record_failure(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let (count, reset_at) = guard
            .entry(key.to_string())
            .or_insert((0, now + self.window));
        if now >= *reset_at {
            *count = 0;
            *reset_at = now + self.window;
        }
        *count += 1;
        *count >= self.max_failures
    }

    pub async fn is_blocked(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().await;
        if let Some((count, reset_at)) = guard.get(key) {
            if Instant::now() >= *reset_at {
                guard.remove(key);
                return false;
            }
            return *count >= self.max_failures;
        }
        false
    }

    pub async fn clear(&self, key: &str) {
        self.inner.lock().await.remove(key);
    }
}

/// Validates the bearer token and stores the caller as an [`AuthUser`]
/// extension. 401 when the header is missing or the token invalid.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match bearer_token(&request) {
        Some(token) => token,
        None => {
            return HttpAppError(AppError::Unauthorized(
                "missing bearer token".into(),
            ))
            .into_response()
        }
    };

    match state.jwt.validate(token) {
        Ok(claims) => {
            request.extensions_mut().insert(AuthUser {
                user_id: claims.sub,
                email: claims.email,
            });
            next.run(request).await
        }
        Err(e) => HttpAppError(e).into_response(),
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limiter_blocks_after_max_failures() {
        let limiter = AuthFailureLimiter::new(3, 300);
        assert!(!limiter.is_blocked("a@b.c").await);
        assert!(!limiter.record_failure("a@b.c").await);
        assert!(!limiter.record_failure("a@b.c").await);
        assert!(limiter.record_failure("a@b.c").await);
        assert!(limiter.is_blocked("a@b.c").await);
        // Other keys are unaffected.
        assert!(!limiter.is_blocked("x@y.z").await);
    }

    #[tokio::test]
    async fn clear_resets_the_counter() {
        let limiter = AuthFailureLimiter::new(1, 300);
        limiter.record_failure("a@b.c").await;
        assert!(limiter.is_blocked("a@b.c").await);
        limiter.clear("a@b.c").await;
        assert!(!limiter.is_blocked("a@b.c").await);
    }
}
