//! Registration and login: bcrypt credentials, HS256 bearer tokens.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use voidrunner_core::models::UserResponse;
use voidrunner_core::AppError;

use crate::error::HttpAppError;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserResponse,
}

#[tracing::instrument(skip(state, req))]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), HttpAppError> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let password_hash = bcrypt::hash(&req.password, bcrypt::DEFAULT_COST)
        .map_err(|e| AppError::Internal(format!("failed to hash password: {}", e)))?;
    let user = state
        .users
        .create_user(&req.email.to_lowercase(), &password_hash, &req.name)
        .await?;
    let token = state.jwt.issue(&user)?;

    tracing::info!(user_id = %user.id, "User registered");
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token,
            user: user.into(),
        }),
    ))
}

#[tracing::instrument(skip(state, req))]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, HttpAppError> {
    let email = req.email.to_lowercase();
    if state.auth_limiter.is_blocked(&email).await {
        return Err(AppError::RateLimited("too many failed login attempts".into()).into());
    }

    let user = state.users.find_by_email(&email).await?;
    // Constant-shaped failure path: a bcrypt verify runs whether or not
    // the account exists.
    let hash = user
        .as_ref()
        .map(|u| u.password_hash.as_str())
        .unwrap_or("$2b$12$C6UzMDM.H6dfI/f/IKcEeO7Ff8S1gVHqCqXl8p3S5kR0p6sXHeW6a");
    let verified = bcrypt::verify(&req.password, hash).unwrap_or(false);

    match user {
        Some(user) if verified => {
            state.auth_limiter.clear(&email).await;
            let token = state.jwt.issue(&user)?;
            tracing::info!(user_id = %user.id, "User logged in");
            Ok(Json(AuthResponse {
                token,
                user: user.into(),
            }))
        }
        _ => {
            state.auth_limiter.record_failure(&email).await;
            Err(AppError::Unauthorized("invalid email or password".into()).into())
        }
    }
}
