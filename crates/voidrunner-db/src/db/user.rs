use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use voidrunner_core::error::AppError;
use voidrunner_core::models::User;
use voidrunner_core::repository::UserRepository;

use crate::db::is_unique_violation;

const USER_COLUMNS: &str = "id, email, password_hash, name, created_at, updated_at";

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    #[tracing::instrument(skip(self, password_hash))]
    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        name: &str,
    ) -> Result<User, AppError> {
        let user = sqlx::query_as::<Postgres, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, name)
            VALUES ($1, $2, $3)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(email)
        .bind(password_hash)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(format!("email {} is already registered", email))
            } else {
                tracing::error!(error = %e, "Failed to insert user");
                AppError::Database(e)
            }
        })?;

        tracing::info!(user_id = %user.id, "User created");
        Ok(user)
    }

    #[tracing::instrument(skip(self))]
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<Postgres, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(user)
    }

    #[tracing::instrument(skip(self))]
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<Postgres, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(user)
    }
}
