use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;

use parley_core::auth;
use parley_core::entities::User;

use crate::auth::{AuthenticatedUser, require_owner};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

pub fn register_router() -> Router<AppState> {
    Router::new().route("/v1/users", post(register))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/users/{user_id}", get(get_user).delete(delete_account))
        .route("/v1/users/{user_id}/password", put(change_password))
}

// ──────────────────────────────────────────────
// POST /v1/users
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

/// POST /v1/users — register an account. The password is stored as an
/// Argon2id hash and never returned.
#[utoipa::path(
    post,
    path = "/v1/users",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = User),
        (status = 400, description = "Validation error", body = parley_core::error::ApiError),
        (status = 409, description = "Email already registered", body = parley_core::error::ApiError)
    ),
    tag = "users"
)]
pub async fn register(
    State(state): State<AppState>,
    AppJson(req): AppJson<RegisterRequest>,
) -> Result<(StatusCode, Json<User>), AppError> {
    let email = req.email.trim();
    validate_email(email)?;
    validate_new_password(&req.password)?;

    let password_hash = auth::hash_password(&req.password).map_err(AppError::Internal)?;

    let row = insert_user(&state.db, email, &password_hash).await?;

    tracing::info!(user_id = row.id, "account registered");

    Ok((StatusCode::CREATED, Json(row.into_user())))
}

// ──────────────────────────────────────────────
// GET /v1/users/{user_id}
// ──────────────────────────────────────────────

/// GET /v1/users/{user_id} — the authenticated user's own account data.
#[utoipa::path(
    get,
    path = "/v1/users/{user_id}",
    params(("user_id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "Account data", body = User),
        (status = 403, description = "Not your account", body = parley_core::error::ApiError),
        (status = 404, description = "User not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn get_user(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<User>, AppError> {
    require_owner(&user, user_id, "GET /v1/users/{user_id}")?;

    let row = sqlx::query_as::<_, UserRow>("SELECT id, email, created_at FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&state.db)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound {
            resource: format!("User {user_id}"),
        })?;

    Ok(Json(row.into_user()))
}

// ──────────────────────────────────────────────
// PUT /v1/users/{user_id}/password
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// PUT /v1/users/{user_id}/password — re-hash after verifying the current
/// password and checking the new one against the account policy.
#[utoipa::path(
    put,
    path = "/v1/users/{user_id}/password",
    params(("user_id" = i64, Path, description = "User ID")),
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password updated"),
        (status = 400, description = "New password fails the policy", body = parley_core::error::ApiError),
        (status = 401, description = "Current password is incorrect", body = parley_core::error::ApiError),
        (status = 403, description = "Not your account", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn change_password(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    AppJson(req): AppJson<ChangePasswordRequest>,
) -> Result<StatusCode, AppError> {
    require_owner(&user, user_id, "PUT /v1/users/{user_id}/password")?;

    execute_change_password(&state.db, user_id, &req.current_password, &req.new_password).await?;

    tracing::info!(user_id, "password changed");

    Ok(StatusCode::OK)
}

// ──────────────────────────────────────────────
// DELETE /v1/users/{user_id}
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct DeleteAccountRequest {
    pub password: String,
}

/// DELETE /v1/users/{user_id} — verify the password, then delete the account
/// and everything it owns (agents, scenarios, conversations, messages,
/// assessments cascade in the schema).
#[utoipa::path(
    delete,
    path = "/v1/users/{user_id}",
    params(("user_id" = i64, Path, description = "User ID")),
    request_body = DeleteAccountRequest,
    responses(
        (status = 204, description = "Account deleted"),
        (status = 401, description = "Password is incorrect", body = parley_core::error::ApiError),
        (status = 403, description = "Not your account", body = parley_core::error::ApiError),
        (status = 404, description = "User not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn delete_account(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    AppJson(req): AppJson<DeleteAccountRequest>,
) -> Result<StatusCode, AppError> {
    require_owner(&user, user_id, "DELETE /v1/users/{user_id}")?;

    execute_delete_account(&state.db, user_id, &req.password).await?;

    tracing::info!(user_id, "account deleted");

    Ok(StatusCode::NO_CONTENT)
}

// ──────────────────────────────────────────────
// Validation and database helpers
// ──────────────────────────────────────────────

fn validate_email(email: &str) -> Result<(), AppError> {
    if email.is_empty() {
        return Err(AppError::Validation {
            message: "email must not be empty".to_string(),
            field: Some("email".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    if !email.contains('@') {
        return Err(AppError::Validation {
            message: "email must contain '@'".to_string(),
            field: Some("email".to_string()),
            received: Some(serde_json::Value::String(email.to_string())),
            docs_hint: None,
        });
    }
    if email.chars().count() > 256 {
        return Err(AppError::Validation {
            message: "email must be at most 256 characters".to_string(),
            field: Some("email".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    Ok(())
}

/// Map a password-policy failure to a validation error on the right field.
fn validate_new_password(password: &str) -> Result<(), AppError> {
    auth::validate_password(password).map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("password".to_string()),
        received: None,
        docs_hint: Some(
            "Passwords need at least 6 characters with an uppercase letter, \
             a lowercase letter and a digit."
                .to_string(),
        ),
    })
}

async fn insert_user(db: &PgPool, email: &str, password_hash: &str) -> Result<UserRow, AppError> {
    sqlx::query_as::<_, UserRow>(
        "INSERT INTO users (email, password_hash) VALUES ($1, $2) \
         RETURNING id, email, created_at",
    )
    .bind(email)
    .bind(password_hash)
    .fetch_one(db)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.code().as_deref() == Some("23505") {
                return AppError::Conflict {
                    message: format!("Email '{email}' is already registered"),
                    docs_hint: Some("Log in instead, or use a different email.".to_string()),
                };
            }
        }
        AppError::Database(e)
    })
}

async fn execute_change_password(
    db: &PgPool,
    user_id: i64,
    current_password: &str,
    new_password: &str,
) -> Result<(), AppError> {
    let stored_hash = fetch_password_hash(db, user_id).await?;

    let verified =
        auth::verify_password(current_password, &stored_hash).map_err(AppError::Internal)?;
    if !verified {
        return Err(AppError::Unauthorized {
            message: "Current password is incorrect".to_string(),
            docs_hint: None,
        });
    }

    validate_new_password(new_password)?;
    let new_hash = auth::hash_password(new_password).map_err(AppError::Internal)?;

    sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
        .bind(user_id)
        .bind(&new_hash)
        .execute(db)
        .await
        .map_err(AppError::Database)?;

    Ok(())
}

async fn execute_delete_account(
    db: &PgPool,
    user_id: i64,
    password: &str,
) -> Result<(), AppError> {
    let stored_hash = fetch_password_hash(db, user_id).await?;

    let verified = auth::verify_password(password, &stored_hash).map_err(AppError::Internal)?;
    if !verified {
        return Err(AppError::Unauthorized {
            message: "Password is incorrect".to_string(),
            docs_hint: None,
        });
    }

    sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(user_id)
        .execute(db)
        .await
        .map_err(AppError::Database)?;

    Ok(())
}

async fn fetch_password_hash(db: &PgPool, user_id: i64) -> Result<String, AppError> {
    sqlx::query_scalar::<_, String>("SELECT password_hash FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(db)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound {
            resource: format!("User {user_id}"),
        })
}

#[derive(sqlx::FromRow, Debug)]
struct UserRow {
    id: i64,
    email: String,
    created_at: DateTime<Utc>,
}

impl UserRow {
    fn into_user(self) -> User {
        User {
            id: self.id,
            email: self.email,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    #[test]
    fn email_validation_covers_the_three_rules() {
        assert!(validate_email("dev@example.com").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("not-an-email").is_err());

        let long = format!("{}@example.com", "a".repeat(256));
        assert!(validate_email(&long).is_err());
    }

    #[test]
    fn policy_failures_point_at_the_password_field() {
        let err = validate_new_password("short").expect_err("policy should reject");
        let AppError::Validation { field, .. } = err else {
            panic!("expected Validation");
        };
        assert_eq!(field.as_deref(), Some("password"));
    }

    async fn db_pool_if_available() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .ok()
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let email = format!("dup-{}@example.com", Uuid::now_v7());
        let hash = auth::hash_password("Strong1pw").expect("hash");

        insert_user(&pool, &email, &hash)
            .await
            .expect("first registration should succeed");
        let err = insert_user(&pool, &email, &hash)
            .await
            .expect_err("second registration should conflict");
        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[tokio::test]
    async fn password_change_verifies_the_current_password() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let email = format!("pw-{}@example.com", Uuid::now_v7());
        let hash = auth::hash_password("Original1pw").expect("hash");
        let row = insert_user(&pool, &email, &hash).await.expect("insert");

        let err = execute_change_password(&pool, row.id, "Wrong1pw", "Replacement2pw")
            .await
            .expect_err("wrong current password should be rejected");
        assert!(matches!(err, AppError::Unauthorized { .. }));

        execute_change_password(&pool, row.id, "Original1pw", "Replacement2pw")
            .await
            .expect("correct current password should change it");

        let stored = fetch_password_hash(&pool, row.id).await.expect("fetch");
        assert!(auth::verify_password("Replacement2pw", &stored).expect("verify"));
    }

    #[tokio::test]
    async fn account_deletion_requires_the_password() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let email = format!("del-{}@example.com", Uuid::now_v7());
        let hash = auth::hash_password("Goodbye1pw").expect("hash");
        let row = insert_user(&pool, &email, &hash).await.expect("insert");

        let err = execute_delete_account(&pool, row.id, "Wrong1pw")
            .await
            .expect_err("wrong password should not delete");
        assert!(matches!(err, AppError::Unauthorized { .. }));

        execute_delete_account(&pool, row.id, "Goodbye1pw")
            .await
            .expect("correct password should delete");

        let gone = fetch_password_hash(&pool, row.id).await;
        assert!(matches!(gone, Err(AppError::NotFound { .. })));
    }
}
