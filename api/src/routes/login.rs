use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use parley_core::auth;

use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/login", post(login))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct LoginResponse {
    /// Bearer token to send as `Authorization: Bearer <token>`
    pub token: String,
    /// Token lifetime in seconds
    pub expires_in: i64,
}

/// POST /v1/login — exchange email + password for a bearer token.
#[utoipa::path(
    post,
    path = "/v1/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login succeeded", body = LoginResponse),
        (status = 401, description = "Invalid email or password", body = parley_core::error::ApiError)
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<AppState>,
    AppJson(req): AppJson<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let row = verify_credentials(&state.db, &req.email, &req.password).await?;

    let token = state.jwt.issue(row.id, &row.email)?;

    tracing::info!(user_id = row.id, "login succeeded");

    Ok(Json(LoginResponse {
        token,
        expires_in: state.jwt.ttl_secs,
    }))
}

/// Look up the account and check the password. Unknown email and wrong
/// password produce the same rejection so the response does not reveal
/// which one failed.
async fn verify_credentials(
    db: &PgPool,
    email: &str,
    password: &str,
) -> Result<CredentialsRow, AppError> {
    let row = sqlx::query_as::<_, CredentialsRow>(
        "SELECT id, email, password_hash FROM users WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(db)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(invalid_credentials)?;

    let verified = auth::verify_password(password, &row.password_hash)
        .map_err(AppError::Internal)?;
    if !verified {
        tracing::warn!(user_id = row.id, "login rejected: password mismatch");
        return Err(invalid_credentials());
    }

    Ok(row)
}

fn invalid_credentials() -> AppError {
    AppError::Unauthorized {
        message: "Invalid email or password".to_string(),
        docs_hint: None,
    }
}

#[derive(sqlx::FromRow, Debug)]
struct CredentialsRow {
    id: i64,
    email: String,
    password_hash: String,
}
