use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;

use parley_core::entities::Scenario;

use crate::auth::{AuthenticatedUser, require_owner};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/scenarios", post(create_scenario))
        .route("/v1/users/{user_id}/scenarios", get(list_scenarios))
        .route(
            "/v1/scenarios/{scenario_id}",
            get(get_scenario).put(update_scenario).delete(delete_scenario),
        )
}

// ──────────────────────────────────────────────
// POST /v1/scenarios
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateScenarioRequest {
    pub name: String,
    #[serde(default)]
    pub setting_prompt: Option<String>,
    #[serde(default)]
    pub conflict_prompt: Option<String>,
    #[serde(default)]
    pub additional_prompt: Option<String>,
    /// User-voiced opener seeded into conversations created from this scenario
    #[serde(default)]
    pub initial_user_message: Option<String>,
    /// Agent-voiced reply seeded 50 ms after the opener
    #[serde(default)]
    pub initial_agent_message: Option<String>,
}

/// POST /v1/scenarios — create a practice scenario owned by the
/// authenticated user.
#[utoipa::path(
    post,
    path = "/v1/scenarios",
    request_body = CreateScenarioRequest,
    responses(
        (status = 201, description = "Scenario created", body = Scenario),
        (status = 400, description = "Validation error", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "scenarios"
)]
pub async fn create_scenario(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<CreateScenarioRequest>,
) -> Result<(StatusCode, Json<Scenario>), AppError> {
    validate_name(&req.name)?;

    let row = insert_scenario(&state.db, user.user_id, &req).await?;

    tracing::info!(user_id = user.user_id, scenario_id = row.id, "scenario created");

    Ok((StatusCode::CREATED, Json(row.into_scenario())))
}

// ──────────────────────────────────────────────
// GET /v1/users/{user_id}/scenarios
// ──────────────────────────────────────────────

/// GET /v1/users/{user_id}/scenarios
#[utoipa::path(
    get,
    path = "/v1/users/{user_id}/scenarios",
    params(("user_id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "Scenarios owned by the user", body = [Scenario]),
        (status = 403, description = "Not your account", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "scenarios"
)]
pub async fn list_scenarios(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<Scenario>>, AppError> {
    require_owner(&user, user_id, "GET /v1/users/{user_id}/scenarios")?;

    let rows = sqlx::query_as::<_, ScenarioRow>(
        "SELECT id, user_id, name, setting_prompt, conflict_prompt, additional_prompt, \
                initial_user_message, initial_agent_message, created_at \
         FROM scenarios WHERE user_id = $1 ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await
    .map_err(AppError::Database)?;

    Ok(Json(
        rows.into_iter().map(ScenarioRow::into_scenario).collect(),
    ))
}

// ──────────────────────────────────────────────
// GET /v1/scenarios/{scenario_id}
// ──────────────────────────────────────────────

/// GET /v1/scenarios/{scenario_id}
#[utoipa::path(
    get,
    path = "/v1/scenarios/{scenario_id}",
    params(("scenario_id" = i64, Path, description = "Scenario ID")),
    responses(
        (status = 200, description = "Scenario", body = Scenario),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Scenario not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "scenarios"
)]
pub async fn get_scenario(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(scenario_id): Path<i64>,
) -> Result<Json<Scenario>, AppError> {
    let row = fetch_scenario(&state.db, scenario_id).await?;
    require_owner(&user, row.user_id, "GET /v1/scenarios/{scenario_id}")?;

    Ok(Json(row.into_scenario()))
}

// ──────────────────────────────────────────────
// PUT /v1/scenarios/{scenario_id}
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateScenarioRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub setting_prompt: Option<String>,
    #[serde(default)]
    pub conflict_prompt: Option<String>,
    #[serde(default)]
    pub additional_prompt: Option<String>,
    #[serde(default)]
    pub initial_user_message: Option<String>,
    #[serde(default)]
    pub initial_agent_message: Option<String>,
}

/// PUT /v1/scenarios/{scenario_id} — partial update; absent fields keep
/// their current values.
#[utoipa::path(
    put,
    path = "/v1/scenarios/{scenario_id}",
    params(("scenario_id" = i64, Path, description = "Scenario ID")),
    request_body = UpdateScenarioRequest,
    responses(
        (status = 200, description = "Updated scenario", body = Scenario),
        (status = 400, description = "Validation error", body = parley_core::error::ApiError),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Scenario not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "scenarios"
)]
pub async fn update_scenario(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(scenario_id): Path<i64>,
    AppJson(req): AppJson<UpdateScenarioRequest>,
) -> Result<Json<Scenario>, AppError> {
    let current = fetch_scenario(&state.db, scenario_id).await?;
    require_owner(&user, current.user_id, "PUT /v1/scenarios/{scenario_id}")?;

    if let Some(name) = &req.name {
        validate_name(name)?;
    }

    let row = update_scenario_row(&state.db, scenario_id, &req).await?;

    Ok(Json(row.into_scenario()))
}

// ──────────────────────────────────────────────
// DELETE /v1/scenarios/{scenario_id}
// ──────────────────────────────────────────────

/// DELETE /v1/scenarios/{scenario_id} — conversations created from the
/// scenario are detached (scenario_id set to NULL), never deleted.
#[utoipa::path(
    delete,
    path = "/v1/scenarios/{scenario_id}",
    params(("scenario_id" = i64, Path, description = "Scenario ID")),
    responses(
        (status = 204, description = "Scenario deleted"),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Scenario not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "scenarios"
)]
pub async fn delete_scenario(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(scenario_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let row = fetch_scenario(&state.db, scenario_id).await?;
    require_owner(&user, row.user_id, "DELETE /v1/scenarios/{scenario_id}")?;

    sqlx::query("DELETE FROM scenarios WHERE id = $1")
        .bind(scenario_id)
        .execute(&state.db)
        .await
        .map_err(AppError::Database)?;

    tracing::info!(user_id = user.user_id, scenario_id, "scenario deleted");

    Ok(StatusCode::NO_CONTENT)
}

// ──────────────────────────────────────────────
// Validation and database helpers
// ──────────────────────────────────────────────

fn validate_name(name: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::Validation {
            message: "name must not be blank".to_string(),
            field: Some("name".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    Ok(())
}

async fn insert_scenario(
    db: &PgPool,
    user_id: i64,
    req: &CreateScenarioRequest,
) -> Result<ScenarioRow, AppError> {
    sqlx::query_as::<_, ScenarioRow>(
        "INSERT INTO scenarios (user_id, name, setting_prompt, conflict_prompt, \
                                additional_prompt, initial_user_message, initial_agent_message) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING id, user_id, name, setting_prompt, conflict_prompt, additional_prompt, \
                   initial_user_message, initial_agent_message, created_at",
    )
    .bind(user_id)
    .bind(req.name.trim())
    .bind(&req.setting_prompt)
    .bind(&req.conflict_prompt)
    .bind(&req.additional_prompt)
    .bind(&req.initial_user_message)
    .bind(&req.initial_agent_message)
    .fetch_one(db)
    .await
    .map_err(AppError::Database)
}

async fn fetch_scenario(db: &PgPool, scenario_id: i64) -> Result<ScenarioRow, AppError> {
    sqlx::query_as::<_, ScenarioRow>(
        "SELECT id, user_id, name, setting_prompt, conflict_prompt, additional_prompt, \
                initial_user_message, initial_agent_message, created_at \
         FROM scenarios WHERE id = $1",
    )
    .bind(scenario_id)
    .fetch_optional(db)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("Scenario {scenario_id}"),
    })
}

async fn update_scenario_row(
    db: &PgPool,
    scenario_id: i64,
    req: &UpdateScenarioRequest,
) -> Result<ScenarioRow, AppError> {
    sqlx::query_as::<_, ScenarioRow>(
        "UPDATE scenarios SET \
            name = COALESCE($2, name), \
            setting_prompt = COALESCE($3, setting_prompt), \
            conflict_prompt = COALESCE($4, conflict_prompt), \
            additional_prompt = COALESCE($5, additional_prompt), \
            initial_user_message = COALESCE($6, initial_user_message), \
            initial_agent_message = COALESCE($7, initial_agent_message) \
         WHERE id = $1 \
         RETURNING id, user_id, name, setting_prompt, conflict_prompt, additional_prompt, \
                   initial_user_message, initial_agent_message, created_at",
    )
    .bind(scenario_id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(&req.setting_prompt)
    .bind(&req.conflict_prompt)
    .bind(&req.additional_prompt)
    .bind(&req.initial_user_message)
    .bind(&req.initial_agent_message)
    .fetch_one(db)
    .await
    .map_err(AppError::Database)
}

#[derive(sqlx::FromRow)]
struct ScenarioRow {
    id: i64,
    user_id: i64,
    name: String,
    setting_prompt: Option<String>,
    conflict_prompt: Option<String>,
    additional_prompt: Option<String>,
    initial_user_message: Option<String>,
    initial_agent_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl ScenarioRow {
    fn into_scenario(self) -> Scenario {
        Scenario {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            setting_prompt: self.setting_prompt,
            conflict_prompt: self.conflict_prompt,
            additional_prompt: self.additional_prompt,
            initial_user_message: self.initial_user_message,
            initial_agent_message: self.initial_agent_message,
            created_at: self.created_at,
        }
    }
}
