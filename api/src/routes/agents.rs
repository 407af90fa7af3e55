use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;

use parley_core::entities::Agent;

use crate::auth::{AuthenticatedUser, require_owner};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/agents", post(create_agent))
        .route("/v1/users/{user_id}/agents", get(list_agents))
        .route(
            "/v1/agents/{agent_id}",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
}

// ──────────────────────────────────────────────
// POST /v1/agents
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub prompt_body: Option<String>,
    #[serde(default)]
    pub avatar_id: Option<i32>,
    #[serde(default)]
    pub openness: Option<i32>,
    #[serde(default)]
    pub conscientiousness: Option<i32>,
    #[serde(default)]
    pub extroversion: Option<i32>,
    #[serde(default)]
    pub agreeableness: Option<i32>,
    #[serde(default)]
    pub neuroticism: Option<i32>,
}

/// POST /v1/agents — create a persona owned by the authenticated user.
#[utoipa::path(
    post,
    path = "/v1/agents",
    request_body = CreateAgentRequest,
    responses(
        (status = 201, description = "Agent created", body = Agent),
        (status = 400, description = "Validation error", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn create_agent(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<CreateAgentRequest>,
) -> Result<(StatusCode, Json<Agent>), AppError> {
    validate_name(&req.name)?;
    validate_trait_scores(&[
        ("openness", req.openness),
        ("conscientiousness", req.conscientiousness),
        ("extroversion", req.extroversion),
        ("agreeableness", req.agreeableness),
        ("neuroticism", req.neuroticism),
    ])?;

    let row = insert_agent(&state.db, user.user_id, &req).await?;

    tracing::info!(user_id = user.user_id, agent_id = row.id, "agent created");

    Ok((StatusCode::CREATED, Json(row.into_agent())))
}

// ──────────────────────────────────────────────
// GET /v1/users/{user_id}/agents
// ──────────────────────────────────────────────

/// GET /v1/users/{user_id}/agents — all agents owned by the user.
#[utoipa::path(
    get,
    path = "/v1/users/{user_id}/agents",
    params(("user_id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "Agents owned by the user", body = [Agent]),
        (status = 403, description = "Not your account", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn list_agents(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<Agent>>, AppError> {
    require_owner(&user, user_id, "GET /v1/users/{user_id}/agents")?;

    let rows = sqlx::query_as::<_, AgentRow>(
        "SELECT id, user_id, name, prompt_body, avatar_id, \
                openness, conscientiousness, extroversion, agreeableness, neuroticism \
         FROM agents WHERE user_id = $1 ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await
    .map_err(AppError::Database)?;

    Ok(Json(rows.into_iter().map(AgentRow::into_agent).collect()))
}

// ──────────────────────────────────────────────
// GET /v1/agents/{agent_id}
// ──────────────────────────────────────────────

/// GET /v1/agents/{agent_id}
#[utoipa::path(
    get,
    path = "/v1/agents/{agent_id}",
    params(("agent_id" = i64, Path, description = "Agent ID")),
    responses(
        (status = 200, description = "Agent", body = Agent),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Agent not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn get_agent(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> Result<Json<Agent>, AppError> {
    let row = fetch_agent(&state.db, agent_id).await?;
    require_owner(&user, row.user_id, "GET /v1/agents/{agent_id}")?;

    Ok(Json(row.into_agent()))
}

// ──────────────────────────────────────────────
// PUT /v1/agents/{agent_id}
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateAgentRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prompt_body: Option<String>,
    #[serde(default)]
    pub avatar_id: Option<i32>,
    #[serde(default)]
    pub openness: Option<i32>,
    #[serde(default)]
    pub conscientiousness: Option<i32>,
    #[serde(default)]
    pub extroversion: Option<i32>,
    #[serde(default)]
    pub agreeableness: Option<i32>,
    #[serde(default)]
    pub neuroticism: Option<i32>,
}

/// PUT /v1/agents/{agent_id} — partial update; absent fields keep their
/// current values.
#[utoipa::path(
    put,
    path = "/v1/agents/{agent_id}",
    params(("agent_id" = i64, Path, description = "Agent ID")),
    request_body = UpdateAgentRequest,
    responses(
        (status = 200, description = "Updated agent", body = Agent),
        (status = 400, description = "Validation error", body = parley_core::error::ApiError),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Agent not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn update_agent(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    AppJson(req): AppJson<UpdateAgentRequest>,
) -> Result<Json<Agent>, AppError> {
    let current = fetch_agent(&state.db, agent_id).await?;
    require_owner(&user, current.user_id, "PUT /v1/agents/{agent_id}")?;

    if let Some(name) = &req.name {
        validate_name(name)?;
    }
    validate_trait_scores(&[
        ("openness", req.openness),
        ("conscientiousness", req.conscientiousness),
        ("extroversion", req.extroversion),
        ("agreeableness", req.agreeableness),
        ("neuroticism", req.neuroticism),
    ])?;

    let row = update_agent_row(&state.db, agent_id, &req).await?;

    Ok(Json(row.into_agent()))
}

// ──────────────────────────────────────────────
// DELETE /v1/agents/{agent_id}
// ──────────────────────────────────────────────

/// DELETE /v1/agents/{agent_id} — conversations referencing the agent are
/// removed with it.
#[utoipa::path(
    delete,
    path = "/v1/agents/{agent_id}",
    params(("agent_id" = i64, Path, description = "Agent ID")),
    responses(
        (status = 204, description = "Agent deleted"),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Agent not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn delete_agent(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let row = fetch_agent(&state.db, agent_id).await?;
    require_owner(&user, row.user_id, "DELETE /v1/agents/{agent_id}")?;

    sqlx::query("DELETE FROM agents WHERE id = $1")
        .bind(agent_id)
        .execute(&state.db)
        .await
        .map_err(AppError::Database)?;

    tracing::info!(user_id = user.user_id, agent_id, "agent deleted");

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

/// Personality trait scores are integers from 1 (low) to 10 (high);
/// absent scores are allowed. Shared with the assessments surface.
pub(crate) fn validate_trait_scores(scores: &[(&str, Option<i32>)]) -> Result<(), AppError> {
    for (field, value) in scores {
        if let Some(v) = value {
            if !(1..=10).contains(v) {
                return Err(AppError::Validation {
                    message: format!("{field} must be between 1 and 10"),
                    field: Some((*field).to_string()),
                    received: Some(serde_json::json!(v)),
                    docs_hint: Some(
                        "Trait scores are integers from 1 (low) to 10 (high).".to_string(),
                    ),
                });
            }
        }
    }
    Ok(())
}

async fn insert_agent(
    db: &PgPool,
    user_id: i64,
    req: &CreateAgentRequest,
) -> Result<AgentRow, AppError> {
    sqlx::query_as::<_, AgentRow>(
        "INSERT INTO agents (user_id, name, prompt_body, avatar_id, \
                             openness, conscientiousness, extroversion, agreeableness, neuroticism) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING id, user_id, name, prompt_body, avatar_id, \
                   openness, conscientiousness, extroversion, agreeableness, neuroticism",
    )
    .bind(user_id)
    .bind(req.name.trim())
    .bind(&req.prompt_body)
    .bind(req.avatar_id)
    .bind(req.openness)
    .bind(req.conscientiousness)
    .bind(req.extroversion)
    .bind(req.agreeableness)
    .bind(req.neuroticism)
    .fetch_one(db)
    .await
    .map_err(AppError::Database)
}

async fn fetch_agent(db: &PgPool, agent_id: i64) -> Result<AgentRow, AppError> {
    sqlx::query_as::<_, AgentRow>(
        "SELECT id, user_id, name, prompt_body, avatar_id, \
                openness, conscientiousness, extroversion, agreeableness, neuroticism \
         FROM agents WHERE id = $1",
    )
    .bind(agent_id)
    .fetch_optional(db)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("Agent {agent_id}"),
    })
}

async fn update_agent_row(
    db: &PgPool,
    agent_id: i64,
    req: &UpdateAgentRequest,
) -> Result<AgentRow, AppError> {
    sqlx::query_as::<_, AgentRow>(
        "UPDATE agents SET \
            name = COALESCE($2, name), \
            prompt_body = COALESCE($3, prompt_body), \
            avatar_id = COALESCE($4, avatar_id), \
            openness = COALESCE($5, openness), \
            conscientiousness = COALESCE($6, conscientiousness), \
            extroversion = COALESCE($7, extroversion), \
            agreeableness = COALESCE($8, agreeableness), \
            neuroticism = COALESCE($9, neuroticism) \
         WHERE id = $1 \
         RETURNING id, user_id, name, prompt_body, avatar_id, \
                   openness, conscientiousness, extroversion, agreeableness, neuroticism",
    )
    .bind(agent_id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(&req.prompt_body)
    .bind(req.avatar_id)
    .bind(req.openness)
    .bind(req.conscientiousness)
    .bind(req.extroversion)
    .bind(req.agreeableness)
    .bind(req.neuroticism)
    .fetch_one(db)
    .await
    .map_err(AppError::Database)
}

#[derive(sqlx::FromRow, Debug)]
struct AgentRow {
    id: i64,
    user_id: i64,
    name: String,
    prompt_body: Option<String>,
    avatar_id: Option<i32>,
    openness: Option<i32>,
    conscientiousness: Option<i32>,
    extroversion: Option<i32>,
    agreeableness: Option<i32>,
    neuroticism: Option<i32>,
}

impl AgentRow {
    fn into_agent(self) -> Agent {
        Agent {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            prompt_body: self.prompt_body,
            avatar_id: self.avatar_id,
            openness: self.openness,
            conscientiousness: self.conscientiousness,
            extroversion: self.extroversion,
            agreeableness: self.agreeableness,
            neuroticism: self.neuroticism,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    #[test]
    fn trait_scores_must_sit_in_one_to_ten() {
        assert!(validate_trait_scores(&[("openness", None)]).is_ok());
        assert!(validate_trait_scores(&[("openness", Some(1))]).is_ok());
        assert!(validate_trait_scores(&[("openness", Some(10))]).is_ok());

        let err = validate_trait_scores(&[("neuroticism", Some(0))]).expect_err("0 is out");
        let AppError::Validation { field, .. } = err else {
            panic!("expected Validation");
        };
        assert_eq!(field.as_deref(), Some("neuroticism"));

        assert!(validate_trait_scores(&[("openness", Some(11))]).is_err());
    }

    #[test]
    fn agent_name_must_not_be_blank() {
        assert!(validate_name("Negotiator").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
    }

    async fn db_pool_if_available() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .ok()
    }

    async fn seed_user(pool: &PgPool) -> i64 {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO users (email, password_hash) VALUES ($1, 'x') RETURNING id",
        )
        .bind(format!("agents-{}@example.com", Uuid::now_v7()))
        .fetch_one(pool)
        .await
        .expect("seed user")
    }

    #[tokio::test]
    async fn partial_update_keeps_absent_fields() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let user_id = seed_user(&pool).await;
        let created = insert_agent(
            &pool,
            user_id,
            &CreateAgentRequest {
                name: "Negotiator".to_string(),
                prompt_body: None,
                avatar_id: Some(3),
                openness: Some(5),
                conscientiousness: None,
                extroversion: None,
                agreeableness: None,
                neuroticism: None,
            },
        )
        .await
        .expect("insert agent");

        let updated = update_agent_row(
            &pool,
            created.id,
            &UpdateAgentRequest {
                name: None,
                prompt_body: Some("Speaks in short sentences.".to_string()),
                avatar_id: None,
                openness: None,
                conscientiousness: Some(7),
                extroversion: None,
                agreeableness: None,
                neuroticism: None,
            },
        )
        .await
        .expect("update agent");

        assert_eq!(updated.name, "Negotiator");
        assert_eq!(updated.avatar_id, Some(3));
        assert_eq!(updated.openness, Some(5));
        assert_eq!(updated.conscientiousness, Some(7));
        assert_eq!(
            updated.prompt_body.as_deref(),
            Some("Speaks in short sentences.")
        );
    }

    #[tokio::test]
    async fn fetching_a_missing_agent_is_not_found() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let err = fetch_agent(&pool, 99999).await.expect_err("missing agent");
        assert!(matches!(err, AppError::NotFound { .. }));
    }
}
