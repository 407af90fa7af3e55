use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;

use parley_core::entities::Assessment;

use crate::auth::{AuthenticatedUser, require_owner};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::routes::agents::validate_trait_scores;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/assessments", post(create_assessment))
        .route("/v1/users/{user_id}/assessments", get(list_assessments))
        .route(
            "/v1/assessments/{assessment_id}",
            get(get_assessment)
                .put(update_assessment)
                .delete(delete_assessment),
        )
}

// ──────────────────────────────────────────────
// POST /v1/assessments
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateAssessmentRequest {
    pub conversation_id: i64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub conflict_management_strategy: Option<String>,
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

/// POST /v1/assessments — attach an assessment to one of the user's
/// conversations. The completion pipeline writes through its own path; this
/// surface is for manual or imported assessments.
#[utoipa::path(
    post,
    path = "/v1/assessments",
    request_body = CreateAssessmentRequest,
    responses(
        (status = 201, description = "Assessment created", body = Assessment),
        (status = 400, description = "Validation error", body = parley_core::error::ApiError),
        (status = 403, description = "Conversation owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Conversation not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "assessments"
)]
pub async fn create_assessment(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<CreateAssessmentRequest>,
) -> Result<(StatusCode, Json<Assessment>), AppError> {
    validate_trait_scores(&[
        ("openness", req.openness),
        ("conscientiousness", req.conscientiousness),
        ("extroversion", req.extroversion),
        ("agreeableness", req.agreeableness),
        ("neuroticism", req.neuroticism),
    ])?;

    let row = execute_create(&state.db, &user, &req).await?;

    tracing::info!(
        user_id = user.user_id,
        assessment_id = row.id,
        conversation_id = row.conversation_id,
        "assessment created"
    );

    Ok((StatusCode::CREATED, Json(row.into_assessment())))
}

// ──────────────────────────────────────────────
// GET /v1/users/{user_id}/assessments
// ──────────────────────────────────────────────

/// GET /v1/users/{user_id}/assessments
#[utoipa::path(
    get,
    path = "/v1/users/{user_id}/assessments",
    params(("user_id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "Assessments owned by the user", body = [Assessment]),
        (status = 403, description = "Not your account", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "assessments"
)]
pub async fn list_assessments(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<Assessment>>, AppError> {
    require_owner(&user, user_id, "GET /v1/users/{user_id}/assessments")?;

    let rows = sqlx::query_as::<_, AssessmentRow>(
        "SELECT id, user_id, conversation_id, body, conflict_management_strategy, \
                openness, conscientiousness, extroversion, agreeableness, neuroticism \
         FROM assessments WHERE user_id = $1 ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await
    .map_err(AppError::Database)?;

    Ok(Json(
        rows.into_iter().map(AssessmentRow::into_assessment).collect(),
    ))
}

// ──────────────────────────────────────────────
// GET /v1/assessments/{assessment_id}
// ──────────────────────────────────────────────

/// GET /v1/assessments/{assessment_id}
#[utoipa::path(
    get,
    path = "/v1/assessments/{assessment_id}",
    params(("assessment_id" = i64, Path, description = "Assessment ID")),
    responses(
        (status = 200, description = "Assessment", body = Assessment),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Assessment not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "assessments"
)]
pub async fn get_assessment(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(assessment_id): Path<i64>,
) -> Result<Json<Assessment>, AppError> {
    let row = fetch_assessment(&state.db, assessment_id).await?;
    require_owner(&user, row.user_id, "GET /v1/assessments/{assessment_id}")?;

    Ok(Json(row.into_assessment()))
}

// ──────────────────────────────────────────────
// PUT /v1/assessments/{assessment_id}
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateAssessmentRequest {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub conflict_management_strategy: Option<String>,
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

/// PUT /v1/assessments/{assessment_id} — partial update; absent fields keep
/// their current values, present trait scores overwrite them.
#[utoipa::path(
    put,
    path = "/v1/assessments/{assessment_id}",
    params(("assessment_id" = i64, Path, description = "Assessment ID")),
    request_body = UpdateAssessmentRequest,
    responses(
        (status = 200, description = "Updated assessment", body = Assessment),
        (status = 400, description = "Validation error", body = parley_core::error::ApiError),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Assessment not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "assessments"
)]
pub async fn update_assessment(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(assessment_id): Path<i64>,
    AppJson(req): AppJson<UpdateAssessmentRequest>,
) -> Result<Json<Assessment>, AppError> {
    let current = fetch_assessment(&state.db, assessment_id).await?;
    require_owner(&user, current.user_id, "PUT /v1/assessments/{assessment_id}")?;

    validate_trait_scores(&[
        ("openness", req.openness),
        ("conscientiousness", req.conscientiousness),
        ("extroversion", req.extroversion),
        ("agreeableness", req.agreeableness),
        ("neuroticism", req.neuroticism),
    ])?;

    let row = update_assessment_row(&state.db, assessment_id, &req).await?;

    Ok(Json(row.into_assessment()))
}

// ──────────────────────────────────────────────
// DELETE /v1/assessments/{assessment_id}
// ──────────────────────────────────────────────

/// DELETE /v1/assessments/{assessment_id}
#[utoipa::path(
    delete,
    path = "/v1/assessments/{assessment_id}",
    params(("assessment_id" = i64, Path, description = "Assessment ID")),
    responses(
        (status = 204, description = "Assessment deleted"),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Assessment not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "assessments"
)]
pub async fn delete_assessment(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(assessment_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let row = fetch_assessment(&state.db, assessment_id).await?;
    require_owner(&user, row.user_id, "DELETE /v1/assessments/{assessment_id}")?;

    sqlx::query("DELETE FROM assessments WHERE id = $1")
        .bind(assessment_id)
        .execute(&state.db)
        .await
        .map_err(AppError::Database)?;

    tracing::info!(user_id = user.user_id, assessment_id, "assessment deleted");

    Ok(StatusCode::NO_CONTENT)
}

// ──────────────────────────────────────────────
// Database helpers
// ──────────────────────────────────────────────

async fn execute_create(
    db: &PgPool,
    auth: &AuthenticatedUser,
    req: &CreateAssessmentRequest,
) -> Result<AssessmentRow, AppError> {
    let conversation_owner =
        sqlx::query_scalar::<_, i64>("SELECT user_id FROM conversations WHERE id = $1")
            .bind(req.conversation_id)
            .fetch_optional(db)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound {
                resource: format!("Conversation {}", req.conversation_id),
            })?;
    require_owner(auth, conversation_owner, "POST /v1/assessments")?;

    sqlx::query_as::<_, AssessmentRow>(
        "INSERT INTO assessments (user_id, conversation_id, body, conflict_management_strategy, \
                                  openness, conscientiousness, extroversion, agreeableness, neuroticism) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING id, user_id, conversation_id, body, conflict_management_strategy, \
                   openness, conscientiousness, extroversion, agreeableness, neuroticism",
    )
    .bind(auth.user_id)
    .bind(req.conversation_id)
    .bind(&req.body)
    .bind(&req.conflict_management_strategy)
    .bind(req.openness)
    .bind(req.conscientiousness)
    .bind(req.extroversion)
    .bind(req.agreeableness)
    .bind(req.neuroticism)
    .fetch_one(db)
    .await
    .map_err(AppError::Database)
}

async fn fetch_assessment(db: &PgPool, assessment_id: i64) -> Result<AssessmentRow, AppError> {
    sqlx::query_as::<_, AssessmentRow>(
        "SELECT id, user_id, conversation_id, body, conflict_management_strategy, \
                openness, conscientiousness, extroversion, agreeableness, neuroticism \
         FROM assessments WHERE id = $1",
    )
    .bind(assessment_id)
    .fetch_optional(db)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("Assessment {assessment_id}"),
    })
}

async fn update_assessment_row(
    db: &PgPool,
    assessment_id: i64,
    req: &UpdateAssessmentRequest,
) -> Result<AssessmentRow, AppError> {
    sqlx::query_as::<_, AssessmentRow>(
        "UPDATE assessments SET \
            body = COALESCE($2, body), \
            conflict_management_strategy = COALESCE($3, conflict_management_strategy), \
            openness = COALESCE($4, openness), \
            conscientiousness = COALESCE($5, conscientiousness), \
            extroversion = COALESCE($6, extroversion), \
            agreeableness = COALESCE($7, agreeableness), \
            neuroticism = COALESCE($8, neuroticism) \
         WHERE id = $1 \
         RETURNING id, user_id, conversation_id, body, conflict_management_strategy, \
                   openness, conscientiousness, extroversion, agreeableness, neuroticism",
    )
    .bind(assessment_id)
    .bind(&req.body)
    .bind(&req.conflict_management_strategy)
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
struct AssessmentRow {
    id: i64,
    user_id: i64,
    conversation_id: i64,
    body: Option<String>,
    conflict_management_strategy: Option<String>,
    openness: Option<i32>,
    conscientiousness: Option<i32>,
    extroversion: Option<i32>,
    agreeableness: Option<i32>,
    neuroticism: Option<i32>,
}

impl AssessmentRow {
    fn into_assessment(self) -> Assessment {
        Assessment {
            id: self.id,
            user_id: self.user_id,
            conversation_id: self.conversation_id,
            body: self.body,
            conflict_management_strategy: self.conflict_management_strategy,
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

    async fn db_pool_if_available() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .ok()
    }

    async fn seed_conversation(pool: &PgPool) -> (AuthenticatedUser, i64) {
        let email = format!("assessments-{}@example.com", Uuid::now_v7());
        let user_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO users (email, password_hash) VALUES ($1, 'x') RETURNING id",
        )
        .bind(&email)
        .fetch_one(pool)
        .await
        .expect("seed user");

        let agent_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO agents (user_id, name) VALUES ($1, 'Partner') RETURNING id",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await
        .expect("seed agent");

        let conversation_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO conversations (user_id, agent_id, title) \
             VALUES ($1, $2, 'Practice') RETURNING id",
        )
        .bind(user_id)
        .bind(agent_id)
        .fetch_one(pool)
        .await
        .expect("seed conversation");

        (AuthenticatedUser { user_id, email }, conversation_id)
    }

    fn create_request(conversation_id: i64) -> CreateAssessmentRequest {
        CreateAssessmentRequest {
            conversation_id,
            body: Some("Initial read".to_string()),
            conflict_management_strategy: None,
            openness: Some(5),
            conscientiousness: None,
            extroversion: None,
            agreeableness: None,
            neuroticism: None,
        }
    }

    #[tokio::test]
    async fn creating_requires_an_owned_conversation() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let (owner, conversation_id) = seed_conversation(&pool).await;
        let (intruder, _) = seed_conversation(&pool).await;

        let err = execute_create(&pool, &intruder, &create_request(conversation_id))
            .await
            .expect_err("foreign conversation should be rejected");
        assert!(matches!(err, AppError::Forbidden { .. }));

        let err = execute_create(&pool, &owner, &create_request(99999))
            .await
            .expect_err("missing conversation should be 404");
        assert!(matches!(err, AppError::NotFound { .. }));

        let row = execute_create(&pool, &owner, &create_request(conversation_id))
            .await
            .expect("own conversation should work");
        assert_eq!(row.user_id, owner.user_id);
    }

    #[tokio::test]
    async fn updates_coalesce_text_and_overwrite_present_traits() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let (owner, conversation_id) = seed_conversation(&pool).await;
        let created = execute_create(&pool, &owner, &create_request(conversation_id))
            .await
            .expect("create assessment");

        let updated = update_assessment_row(
            &pool,
            created.id,
            &UpdateAssessmentRequest {
                body: None,
                conflict_management_strategy: Some("Avoidance".to_string()),
                openness: Some(9),
                conscientiousness: None,
                extroversion: None,
                agreeableness: None,
                neuroticism: None,
            },
        )
        .await
        .expect("update assessment");

        assert_eq!(updated.body.as_deref(), Some("Initial read"));
        assert_eq!(
            updated.conflict_management_strategy.as_deref(),
            Some("Avoidance")
        );
        assert_eq!(updated.openness, Some(9));
        assert_eq!(updated.conscientiousness, None);
    }
}
