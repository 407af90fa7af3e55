use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sqlx::PgPool;

use parley_core::entities::{
    AgentRef, Conversation, ConversationDetail, ConversationStatus, ConversationSummary,
    ScenarioRef,
};

use crate::auth::{AuthenticatedUser, require_owner};
use crate::completion::{self, CompletionResponse};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;

/// Scenario seed replies land this long after the opener so the transcript
/// orders them deterministically.
const SEED_REPLY_OFFSET_MS: i64 = 50;

const MAX_TITLE_CHARS: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/conversations", post(create_conversation))
        .route("/v1/users/{user_id}/conversations", get(list_conversations))
        .route(
            "/v1/conversations/{conversation_id}",
            get(get_conversation).delete(delete_conversation),
        )
}

/// Separate router so completion gets its own rate limit: it is the most
/// expensive call in the API.
pub fn complete_router() -> Router<AppState> {
    Router::new().route(
        "/v1/conversations/{conversation_id}/complete",
        put(complete_conversation),
    )
}

// ──────────────────────────────────────────────
// POST /v1/conversations
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateConversationRequest {
    pub title: String,
    pub agent_id: i64,
    #[serde(default)]
    pub scenario_id: Option<i64>,
}

/// POST /v1/conversations — start a conversation with one of the user's
/// agents, optionally seeded from a scenario's opening exchange.
#[utoipa::path(
    post,
    path = "/v1/conversations",
    request_body = CreateConversationRequest,
    responses(
        (status = 201, description = "Conversation created", body = Conversation),
        (status = 400, description = "Validation error", body = parley_core::error::ApiError),
        (status = 403, description = "Agent or scenario owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Agent or scenario not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn create_conversation(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), AppError> {
    validate_title(&req.title)?;

    let conversation = execute_create(&state.db, &user, &req).await?;

    tracing::info!(
        user_id = user.user_id,
        conversation_id = conversation.id,
        agent_id = conversation.agent_id,
        seeded = conversation.scenario_id.is_some(),
        "conversation created"
    );

    Ok((StatusCode::CREATED, Json(conversation)))
}

// ──────────────────────────────────────────────
// GET /v1/users/{user_id}/conversations
// ──────────────────────────────────────────────

/// GET /v1/users/{user_id}/conversations — summaries, most recent first.
#[utoipa::path(
    get,
    path = "/v1/users/{user_id}/conversations",
    params(("user_id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "Conversations owned by the user", body = [ConversationSummary]),
        (status = 403, description = "Not your account", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn list_conversations(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<ConversationSummary>>, AppError> {
    require_owner(&user, user_id, "GET /v1/users/{user_id}/conversations")?;

    let rows = sqlx::query_as::<_, SummaryRow>(
        "SELECT id, title, status, created_at \
         FROM conversations WHERE user_id = $1 \
         ORDER BY created_at DESC, id DESC",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await
    .map_err(AppError::Database)?;

    let summaries = rows
        .into_iter()
        .map(SummaryRow::into_summary)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(summaries))
}

// ──────────────────────────────────────────────
// GET /v1/conversations/{conversation_id}
// ──────────────────────────────────────────────

/// GET /v1/conversations/{conversation_id} — full detail with the agent and
/// scenario display names embedded.
#[utoipa::path(
    get,
    path = "/v1/conversations/{conversation_id}",
    params(("conversation_id" = i64, Path, description = "Conversation ID")),
    responses(
        (status = 200, description = "Conversation detail", body = ConversationDetail),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Conversation not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn get_conversation(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<ConversationDetail>, AppError> {
    let row = sqlx::query_as::<_, DetailRow>(
        "SELECT c.id, c.user_id, c.agent_id, c.scenario_id, c.title, c.status, c.created_at, \
                c.time_elapsed_ms, c.message_count, c.token_count, \
                a.name AS agent_name, s.name AS scenario_name \
         FROM conversations c \
         JOIN agents a ON a.id = c.agent_id \
         LEFT JOIN scenarios s ON s.id = c.scenario_id \
         WHERE c.id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(&state.db)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("Conversation {conversation_id}"),
    })?;

    require_owner(&user, row.user_id, "GET /v1/conversations/{conversation_id}")?;

    Ok(Json(row.into_detail()?))
}

// ──────────────────────────────────────────────
// DELETE /v1/conversations/{conversation_id}
// ──────────────────────────────────────────────

/// DELETE /v1/conversations/{conversation_id} — messages and assessments
/// cascade in the schema.
#[utoipa::path(
    delete,
    path = "/v1/conversations/{conversation_id}",
    params(("conversation_id" = i64, Path, description = "Conversation ID")),
    responses(
        (status = 204, description = "Conversation deleted"),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Conversation not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn delete_conversation(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let owner_id =
        sqlx::query_scalar::<_, i64>("SELECT user_id FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&state.db)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound {
                resource: format!("Conversation {conversation_id}"),
            })?;

    require_owner(&user, owner_id, "DELETE /v1/conversations/{conversation_id}")?;

    sqlx::query("DELETE FROM conversations WHERE id = $1")
        .bind(conversation_id)
        .execute(&state.db)
        .await
        .map_err(AppError::Database)?;

    tracing::info!(user_id = user.user_id, conversation_id, "conversation deleted");

    Ok(StatusCode::NO_CONTENT)
}

// ──────────────────────────────────────────────
// PUT /v1/conversations/{conversation_id}/complete
// ──────────────────────────────────────────────

/// PUT /v1/conversations/{conversation_id}/complete — end the conversation
/// and run the assessment pipeline. Completing an already-completed
/// conversation changes nothing and returns the current state.
#[utoipa::path(
    put,
    path = "/v1/conversations/{conversation_id}/complete",
    params(("conversation_id" = i64, Path, description = "Conversation ID")),
    responses(
        (status = 200, description = "Completion result", body = CompletionResponse),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Conversation not found", body = parley_core::error::ApiError),
        (status = 502, description = "Assessment service unavailable", body = parley_core::error::ApiError),
        (status = 500, description = "Assessment failed or could not be stored", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "conversations"
)]
pub async fn complete_conversation(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<CompletionResponse>, AppError> {
    let response = completion::complete_conversation(&state, &user, conversation_id).await?;
    Ok(Json(response))
}

// ──────────────────────────────────────────────
// Validation and database helpers
// ──────────────────────────────────────────────

fn validate_title(title: &str) -> Result<(), AppError> {
    if title.trim().is_empty() {
        return Err(AppError::Validation {
            message: "title must not be blank".to_string(),
            field: Some("title".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(AppError::Validation {
            message: format!("title must be at most {MAX_TITLE_CHARS} characters"),
            field: Some("title".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    Ok(())
}

/// Insert the conversation and, when the scenario carries both seed texts,
/// its opening exchange, in one transaction.
async fn execute_create(
    db: &PgPool,
    auth: &AuthenticatedUser,
    req: &CreateConversationRequest,
) -> Result<Conversation, AppError> {
    let mut tx = db.begin().await.map_err(AppError::Database)?;

    let agent_owner = sqlx::query_scalar::<_, i64>("SELECT user_id FROM agents WHERE id = $1")
        .bind(req.agent_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound {
            resource: format!("Agent {}", req.agent_id),
        })?;
    require_owner(auth, agent_owner, "POST /v1/conversations")?;

    let seed = match req.scenario_id {
        Some(scenario_id) => {
            let row = sqlx::query_as::<_, SeedRow>(
                "SELECT user_id, initial_user_message, initial_agent_message \
                 FROM scenarios WHERE id = $1",
            )
            .bind(scenario_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound {
                resource: format!("Scenario {scenario_id}"),
            })?;
            require_owner(auth, row.user_id, "POST /v1/conversations")?;
            Some(row)
        }
        None => None,
    };

    let row = sqlx::query_as::<_, ConversationRow>(
        "INSERT INTO conversations (user_id, agent_id, scenario_id, title) \
         VALUES ($1, $2, $3, $4) \
         RETURNING id, user_id, agent_id, scenario_id, title, status, created_at, \
                   time_elapsed_ms, message_count, token_count",
    )
    .bind(auth.user_id)
    .bind(req.agent_id)
    .bind(req.scenario_id)
    .bind(req.title.trim())
    .fetch_one(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    if let Some(seed) = seed {
        if let (Some(opener), Some(reply)) =
            (&seed.initial_user_message, &seed.initial_agent_message)
        {
            sqlx::query(
                "INSERT INTO messages (conversation_id, user_sent, body, received_at) \
                 VALUES ($1, TRUE, $2, $3), ($1, FALSE, $4, $5)",
            )
            .bind(row.id)
            .bind(opener)
            .bind(row.created_at)
            .bind(reply)
            .bind(row.created_at + Duration::milliseconds(SEED_REPLY_OFFSET_MS))
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        }
    }

    tx.commit().await.map_err(AppError::Database)?;

    row.into_conversation()
}

fn parse_status(id: i64, status: &str) -> Result<ConversationStatus, AppError> {
    ConversationStatus::from_db(status).ok_or_else(|| {
        AppError::Internal(format!("conversation {id} has unexpected status '{status}'"))
    })
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: i64,
    user_id: i64,
    agent_id: i64,
    scenario_id: Option<i64>,
    title: String,
    status: String,
    created_at: DateTime<Utc>,
    time_elapsed_ms: Option<i64>,
    message_count: Option<i32>,
    token_count: Option<i32>,
}

impl ConversationRow {
    fn into_conversation(self) -> Result<Conversation, AppError> {
        let status = parse_status(self.id, &self.status)?;
        Ok(Conversation {
            id: self.id,
            user_id: self.user_id,
            agent_id: self.agent_id,
            scenario_id: self.scenario_id,
            title: self.title,
            status,
            created_at: self.created_at,
            time_elapsed_ms: self.time_elapsed_ms,
            message_count: self.message_count,
            token_count: self.token_count,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: i64,
    title: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl SummaryRow {
    fn into_summary(self) -> Result<ConversationSummary, AppError> {
        let status = parse_status(self.id, &self.status)?;
        Ok(ConversationSummary {
            id: self.id,
            title: self.title,
            status,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DetailRow {
    id: i64,
    user_id: i64,
    agent_id: i64,
    scenario_id: Option<i64>,
    title: String,
    status: String,
    created_at: DateTime<Utc>,
    time_elapsed_ms: Option<i64>,
    message_count: Option<i32>,
    token_count: Option<i32>,
    agent_name: String,
    scenario_name: Option<String>,
}

impl DetailRow {
    fn into_detail(self) -> Result<ConversationDetail, AppError> {
        let status = parse_status(self.id, &self.status)?;
        let agent = AgentRef {
            id: self.agent_id,
            name: self.agent_name,
        };
        let scenario = self
            .scenario_id
            .zip(self.scenario_name)
            .map(|(id, name)| ScenarioRef { id, name });

        Ok(ConversationDetail {
            conversation: Conversation {
                id: self.id,
                user_id: self.user_id,
                agent_id: self.agent_id,
                scenario_id: self.scenario_id,
                title: self.title,
                status,
                created_at: self.created_at,
                time_elapsed_ms: self.time_elapsed_ms,
                message_count: self.message_count,
                token_count: self.token_count,
            },
            agent,
            scenario,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SeedRow {
    user_id: i64,
    initial_user_message: Option<String>,
    initial_agent_message: Option<String>,
}
