use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use parley_core::entities::{ConversationStatus, Message};
use parley_core::transcript::sender_label;

use crate::auth::{AuthenticatedUser, require_owner};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::model_client::{GenerateAgent, GenerateRequest, GenerateScenario, GenerateTurn};
use crate::state::AppState;

/// Maximum accepted user message length, in characters.
const MAX_BODY_CHARS: usize = 2400;

/// Token budget passed to the generation service.
const REPLY_MAX_LENGTH: u32 = 256;

/// Agent replies are timestamped this long after the user message they
/// answer, keeping transcript order stable.
const REPLY_OFFSET_MS: i64 = 50;

const SEND_OP: &str = "POST /v1/conversations/{conversation_id}/messages";
const LIST_OP: &str = "GET /v1/conversations/{conversation_id}/messages";

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/v1/conversations/{conversation_id}/messages",
        get(list_messages).post(send_message),
    )
}

// ──────────────────────────────────────────────
// GET /v1/conversations/{conversation_id}/messages
// ──────────────────────────────────────────────

/// GET /v1/conversations/{conversation_id}/messages — every message in
/// transcript order, each labelled "User" or "Agent".
#[utoipa::path(
    get,
    path = "/v1/conversations/{conversation_id}/messages",
    params(("conversation_id" = i64, Path, description = "Conversation ID")),
    responses(
        (status = 200, description = "Messages in transcript order", body = [Message]),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Conversation not found", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "messages"
)]
pub async fn list_messages(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<Vec<Message>>, AppError> {
    let owner_id = fetch_conversation_owner(&state.db, conversation_id).await?;
    require_owner(&user, owner_id, LIST_OP)?;

    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, user_sent, body, received_at FROM messages \
         WHERE conversation_id = $1 ORDER BY received_at, id",
    )
    .bind(conversation_id)
    .fetch_all(&state.db)
    .await
    .map_err(AppError::Database)?;

    Ok(Json(rows.into_iter().map(MessageRow::into_message).collect()))
}

// ──────────────────────────────────────────────
// POST /v1/conversations/{conversation_id}/messages
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SendMessageRequest {
    pub body: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SendMessageResponse {
    /// The generated reply text
    pub reply: String,
    /// The stored agent message
    pub message: Message,
}

/// POST /v1/conversations/{conversation_id}/messages — send a message and
/// get the agent's generated reply. The user message and the reply are
/// stored together once generation succeeds; a generation failure stores
/// nothing, so the send is safe to retry.
#[utoipa::path(
    post,
    path = "/v1/conversations/{conversation_id}/messages",
    params(("conversation_id" = i64, Path, description = "Conversation ID")),
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Reply generated and stored", body = SendMessageResponse),
        (status = 400, description = "Validation error", body = parley_core::error::ApiError),
        (status = 403, description = "Owned by another user", body = parley_core::error::ApiError),
        (status = 404, description = "Conversation not found", body = parley_core::error::ApiError),
        (status = 409, description = "Conversation is completed", body = parley_core::error::ApiError),
        (status = 502, description = "Generation service unavailable", body = parley_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "messages"
)]
pub async fn send_message(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    AppJson(req): AppJson<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>), AppError> {
    validate_body(&req.body)?;

    let context = load_send_context(&state.db, &user, conversation_id).await?;
    let generate_request = build_generate_request(&context, &req.body);

    let reply = state.model.generate(&generate_request).await?;

    let (_user_message, agent_message) =
        store_exchange(&state.db, conversation_id, &req.body, &reply).await?;

    tracing::info!(
        user_id = user.user_id,
        conversation_id,
        history_len = context.history.len(),
        "message exchanged"
    );

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            reply,
            message: agent_message,
        }),
    ))
}

// ──────────────────────────────────────────────
// Validation, context assembly and storage
// ──────────────────────────────────────────────

fn validate_body(body: &str) -> Result<(), AppError> {
    if body.trim().is_empty() {
        return Err(AppError::Validation {
            message: "body must not be blank".to_string(),
            field: Some("body".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(AppError::Validation {
            message: format!("body must be at most {MAX_BODY_CHARS} characters"),
            field: Some("body".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    Ok(())
}

async fn fetch_conversation_owner(db: &PgPool, conversation_id: i64) -> Result<i64, AppError> {
    sqlx::query_scalar::<_, i64>("SELECT user_id FROM conversations WHERE id = $1")
        .bind(conversation_id)
        .fetch_optional(db)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound {
            resource: format!("Conversation {conversation_id}"),
        })
}

/// Everything the generation call needs: the agent persona, the scenario
/// prompts when the conversation was created from one, and the prior
/// messages in transcript order.
#[derive(Debug)]
struct SendContext {
    conversation: ConversationContextRow,
    scenario: Option<ScenarioContextRow>,
    history: Vec<HistoryRow>,
}

async fn load_send_context(
    db: &PgPool,
    auth: &AuthenticatedUser,
    conversation_id: i64,
) -> Result<SendContext, AppError> {
    let conversation = sqlx::query_as::<_, ConversationContextRow>(
        "SELECT c.user_id, c.status, c.scenario_id, \
                a.name AS agent_name, a.prompt_body, \
                a.openness, a.conscientiousness, a.extroversion, a.agreeableness, a.neuroticism \
         FROM conversations c \
         JOIN agents a ON a.id = c.agent_id \
         WHERE c.id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(db)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("Conversation {conversation_id}"),
    })?;

    require_owner(auth, conversation.user_id, SEND_OP)?;

    match ConversationStatus::from_db(&conversation.status) {
        Some(ConversationStatus::Active) => {}
        Some(ConversationStatus::Completed) => {
            return Err(AppError::Conflict {
                message: format!(
                    "Conversation {conversation_id} is completed and no longer accepts messages"
                ),
                docs_hint: None,
            });
        }
        None => {
            return Err(AppError::Internal(format!(
                "conversation {conversation_id} has unexpected status '{}'",
                conversation.status
            )));
        }
    }

    let scenario = match conversation.scenario_id {
        Some(scenario_id) => sqlx::query_as::<_, ScenarioContextRow>(
            "SELECT name, setting_prompt, conflict_prompt, additional_prompt \
             FROM scenarios WHERE id = $1",
        )
        .bind(scenario_id)
        .fetch_optional(db)
        .await
        .map_err(AppError::Database)?,
        None => None,
    };

    let history = sqlx::query_as::<_, HistoryRow>(
        "SELECT user_sent, body FROM messages \
         WHERE conversation_id = $1 ORDER BY received_at, id",
    )
    .bind(conversation_id)
    .fetch_all(db)
    .await
    .map_err(AppError::Database)?;

    Ok(SendContext {
        conversation,
        scenario,
        history,
    })
}

fn build_generate_request(context: &SendContext, body: &str) -> GenerateRequest {
    let agent = GenerateAgent {
        name: context.conversation.agent_name.clone(),
        prompt_body: context.conversation.prompt_body.clone(),
        openness: context.conversation.openness,
        conscientiousness: context.conversation.conscientiousness,
        extroversion: context.conversation.extroversion,
        agreeableness: context.conversation.agreeableness,
        neuroticism: context.conversation.neuroticism,
    };

    let scenario = context.scenario.as_ref().map(|s| GenerateScenario {
        name: s.name.clone(),
        setting_prompt: s.setting_prompt.clone(),
        conflict_prompt: s.conflict_prompt.clone(),
        additional_prompt: s.additional_prompt.clone(),
    });

    let history = context
        .history
        .iter()
        .map(|turn| GenerateTurn {
            sender: sender_label(turn.user_sent).to_string(),
            body: turn.body.clone(),
        })
        .collect();

    GenerateRequest {
        prompt: body.to_string(),
        max_length: REPLY_MAX_LENGTH,
        agent: Some(agent),
        scenario,
        history,
    }
}

/// Store the user message and the generated reply together; the reply is
/// timestamped after the user message.
async fn store_exchange(
    db: &PgPool,
    conversation_id: i64,
    user_body: &str,
    reply_body: &str,
) -> Result<(Message, Message), AppError> {
    let mut tx = db.begin().await.map_err(AppError::Database)?;

    let user_row = sqlx::query_as::<_, MessageRow>(
        "INSERT INTO messages (conversation_id, user_sent, body) \
         VALUES ($1, TRUE, $2) \
         RETURNING id, user_sent, body, received_at",
    )
    .bind(conversation_id)
    .bind(user_body)
    .fetch_one(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    let reply_row = sqlx::query_as::<_, MessageRow>(
        "INSERT INTO messages (conversation_id, user_sent, body, received_at) \
         VALUES ($1, FALSE, $2, $3) \
         RETURNING id, user_sent, body, received_at",
    )
    .bind(conversation_id)
    .bind(reply_body)
    .bind(user_row.received_at + Duration::milliseconds(REPLY_OFFSET_MS))
    .fetch_one(&mut *tx)
    .await
    .map_err(AppError::Database)?;

    tx.commit().await.map_err(AppError::Database)?;

    Ok((user_row.into_message(), reply_row.into_message()))
}

#[derive(sqlx::FromRow, Debug)]
struct ConversationContextRow {
    user_id: i64,
    status: String,
    scenario_id: Option<i64>,
    agent_name: String,
    prompt_body: Option<String>,
    openness: Option<i32>,
    conscientiousness: Option<i32>,
    extroversion: Option<i32>,
    agreeableness: Option<i32>,
    neuroticism: Option<i32>,
}

#[derive(sqlx::FromRow, Debug)]
struct ScenarioContextRow {
    name: String,
    setting_prompt: Option<String>,
    conflict_prompt: Option<String>,
    additional_prompt: Option<String>,
}

#[derive(sqlx::FromRow, Debug)]
struct HistoryRow {
    user_sent: bool,
    body: String,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    user_sent: bool,
    body: String,
    received_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_message(self) -> Message {
        Message {
            id: self.id,
            sender: sender_label(self.user_sent).to_string(),
            body: self.body,
            received_at: self.received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use uuid::Uuid;

    #[test]
    fn message_bodies_are_capped() {
        assert!(validate_body("Hello, how are you?").is_ok());
        assert!(validate_body(&"x".repeat(MAX_BODY_CHARS)).is_ok());
        assert!(validate_body(&"x".repeat(MAX_BODY_CHARS + 1)).is_err());
        assert!(validate_body("   ").is_err());
    }

    #[test]
    fn generate_requests_carry_persona_and_history() {
        let context = SendContext {
            conversation: ConversationContextRow {
                user_id: 1,
                status: "active".to_string(),
                scenario_id: Some(7),
                agent_name: "Skeptical manager".to_string(),
                prompt_body: Some("Pushes back on vague claims.".to_string()),
                openness: Some(4),
                conscientiousness: None,
                extroversion: None,
                agreeableness: Some(2),
                neuroticism: None,
            },
            scenario: Some(ScenarioContextRow {
                name: "Deadline dispute".to_string(),
                setting_prompt: Some("Friday afternoon standup.".to_string()),
                conflict_prompt: None,
                additional_prompt: None,
            }),
            history: vec![
                HistoryRow {
                    user_sent: true,
                    body: "We need to talk about the deadline.".to_string(),
                },
                HistoryRow {
                    user_sent: false,
                    body: "Go on.".to_string(),
                },
            ],
        };

        let request = build_generate_request(&context, "I think we should push it a week.");

        assert_eq!(request.prompt, "I think we should push it a week.");
        assert_eq!(request.max_length, REPLY_MAX_LENGTH);
        let agent = request.agent.as_ref().expect("agent context");
        assert_eq!(agent.name, "Skeptical manager");
        assert_eq!(agent.agreeableness, Some(2));
        assert!(request.scenario.is_some());
        assert_eq!(request.history.len(), 2);
        assert_eq!(request.history[0].sender, "User");
        assert_eq!(request.history[1].sender, "Agent");
    }

    async fn db_pool_if_available() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .ok()
    }

    async fn seed_conversation(pool: &PgPool, status: &str) -> (AuthenticatedUser, i64) {
        let email = format!("messages-{}@example.com", Uuid::now_v7());
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
            "INSERT INTO conversations (user_id, agent_id, title, status) \
             VALUES ($1, $2, 'Practice', $3) RETURNING id",
        )
        .bind(user_id)
        .bind(agent_id)
        .bind(status)
        .fetch_one(pool)
        .await
        .expect("seed conversation");

        (AuthenticatedUser { user_id, email }, conversation_id)
    }

    #[tokio::test]
    async fn completed_conversations_reject_new_messages() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let (auth, conversation_id) = seed_conversation(&pool, "completed").await;

        let err = load_send_context(&pool, &auth, conversation_id)
            .await
            .expect_err("completed conversation should reject sends");
        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[tokio::test]
    async fn a_missing_conversation_is_not_found() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let err = fetch_conversation_owner(&pool, 99999)
            .await
            .expect_err("missing conversation");
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn the_reply_is_timestamped_after_the_user_message() {
        let Some(pool) = db_pool_if_available().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should apply");

        let (_auth, conversation_id) = seed_conversation(&pool, "active").await;

        let (user_message, agent_message) = store_exchange(
            &pool,
            conversation_id,
            "How do I open this conversation?",
            "Start with what you observed, not what you concluded.",
        )
        .await
        .expect("store exchange");

        assert_eq!(user_message.sender, "User");
        assert_eq!(agent_message.sender, "Agent");
        assert!(agent_message.received_at > user_message.received_at);
    }
}
