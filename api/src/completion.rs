use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use utoipa::ToSchema;

use parley_core::entities::{Assessment, Conversation, ConversationStatus};
use parley_core::transcript::{TranscriptMessage, render_transcript};

use crate::auth::{AuthenticatedUser, require_owner};
use crate::error::AppError;
use crate::model_client::AssessmentReport;
use crate::state::{AppState, CompletionPolicy};

const COMPLETE_OP: &str = "PUT /v1/conversations/{conversation_id}/complete";

/// Response for `PUT /v1/conversations/{conversation_id}/complete`.
#[derive(Debug, Serialize, ToSchema)]
pub struct CompletionResponse {
    pub conversation: Conversation,
    /// The assessment created by this completion, or the latest stored one
    /// when the conversation was already completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<Assessment>,
    /// True when the conversation was already completed and nothing changed.
    pub already_completed: bool,
}

/// Completion orchestrator: flips the conversation to completed, assembles
/// the transcript, calls the assessment service and persists the result.
/// Concurrent completions of the same conversation serialize on a row lock;
/// the loser observes `completed` and no-ops.
pub async fn complete_conversation(
    state: &AppState,
    auth: &AuthenticatedUser,
    conversation_id: i64,
) -> Result<CompletionResponse, AppError> {
    match state.completion_policy {
        CompletionPolicy::FlipFirst => complete_flip_first(state, auth, conversation_id).await,
        CompletionPolicy::AssessFirst => complete_assess_first(state, auth, conversation_id).await,
    }
}

async fn complete_flip_first(
    state: &AppState,
    auth: &AuthenticatedUser,
    conversation_id: i64,
) -> Result<CompletionResponse, AppError> {
    // Phase 1: lock, flip, commit. The completed state is durable before the
    // model service is consulted.
    let mut tx = state.db.begin().await?;
    let locked = lock_conversation(&mut tx, conversation_id).await?;
    require_owner(auth, locked.user_id, COMPLETE_OP)?;

    if parse_status(locked.id, &locked.status)? == ConversationStatus::Completed {
        tx.commit().await?;
        return already_completed(&state.db, locked).await;
    }

    let messages = load_messages(&mut tx, conversation_id).await?;
    let metrics = completion_metrics(locked.created_at, &messages);
    let owner_id = locked.user_id;
    let conversation = flip_to_completed(&mut tx, conversation_id, &metrics).await?;
    tx.commit().await?;

    // Phase 2: model call, with the completed flag already durable.
    let transcript = render_transcript(into_transcript(messages));
    let report = state
        .model
        .assess(&transcript)
        .await
        .map_err(|err| completed_without_assessment(conversation_id, err))?;

    // Phase 3: persist the result.
    let assessment = persist_assessment(&state.db, owner_id, conversation_id, &report)
        .await
        .map_err(|err| completed_without_assessment(conversation_id, err))?;

    tracing::info!(
        conversation_id,
        user_id = owner_id,
        assessment_id = assessment.id,
        policy = "flip_first",
        "conversation completed with assessment"
    );

    Ok(CompletionResponse {
        conversation,
        assessment: Some(assessment),
        already_completed: false,
    })
}

async fn complete_assess_first(
    state: &AppState,
    auth: &AuthenticatedUser,
    conversation_id: i64,
) -> Result<CompletionResponse, AppError> {
    // One transaction covers flip + insert; the row lock is held across the
    // model call, bounded by the client timeout. Any failure rolls back and
    // leaves the conversation active and the completion retryable.
    let mut tx = state.db.begin().await?;
    let locked = lock_conversation(&mut tx, conversation_id).await?;
    require_owner(auth, locked.user_id, COMPLETE_OP)?;

    if parse_status(locked.id, &locked.status)? == ConversationStatus::Completed {
        tx.commit().await?;
        return already_completed(&state.db, locked).await;
    }

    let messages = load_messages(&mut tx, conversation_id).await?;
    let metrics = completion_metrics(locked.created_at, &messages);
    let owner_id = locked.user_id;

    let transcript = render_transcript(into_transcript(messages));
    let report = state.model.assess(&transcript).await?;

    let conversation = flip_to_completed(&mut tx, conversation_id, &metrics).await?;
    let assessment = persist_assessment(&mut *tx, owner_id, conversation_id, &report).await?;
    tx.commit().await?;

    tracing::info!(
        conversation_id,
        user_id = owner_id,
        assessment_id = assessment.id,
        policy = "assess_first",
        "conversation completed with assessment"
    );

    Ok(CompletionResponse {
        conversation,
        assessment: Some(assessment),
        already_completed: false,
    })
}

/// No-op path for a second completion: report current state, never re-run.
async fn already_completed(
    db: &PgPool,
    row: ConversationRow,
) -> Result<CompletionResponse, AppError> {
    let conversation = row.into_conversation()?;
    let assessment = latest_assessment(db, conversation.id).await?;

    tracing::info!(
        conversation_id = conversation.id,
        "completion requested for an already-completed conversation; returning current state"
    );

    Ok(CompletionResponse {
        conversation,
        assessment,
        already_completed: true,
    })
}

/// Attach the durable completed state to an assessment failure. The error
/// keeps its class (502 transport, 500 contract/persistence) so the caller
/// can tell the flip happened but no assessment exists.
fn completed_without_assessment(conversation_id: i64, err: AppError) -> AppError {
    let context =
        format!("conversation {conversation_id} is completed, but no assessment was stored");

    match err {
        AppError::UpstreamUnavailable {
            message,
            upstream_status,
        } => AppError::UpstreamUnavailable {
            message: format!("{context}: {message}"),
            upstream_status,
        },
        AppError::UpstreamContract { message } => AppError::UpstreamContract {
            message: format!("{context}: {message}"),
        },
        AppError::Internal(message) => AppError::Internal(format!("{context}: {message}")),
        other => other,
    }
}

// --- Pipeline steps ---

async fn lock_conversation(
    tx: &mut Transaction<'_, Postgres>,
    conversation_id: i64,
) -> Result<ConversationRow, AppError> {
    sqlx::query_as::<_, ConversationRow>(
        "SELECT id, user_id, agent_id, scenario_id, title, status, created_at, \
                time_elapsed_ms, message_count, token_count \
         FROM conversations \
         WHERE id = $1 \
         FOR UPDATE",
    )
    .bind(conversation_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::NotFound {
        resource: "Conversation".to_string(),
    })
}

async fn load_messages(
    tx: &mut Transaction<'_, Postgres>,
    conversation_id: i64,
) -> Result<Vec<MessageRow>, AppError> {
    sqlx::query_as::<_, MessageRow>(
        "SELECT id, user_sent, body, received_at \
         FROM messages \
         WHERE conversation_id = $1 \
         ORDER BY received_at, id",
    )
    .bind(conversation_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(AppError::Database)
}

async fn flip_to_completed(
    tx: &mut Transaction<'_, Postgres>,
    conversation_id: i64,
    metrics: &CompletionMetrics,
) -> Result<Conversation, AppError> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "UPDATE conversations \
         SET status = 'completed', message_count = $2, time_elapsed_ms = $3 \
         WHERE id = $1 \
         RETURNING id, user_id, agent_id, scenario_id, title, status, created_at, \
                   time_elapsed_ms, message_count, token_count",
    )
    .bind(conversation_id)
    .bind(metrics.message_count)
    .bind(metrics.time_elapsed_ms)
    .fetch_one(&mut **tx)
    .await
    .map_err(AppError::Database)?;

    row.into_conversation()
}

/// Insert the assessment and wrap write failures with recovery logging: the
/// generated content exists only in memory at this point, so the full payload
/// goes into the log before the error surfaces.
async fn persist_assessment<'e, E>(
    executor: E,
    user_id: i64,
    conversation_id: i64,
    report: &AssessmentReport,
) -> Result<Assessment, AppError>
where
    E: sqlx::PgExecutor<'e>,
{
    match insert_assessment(executor, user_id, conversation_id, report).await {
        Ok(assessment) => Ok(assessment),
        Err(e) => {
            let payload =
                serde_json::to_string(report).unwrap_or_else(|_| format!("{report:?}"));
            tracing::error!(
                conversation_id,
                user_id,
                error = %e,
                payload = %payload,
                "assessment write failed after a successful model call; payload logged for recovery"
            );
            Err(AppError::Internal(
                "assessment could not be stored".to_string(),
            ))
        }
    }
}

async fn insert_assessment<'e, E>(
    executor: E,
    user_id: i64,
    conversation_id: i64,
    report: &AssessmentReport,
) -> Result<Assessment, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, AssessmentRow>(
        "INSERT INTO assessments \
            (user_id, conversation_id, body, conflict_management_strategy, \
             openness, conscientiousness, extroversion, agreeableness, neuroticism) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING id, user_id, conversation_id, body, conflict_management_strategy, \
                   openness, conscientiousness, extroversion, agreeableness, neuroticism",
    )
    .bind(user_id)
    .bind(conversation_id)
    .bind(&report.body)
    .bind(&report.conflict_management_strategy)
    .bind(report.openness)
    .bind(report.conscientiousness)
    .bind(report.extroversion)
    .bind(report.agreeableness)
    .bind(report.neuroticism)
    .fetch_one(executor)
    .await?;

    Ok(row.into_assessment())
}

async fn latest_assessment(
    db: &PgPool,
    conversation_id: i64,
) -> Result<Option<Assessment>, AppError> {
    let row = sqlx::query_as::<_, AssessmentRow>(
        "SELECT id, user_id, conversation_id, body, conflict_management_strategy, \
                openness, conscientiousness, extroversion, agreeableness, neuroticism \
         FROM assessments \
         WHERE conversation_id = $1 \
         ORDER BY id DESC \
         LIMIT 1",
    )
    .bind(conversation_id)
    .fetch_optional(db)
    .await
    .map_err(AppError::Database)?;

    Ok(row.map(AssessmentRow::into_assessment))
}

/// Metrics stamped onto the conversation at completion. `messages` must be in
/// transcript order; elapsed time runs from creation to the last message.
fn completion_metrics(created_at: DateTime<Utc>, messages: &[MessageRow]) -> CompletionMetrics {
    let message_count = messages.len() as i32;
    let time_elapsed_ms = messages
        .last()
        .map(|last| (last.received_at - created_at).num_milliseconds().max(0));

    CompletionMetrics {
        message_count,
        time_elapsed_ms,
    }
}

fn into_transcript(messages: Vec<MessageRow>) -> Vec<TranscriptMessage> {
    messages
        .into_iter()
        .map(|row| TranscriptMessage {
            user_sent: row.user_sent,
            body: row.body,
            received_at: row.received_at,
            id: row.id,
        })
        .collect()
}

fn parse_status(conversation_id: i64, raw: &str) -> Result<ConversationStatus, AppError> {
    ConversationStatus::from_db(raw).ok_or_else(|| {
        AppError::Internal(format!(
            "conversation {conversation_id} has unexpected status '{raw}'"
        ))
    })
}

#[derive(Debug, PartialEq)]
struct CompletionMetrics {
    message_count: i32,
    time_elapsed_ms: Option<i64>,
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
struct MessageRow {
    id: i64,
    user_sent: bool,
    body: String,
    received_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
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
    use std::time::Duration;

    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use sqlx::postgres::PgPoolOptions;
    use url::Url;
    use uuid::Uuid;

    use parley_core::entities::ConversationStatus;

    use super::{
        CompletionMetrics, MessageRow, complete_conversation, completed_without_assessment,
        completion_metrics, insert_assessment,
    };
    use crate::auth::{AuthenticatedUser, JwtKeys};
    use crate::error::AppError;
    use crate::model_client::{AssessmentReport, ModelClient};
    use crate::state::{AppState, CompletionPolicy};

    fn message_row(id: i64, user_sent: bool, body: &str, received_at: DateTime<Utc>) -> MessageRow {
        MessageRow {
            id,
            user_sent,
            body: body.to_string(),
            received_at,
        }
    }

    #[test]
    fn completion_metrics_of_empty_conversation() {
        let metrics = completion_metrics(Utc::now(), &[]);
        assert_eq!(
            metrics,
            CompletionMetrics {
                message_count: 0,
                time_elapsed_ms: None,
            }
        );
    }

    #[test]
    fn completion_metrics_measure_to_last_message() {
        let created_at = Utc::now();
        let rows = vec![
            message_row(
                1,
                true,
                "Hello, how are you?",
                created_at + ChronoDuration::milliseconds(10),
            ),
            message_row(
                2,
                false,
                "I'm good!",
                created_at + ChronoDuration::milliseconds(60),
            ),
        ];

        let metrics = completion_metrics(created_at, &rows);
        assert_eq!(metrics.message_count, 2);
        assert_eq!(metrics.time_elapsed_ms, Some(60));
    }

    #[test]
    fn completed_without_assessment_keeps_the_error_class() {
        let err = completed_without_assessment(
            7,
            AppError::UpstreamUnavailable {
                message: "assessment service answered 500".to_string(),
                upstream_status: Some(500),
            },
        );

        match err {
            AppError::UpstreamUnavailable {
                message,
                upstream_status,
            } => {
                assert!(message.contains("conversation 7 is completed"));
                assert_eq!(upstream_status, Some(500));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    // --- DB-backed tests (skipped without DATABASE_URL) ---

    async fn db_pool_if_available() -> Option<sqlx::PgPool> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return None;
        };

        PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .ok()
    }

    fn test_state(pool: sqlx::PgPool, policy: CompletionPolicy) -> AppState {
        // Port 9 is unassigned locally; connections fail fast and any stray
        // listener is cut off by the short timeout.
        let model = ModelClient::new(
            Url::parse("http://127.0.0.1:9/").expect("url should parse"),
            Duration::from_secs(2),
        )
        .expect("client should build");

        AppState {
            db: pool,
            model,
            jwt: JwtKeys::new(
                "completion-test-secret",
                "parley".to_string(),
                "parley-app".to_string(),
                3600,
            ),
            completion_policy: policy,
        }
    }

    async fn seed_conversation(
        pool: &sqlx::PgPool,
        created_at: DateTime<Utc>,
    ) -> (AuthenticatedUser, i64) {
        let email = format!("completion-{}@example.com", Uuid::now_v7());
        let user_id: i64 = sqlx::query_scalar(
            "INSERT INTO users (email, password_hash) VALUES ($1, 'x') RETURNING id",
        )
        .bind(&email)
        .fetch_one(pool)
        .await
        .expect("user should insert");

        let agent_id: i64 = sqlx::query_scalar(
            "INSERT INTO agents (user_id, name) VALUES ($1, 'Test Barista') RETURNING id",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await
        .expect("agent should insert");

        let conversation_id: i64 = sqlx::query_scalar(
            "INSERT INTO conversations (user_id, agent_id, title, created_at) \
             VALUES ($1, $2, 'Practice run', $3) RETURNING id",
        )
        .bind(user_id)
        .bind(agent_id)
        .bind(created_at)
        .fetch_one(pool)
        .await
        .expect("conversation should insert");

        (AuthenticatedUser { user_id, email }, conversation_id)
    }

    async fn seed_message(
        pool: &sqlx::PgPool,
        conversation_id: i64,
        user_sent: bool,
        body: &str,
        received_at: DateTime<Utc>,
    ) {
        sqlx::query(
            "INSERT INTO messages (conversation_id, user_sent, body, received_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(conversation_id)
        .bind(user_sent)
        .bind(body)
        .bind(received_at)
        .execute(pool)
        .await
        .expect("message should insert");
    }

    #[tokio::test]
    async fn persisted_assessment_copies_the_report_verbatim() {
        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should run");

        let (auth, conversation_id) = seed_conversation(&pool, Utc::now()).await;
        let report = AssessmentReport {
            body: "Cooperative communicator".to_string(),
            conflict_management_strategy: "Collaboration".to_string(),
            openness: 7,
            conscientiousness: 6,
            extroversion: 8,
            agreeableness: 9,
            neuroticism: 3,
        };

        let assessment = insert_assessment(&pool, auth.user_id, conversation_id, &report)
            .await
            .expect("assessment should insert");

        assert!(assessment.id > 0);
        assert_eq!(assessment.user_id, auth.user_id);
        assert_eq!(assessment.conversation_id, conversation_id);
        assert_eq!(assessment.body.as_deref(), Some("Cooperative communicator"));
        assert_eq!(
            assessment.conflict_management_strategy.as_deref(),
            Some("Collaboration")
        );
        assert_eq!(assessment.openness, Some(7));
        assert_eq!(assessment.conscientiousness, Some(6));
        assert_eq!(assessment.extroversion, Some(8));
        assert_eq!(assessment.agreeableness, Some(9));
        assert_eq!(assessment.neuroticism, Some(3));
    }

    #[tokio::test]
    async fn completing_a_missing_conversation_is_not_found() {
        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should run");

        let state = test_state(pool, CompletionPolicy::FlipFirst);
        let auth = AuthenticatedUser {
            user_id: 1,
            email: "nobody@example.com".to_string(),
        };

        let err = complete_conversation(&state, &auth, 99999)
            .await
            .expect_err("missing conversation must fail");
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn flip_first_completes_even_when_the_model_is_down() {
        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should run");

        let created_at = Utc::now();
        let (auth, conversation_id) = seed_conversation(&pool, created_at).await;
        seed_message(&pool, conversation_id, true, "Hello, how are you?", created_at).await;
        seed_message(
            &pool,
            conversation_id,
            false,
            "I'm good!",
            created_at + ChronoDuration::milliseconds(50),
        )
        .await;

        let state = test_state(pool.clone(), CompletionPolicy::FlipFirst);
        let err = complete_conversation(&state, &auth, conversation_id)
            .await
            .expect_err("unreachable model service must fail the assessment");
        assert!(matches!(err, AppError::UpstreamUnavailable { .. }));

        let (status, message_count, time_elapsed_ms): (String, Option<i32>, Option<i64>) =
            sqlx::query_as(
                "SELECT status, message_count, time_elapsed_ms FROM conversations WHERE id = $1",
            )
            .bind(conversation_id)
            .fetch_one(&pool)
            .await
            .expect("conversation should load");

        assert_eq!(status, "completed");
        assert_eq!(message_count, Some(2));
        assert_eq!(time_elapsed_ms, Some(50));

        let assessments: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM assessments WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_one(&pool)
                .await
                .expect("count should load");
        assert_eq!(assessments, 0);
    }

    #[tokio::test]
    async fn assess_first_failure_leaves_the_conversation_active() {
        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should run");

        let (auth, conversation_id) = seed_conversation(&pool, Utc::now()).await;

        let state = test_state(pool.clone(), CompletionPolicy::AssessFirst);
        let err = complete_conversation(&state, &auth, conversation_id)
            .await
            .expect_err("unreachable model service must fail the completion");
        assert!(matches!(err, AppError::UpstreamUnavailable { .. }));

        let status: String =
            sqlx::query_scalar("SELECT status FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_one(&pool)
                .await
                .expect("conversation should load");
        assert_eq!(status, "active");
    }

    #[tokio::test]
    async fn second_completion_is_a_no_op_returning_current_state() {
        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should run");

        let (auth, conversation_id) = seed_conversation(&pool, Utc::now()).await;

        let state = test_state(pool.clone(), CompletionPolicy::FlipFirst);
        complete_conversation(&state, &auth, conversation_id)
            .await
            .expect_err("first completion fails its assessment with the model down");

        let response = complete_conversation(&state, &auth, conversation_id)
            .await
            .expect("second completion should no-op with current state");

        assert!(response.already_completed);
        assert_eq!(response.conversation.status, ConversationStatus::Completed);
        assert!(response.assessment.is_none());

        let assessments: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM assessments WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_one(&pool)
                .await
                .expect("count should load");
        assert_eq!(assessments, 0);
    }

    #[tokio::test]
    async fn completing_someone_elses_conversation_is_forbidden() {
        let Some(pool) = db_pool_if_available().await else {
            return;
        };
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .expect("migrations should run");

        let (owner, conversation_id) = seed_conversation(&pool, Utc::now()).await;
        let intruder = AuthenticatedUser {
            user_id: owner.user_id + 1_000_000,
            email: "intruder@example.com".to_string(),
        };

        let state = test_state(pool.clone(), CompletionPolicy::FlipFirst);
        let err = complete_conversation(&state, &intruder, conversation_id)
            .await
            .expect_err("foreign conversation must be refused");
        assert!(matches!(err, AppError::Forbidden { .. }));

        let status: String =
            sqlx::query_scalar("SELECT status FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_one(&pool)
                .await
                .expect("conversation should load");
        assert_eq!(status, "active");
    }
}
