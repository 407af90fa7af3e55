use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A registered account. The password hash stays in the api crate and never
/// appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// An AI persona the user practices against. Trait scores are optional
/// integers in 1..=10; an absent score leaves the trait unspecified.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Agent {
    pub id: i64,
    /// Owner of this agent
    pub user_id: i64,
    pub name: String,
    /// System-style persona instructions fed to the model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_body: Option<String>,
    /// Client-side avatar catalogue index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openness: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conscientiousness: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extroversion: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreeableness: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neuroticism: Option<i32>,
}

/// A practice scenario: prompt material plus optional seed messages used
/// once, at conversation creation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Scenario {
    pub id: i64,
    /// Owner of this scenario
    pub user_id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setting_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_prompt: Option<String>,
    /// User-voiced opener copied into a new conversation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_user_message: Option<String>,
    /// Agent-voiced reply copied into a new conversation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_agent_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a conversation. The transition is monotonic: once
/// `completed`, a conversation never becomes `active` again.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Completed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    /// Parse the stored column value. `None` means the column holds
    /// something outside the CHECK constraint and the row is corrupt.
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A conversation between the user and one agent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Conversation {
    pub id: i64,
    /// Owner of this conversation
    pub user_id: i64,
    pub agent_id: i64,
    /// Scenario the conversation was seeded from, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<i64>,
    pub title: String,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    /// Milliseconds from creation to the last message, recorded at completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_elapsed_ms: Option<i64>,
    /// Number of messages at completion time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<i32>,
}

/// Compact conversation row for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConversationSummary {
    pub id: i64,
    pub title: String,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
}

/// Embedded display reference to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentRef {
    pub id: i64,
    pub name: String,
}

/// Embedded display reference to a scenario.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScenarioRef {
    pub id: i64,
    pub name: String,
}

/// Detail view: all conversation fields plus the display names the client
/// renders next to them.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub agent: AgentRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ScenarioRef>,
}

/// One message as the client sees it. `sender` is the fixed display label
/// `"User"` or `"Agent"` derived from who sent it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: i64,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// A persisted personality/conflict-style assessment of one conversation.
/// Trait fields are nullable in storage; the completion pipeline populates
/// all of them.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Assessment {
    pub id: i64,
    /// Owner of this assessment
    pub user_id: i64,
    pub conversation_id: i64,
    /// Free-text narrative evaluation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Label such as "Collaboration" or "Avoidance"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_management_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openness: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conscientiousness: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extroversion: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreeableness: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neuroticism: Option<i32>,
}
