use sqlx::PgPool;

use crate::auth::JwtKeys;
use crate::model_client::ModelClient;

/// Which moment makes a conversation's completed state durable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Commit the completed flag before calling the model service. An
    /// assessment failure leaves the conversation completed without an
    /// assessment; the response reports that explicitly.
    FlipFirst,
    /// Hold one transaction across the model call so the flag flip and the
    /// assessment row commit together. A failure leaves the conversation
    /// active and the completion retryable.
    AssessFirst,
}

impl CompletionPolicy {
    pub fn from_env() -> Self {
        Self::parse(
            std::env::var("PARLEY_COMPLETION_POLICY")
                .unwrap_or_default()
                .as_str(),
        )
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "assess_first" => Self::AssessFirst,
            _ => Self::FlipFirst,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub model: ModelClient,
    pub jwt: JwtKeys,
    pub completion_policy: CompletionPolicy,
}

#[cfg(test)]
mod tests {
    use super::CompletionPolicy;

    #[test]
    fn completion_policy_parses_known_values() {
        assert_eq!(
            CompletionPolicy::parse("assess_first"),
            CompletionPolicy::AssessFirst
        );
        assert_eq!(
            CompletionPolicy::parse("flip_first"),
            CompletionPolicy::FlipFirst
        );
    }

    #[test]
    fn completion_policy_defaults_to_flip_first() {
        assert_eq!(CompletionPolicy::parse(""), CompletionPolicy::FlipFirst);
        assert_eq!(
            CompletionPolicy::parse("something_else"),
            CompletionPolicy::FlipFirst
        );
    }
}
