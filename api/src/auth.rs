use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tower::{Layer, Service, ServiceExt};

use crate::error::AppError;
use crate::state::AppState;

/// Default token lifetime: one hour, matching the session length the web
/// client assumes.
pub const TOKEN_TTL_SECS: i64 = 3600;

const FRESH_TOKEN_HINT: &str = "Obtain a fresh token via POST /v1/login.";

/// Authenticated user extracted from the `Authorization: Bearer <token>` header.
///
/// Two-phase resolution:
/// 1. Auth middleware (`InjectAuthLayer`) runs first: verifies the token and
///    injects the user into request extensions
/// 2. Handler extractor reads from extensions (no second decode), or falls
///    back to full verification
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub email: String,
}

/// HS256 signing material plus the claim values baked into every token.
///
/// Keys are rebuilt from the secret per operation; `EncodingKey` is cheap to
/// construct for HMAC and this keeps the struct trivially `Clone` for
/// `AppState`.
#[derive(Clone)]
pub struct JwtKeys {
    secret: String,
    issuer: String,
    audience: String,
    pub ttl_secs: i64,
}

/// The claim set carried by every token we issue.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Owning user's id, stringified.
    pub sub: String,
    pub email: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

impl JwtKeys {
    pub fn new(secret: &str, issuer: String, audience: String, ttl_secs: i64) -> Self {
        Self {
            secret: secret.to_owned(),
            issuer,
            audience,
            ttl_secs,
        }
    }

    /// Build signing config from the environment. A missing `PARLEY_JWT_SECRET`
    /// gets a random ephemeral secret so local runs work out of the box; those
    /// tokens die with the process, hence the warn.
    pub fn from_env() -> Self {
        let secret = match std::env::var("PARLEY_JWT_SECRET") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => {
                tracing::warn!(
                    "PARLEY_JWT_SECRET is not set; using a random ephemeral secret. \
                     Issued tokens will not survive a restart."
                );
                random_hex(32)
            }
        };

        let issuer =
            std::env::var("PARLEY_JWT_ISSUER").unwrap_or_else(|_| "parley".to_string());
        let audience =
            std::env::var("PARLEY_JWT_AUDIENCE").unwrap_or_else(|_| "parley-app".to_string());
        let ttl_secs = std::env::var("PARLEY_JWT_TTL_SECS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(TOKEN_TTL_SECS);

        Self::new(&secret, issuer, audience, ttl_secs)
    }

    /// Sign a token for `user_id`. The claims carry the email so handlers and
    /// logs can name the user without a lookup.
    pub fn issue(&self, user_id: i64, email: &str) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_owned(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: now + self.ttl_secs,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AppError::Internal(format!("failed to sign token: {e}")))
    }

    /// Decode and validate a bearer token: signature, expiry (with the
    /// library's default leeway), issuer and audience.
    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            let message = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => "Token has expired",
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    "Token signature is invalid"
                }
                _ => "Token is invalid",
            };
            AppError::Unauthorized {
                message: message.to_string(),
                docs_hint: Some(FRESH_TOKEN_HINT.to_string()),
            }
        })?;

        let user_id = data
            .claims
            .sub
            .parse::<i64>()
            .map_err(|_| AppError::Unauthorized {
                message: "Token subject is malformed".to_string(),
                docs_hint: Some(FRESH_TOKEN_HINT.to_string()),
            })?;

        Ok(AuthenticatedUser {
            user_id,
            email: data.claims.email,
        })
    }
}

/// Row-ownership guard. Rows are scoped to the user that created them; a
/// mismatch is always 403, regardless of whether the row exists.
pub fn require_owner(
    auth: &AuthenticatedUser,
    owner_id: i64,
    operation: &str,
) -> Result<(), AppError> {
    if auth.user_id == owner_id {
        return Ok(());
    }

    tracing::warn!(
        user_id = auth.user_id,
        owner_id,
        operation = operation,
        decision = "deny",
        "ownership authorization decision"
    );

    Err(AppError::Forbidden {
        message: format!("Not allowed to access this resource via '{operation}'"),
        docs_hint: Some("You can only operate on rows owned by your own account.".to_string()),
    })
}

// --- Tower Layer/Service for auth injection ---

/// Tower Layer that injects `AuthenticatedUser` into request extensions.
/// Silently continues on auth failure (unauthenticated endpoints like health
/// and login must still be served).
#[derive(Clone)]
pub struct InjectAuthLayer {
    keys: JwtKeys,
}

impl InjectAuthLayer {
    pub fn new(keys: JwtKeys) -> Self {
        Self { keys }
    }
}

impl<S> Layer<S> for InjectAuthLayer {
    type Service = InjectAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InjectAuthService {
            inner,
            keys: self.keys.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InjectAuthService<S> {
    inner: S,
    keys: JwtKeys,
}

impl<S> Service<Request> for InjectAuthService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);

        // Verification is pure, so it happens before the boxed future.
        if let Some(token) = extract_bearer_token(&req) {
            if let Ok(user) = self.keys.verify(&token) {
                req.extensions_mut().insert(user);
            }
        }

        Box::pin(async move { Ok(ready.oneshot(req).await.into_response()) })
    }
}

/// Extract bearer token from Authorization header (synchronous, no body access).
fn extract_bearer_token(req: &Request) -> Option<String> {
    let auth_header = req.headers().get("authorization")?.to_str().ok()?;
    auth_header.strip_prefix("Bearer ").map(|s| s.to_owned())
}

// --- Extractor (used by handlers) ---

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Fast path: auth middleware already verified the token
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(user.clone());
        }

        // Slow path: no middleware ran (shouldn't happen in normal flow)
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized {
                message: "Missing Authorization header".to_string(),
                docs_hint: Some(format!(
                    "Include 'Authorization: Bearer <token>'. {FRESH_TOKEN_HINT}"
                )),
            })?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Unauthorized {
                message: "Authorization header must use Bearer scheme".to_string(),
                docs_hint: Some("Format: 'Authorization: Bearer <token>'".to_string()),
            })?;

        state.jwt.verify(token)
    }
}

/// Generate `n` random bytes and return as hex string.
fn random_hex(n: usize) -> String {
    let bytes: Vec<u8> = (0..n).map(|_| rand::thread_rng().r#gen::<u8>()).collect();
    hex::encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::{AuthenticatedUser, JwtKeys, require_owner};

    fn test_keys() -> JwtKeys {
        JwtKeys::new(
            "test-secret-not-for-production",
            "parley".to_string(),
            "parley-app".to_string(),
            3600,
        )
    }

    #[test]
    fn issue_then_verify_roundtrip() {
        let keys = test_keys();

        let token = keys.issue(42, "dev@example.com").expect("token should sign");
        let user = keys.verify(&token).expect("token should verify");

        assert_eq!(user.user_id, 42);
        assert_eq!(user.email, "dev@example.com");
    }

    #[test]
    fn verify_rejects_garbage_and_foreign_signatures() {
        let keys = test_keys();
        assert!(keys.verify("not-a-jwt").is_err());

        let other = JwtKeys::new(
            "a-completely-different-secret",
            "parley".to_string(),
            "parley-app".to_string(),
            3600,
        );
        let token = other.issue(7, "dev@example.com").expect("token should sign");
        assert!(keys.verify(&token).is_err());
    }

    #[test]
    fn verify_rejects_expired_tokens() {
        // Negative TTL backdates exp past the validation leeway.
        let keys = JwtKeys::new(
            "test-secret-not-for-production",
            "parley".to_string(),
            "parley-app".to_string(),
            -120,
        );

        let token = keys.issue(7, "dev@example.com").expect("token should sign");
        assert!(test_keys().verify(&token).is_err());
    }

    #[test]
    fn verify_rejects_wrong_audience() {
        let keys = test_keys();
        let other = JwtKeys::new(
            "test-secret-not-for-production",
            "parley".to_string(),
            "another-app".to_string(),
            3600,
        );

        let token = other.issue(7, "dev@example.com").expect("token should sign");
        assert!(keys.verify(&token).is_err());
    }

    #[test]
    fn require_owner_allows_own_rows_only() {
        let auth = AuthenticatedUser {
            user_id: 1,
            email: "dev@example.com".to_string(),
        };

        assert!(require_owner(&auth, 1, "GET /v1/users/{user_id}").is_ok());
        assert!(require_owner(&auth, 2, "GET /v1/users/{user_id}").is_err());
    }
}
