use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;

/// Tower Layer for access logging.
///
/// Emits one structured log line per API request with a fresh UUIDv7 request
/// id, and echoes that id back in the `x-request-id` response header so
/// clients can quote it in bug reports.
/// Runs after `InjectAuthLayer` — reads user_id from request extensions.
#[derive(Clone)]
pub struct AccessLogLayer;

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

#[derive(Clone)]
pub struct AccessLogService<S> {
    inner: S,
}

impl<S> Service<Request> for AccessLogService<S>
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

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);

        Box::pin(async move {
            let path = req.uri().path().to_owned();

            // Only log API endpoints
            if !is_logged_path(&path) {
                return Ok(ready.oneshot(req).await.into_response());
            }

            let start = Instant::now();
            let request_id = Uuid::now_v7();
            let method = req.method().to_string();
            let user_id: Option<i64> = req
                .extensions()
                .get::<AuthenticatedUser>()
                .map(|u| u.user_id);

            let mut response = ready.oneshot(req).await.into_response();

            let status = response.status().as_u16();
            let elapsed_ms = start.elapsed().as_millis().min(i64::MAX as u128) as i64;

            if let Ok(header) = HeaderValue::from_str(&request_id.to_string()) {
                response.headers_mut().insert("x-request-id", header);
            }

            tracing::info!(
                request_id = %request_id,
                method = %method,
                path = %path,
                user_id,
                status,
                elapsed_ms,
                "request completed"
            );

            Ok(response)
        })
    }
}

/// `/v1/` endpoints and the health probe get a log line; the swagger assets
/// stay quiet.
fn is_logged_path(path: &str) -> bool {
    path.starts_with("/v1/") || path == "/health"
}

#[cfg(test)]
mod tests {
    use super::is_logged_path;

    #[test]
    fn api_and_health_paths_are_logged() {
        assert!(is_logged_path("/v1/conversations/4/complete"));
        assert!(is_logged_path("/v1/login"));
        assert!(is_logged_path("/health"));
    }

    #[test]
    fn docs_paths_are_not_logged() {
        assert!(!is_logged_path("/swagger-ui"));
        assert!(!is_logged_path("/api-doc/openapi.json"));
    }
}
