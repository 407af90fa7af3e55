use std::net::SocketAddr;

use axum::Router;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod completion;
mod error;
mod extract;
mod middleware;
mod model_client;
mod routes;
mod state;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Parley API",
        version = "0.1.0",
        description = "Backend for conversational practice: spar with AI personas, \
                       then get a personality and conflict-style assessment."
    ),
    paths(
        routes::health::health_check,
        routes::login::login,
        routes::users::register,
        routes::users::get_user,
        routes::users::change_password,
        routes::users::delete_account,
        routes::agents::create_agent,
        routes::agents::list_agents,
        routes::agents::get_agent,
        routes::agents::update_agent,
        routes::agents::delete_agent,
        routes::scenarios::create_scenario,
        routes::scenarios::list_scenarios,
        routes::scenarios::get_scenario,
        routes::scenarios::update_scenario,
        routes::scenarios::delete_scenario,
        routes::conversations::create_conversation,
        routes::conversations::list_conversations,
        routes::conversations::get_conversation,
        routes::conversations::delete_conversation,
        routes::conversations::complete_conversation,
        routes::messages::list_messages,
        routes::messages::send_message,
        routes::assessments::create_assessment,
        routes::assessments::list_assessments,
        routes::assessments::get_assessment,
        routes::assessments::update_assessment,
        routes::assessments::delete_assessment,
    ),
    components(schemas(
        HealthResponse,
        parley_core::error::ApiError,
        parley_core::entities::User,
        parley_core::entities::Agent,
        parley_core::entities::Scenario,
        parley_core::entities::ConversationStatus,
        parley_core::entities::Conversation,
        parley_core::entities::ConversationSummary,
        parley_core::entities::AgentRef,
        parley_core::entities::ScenarioRef,
        parley_core::entities::ConversationDetail,
        parley_core::entities::Message,
        parley_core::entities::Assessment,
        routes::login::LoginRequest,
        routes::login::LoginResponse,
        routes::users::RegisterRequest,
        routes::users::ChangePasswordRequest,
        routes::users::DeleteAccountRequest,
        routes::agents::CreateAgentRequest,
        routes::agents::UpdateAgentRequest,
        routes::scenarios::CreateScenarioRequest,
        routes::scenarios::UpdateScenarioRequest,
        routes::conversations::CreateConversationRequest,
        routes::messages::SendMessageRequest,
        routes::messages::SendMessageResponse,
        routes::assessments::CreateAssessmentRequest,
        routes::assessments::UpdateAssessmentRequest,
        completion::CompletionResponse,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Database connection
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let model = model_client::ModelClient::from_env().expect("model service configuration");
    let completion_policy = state::CompletionPolicy::from_env();
    tracing::info!(?completion_policy, "completion policy loaded");

    let app_state = state::AppState {
        db: pool,
        model,
        jwt: auth::JwtKeys::from_env(),
        completion_policy,
    };

    // CORS
    let cors_layer = middleware::cors::build_cors_layer();

    // Router with per-endpoint rate limiting on the expensive and abusable
    // routes: registration, login, completion and message generation.
    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::users::register_router().layer(middleware::rate_limit::register_layer()))
        .merge(routes::login::router().layer(middleware::rate_limit::login_layer()))
        .merge(routes::users::router())
        .merge(routes::agents::router())
        .merge(routes::scenarios::router())
        .merge(routes::conversations::router())
        .merge(
            routes::conversations::complete_router()
                .layer(middleware::rate_limit::completion_layer()),
        )
        .merge(routes::messages::router().layer(middleware::rate_limit::messages_layer()))
        .merge(routes::assessments::router())
        .layer(middleware::access_log::AccessLogLayer)
        .layer(auth::InjectAuthLayer::new(app_state.jwt.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Parley API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
