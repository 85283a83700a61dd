use std::sync::Arc;

use axum::{
    http::Method,
    routing::post,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::SamplingPolicy;
use crate::conversation::ChatTemplate;
use crate::inference::InferenceService;

pub mod auth;
pub mod extract;
pub mod handlers;
pub mod types;

pub use auth::{AuthenticatedCaller, ServiceToken};
pub use types::{GenerationRequest, GenerationResult};

/// Request-independent settings the chat handler consults.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub sampling: SamplingPolicy,
    pub assistant_delimiter: String,
    pub system_prompt: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub token: ServiceToken,
    pub infer: Arc<InferenceService>,
    pub template: Arc<ChatTemplate>,
    pub settings: Arc<ChatSettings>,
}

/// Versioned chat API.
pub fn api_router() -> Router<AppState> {
    Router::new().route("/api/v1/chat", post(handlers::chat))
}

/// The full service: API routes, open CORS and request tracing.
pub fn app(state: AppState) -> Router {
    api_router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
