//! HTTP surfaces.
//!
//! Two independent axum routers: the front door ([`front`]) serving the
//! OpenAI- and Anthropic-protocol endpoints, and the admin control plane
//! ([`admin`]) serving authenticated CRUD plus the bundled web UI.

pub mod admin;
pub mod admin_auth;
pub mod anthropic;
pub mod health;
pub mod openai;
pub mod static_files;

use std::{sync::Arc, time::Instant};

use axum::{
    routing::{get, post},
    Router,
};

use crate::{proxy::ProxyClient, reqlog::RequestLog, store::StateStore};

/// Shared state of the front-door router. Backend configs are re-read
/// from the store on every request — the fleet can change underneath a
/// live router.
pub struct FrontState {
    pub store: Arc<StateStore>,
    pub proxy: ProxyClient,
    pub log: RequestLog,
    pub started_at: Instant,
}

/// Build the front-door router.
pub fn front(state: Arc<FrontState>) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/v1/models", get(openai::list_models))
        .route("/v1/models/{id}", get(openai::get_model))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/v1/messages", post(anthropic::messages))
        .route("/v1/messages/count_tokens", post(anthropic::count_tokens))
        .with_state(state)
}
