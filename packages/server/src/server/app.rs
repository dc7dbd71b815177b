//! Application setup and router.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Extension},
    http::{header::CONTENT_TYPE, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domains::chat::QueryOrchestrator;
use crate::kernel::{BasePoolMonitor, ServerDeps};
use crate::server::routes::{
    chat_document_handler, chat_handler, enroll_trial_handler, health_handler,
    refresh_all_handler, refresh_one_handler, require_admin_token,
};

/// Upper bound on a multipart document upload.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<ServerDeps>,
    pub orchestrator: QueryOrchestrator,
    pub pool: Arc<dyn BasePoolMonitor>,
    /// Admin routes reject every request when unset
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(
        deps: ServerDeps,
        pool: Arc<dyn BasePoolMonitor>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            orchestrator: deps.orchestrator(),
            deps: Arc::new(deps),
            pool,
            admin_token,
        }
    }
}

/// Build the Axum application router
pub fn build_app(state: AppState) -> Router {
    // CORS configuration - allow any origin, the API carries no cookies
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let admin = Router::new()
        .route("/subscriptions/refresh", post(refresh_all_handler))
        .route("/subscriptions/:org_id/refresh", post(refresh_one_handler))
        .route("/organizations/:org_id/trial", post(enroll_trial_handler))
        .route_layer(middleware::from_fn(require_admin_token));

    Router::new()
        .route("/api/chat", post(chat_handler))
        .route(
            "/api/chat/document",
            post(chat_document_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .nest("/api/admin", admin)
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
