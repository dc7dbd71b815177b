//! Operator endpoints, gated by the `x-admin-token` header.
//!
//! POST /api/admin/subscriptions/refresh
//! POST /api/admin/subscriptions/:org_id/refresh
//! POST /api/admin/organizations/:org_id/trial

use axum::{
    extract::{Extension, Path, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::server::app::AppState;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Serialize)]
pub struct RefreshAllResponse {
    pub refreshed: usize,
}

#[derive(Serialize)]
pub struct RefreshOneResponse {
    pub org_id: Uuid,
    pub refreshed: bool,
}

/// Rejects requests without the configured token. With no token configured
/// every request is rejected.
pub async fn require_admin_token(
    Extension(state): Extension<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return StatusCode::FORBIDDEN.into_response();
    };

    let provided = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(token) if token == expected => next.run(request).await,
        Some(_) => StatusCode::FORBIDDEN.into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

pub async fn refresh_all_handler(Extension(state): Extension<AppState>) -> Response {
    match state.deps.admission.refresh_all_subscriptions().await {
        Ok(refreshed) => Json(RefreshAllResponse { refreshed }).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "manual subscription refresh failed");
            (StatusCode::SERVICE_UNAVAILABLE, "subscription refresh failed").into_response()
        }
    }
}

pub async fn refresh_one_handler(
    Extension(state): Extension<AppState>,
    Path(org_id): Path<Uuid>,
) -> Json<RefreshOneResponse> {
    let refreshed = state.deps.admission.refresh_subscription(org_id).await;
    Json(RefreshOneResponse { org_id, refreshed })
}

pub async fn enroll_trial_handler(
    Extension(state): Extension<AppState>,
    Path(org_id): Path<Uuid>,
) -> Response {
    match state.deps.admission.enroll_trial(org_id).await {
        Ok(quota) => (StatusCode::CREATED, Json(quota)).into_response(),
        Err(e) => {
            tracing::error!(org_id = %org_id, error = %e, "trial enrollment failed");
            (StatusCode::SERVICE_UNAVAILABLE, "trial enrollment failed").into_response()
        }
    }
}
