use axum::{extract::State, routing::get, Extension, Json, Router};
use serde::Serialize;
use tracing::error;

use freem_core::queue::Queue;

use crate::{
    error::{ApiResult, AppError},
    state::{AppState, RequestId},
};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    pending: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> ApiResult<Json<HealthResponse>> {
    let drainer = state.drainer.clone();
    let pending = match tokio::task::spawn_blocking(move || drainer.queue().pending()).await {
        Ok(Ok(pending)) => pending,
        Ok(Err(err)) => {
            error!(error = %err, "queue directory unreadable");
            return Err(AppError::Internal.with_request_id(&request_id.0));
        }
        Err(err) => {
            error!(error = %err, "pending count task failed");
            return Err(AppError::Internal.with_request_id(&request_id.0));
        }
    };
    Ok(Json(HealthResponse {
        status: "ok",
        pending,
    }))
}
