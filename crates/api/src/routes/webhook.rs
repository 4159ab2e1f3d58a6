use axum::{
    body::Bytes,
    extract::State,
    middleware::from_fn_with_state,
    routing::post,
    Extension, Json, Router,
};
use serde_json::Value;
use tracing::{error, info};

use freem_core::config::ProcessingMode;
use freem_core::drain::DrainReport;
use freem_core::queue::{Enqueued, Queue};
use freem_core::types::WebhookPayload;

use crate::{
    error::{ApiResult, AppError},
    middleware::signature::verify_webhook_signature,
    state::{AppState, RequestId},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(receive))
        .route_layer(from_fn_with_state(state.clone(), verify_webhook_signature))
        .with_state(state)
}

/// Accepts one webhook delivery. The body is the contact id, `null`, or a
/// short rejection reason; non-2xx only when the payload could not be taken
/// in at all.
pub async fn receive(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    match state.mode {
        ProcessingMode::Queue => enqueue_and_drain(&state, &request_id, body).await,
        ProcessingMode::Direct => process_inline(&state, &request_id, &body).await,
    }
}

async fn enqueue_and_drain(
    state: &AppState,
    request_id: &RequestId,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let drainer = state.drainer.clone();
    let stored = tokio::task::spawn_blocking(move || drainer.queue().enqueue(&body)).await;
    let enqueued = match stored {
        Ok(Ok(enqueued)) => enqueued,
        Ok(Err(err)) => {
            error!(request_id = %request_id.0, error = %err, "webhook not stored");
            return Err(AppError::from(&err).with_request_id(&request_id.0));
        }
        Err(err) => {
            error!(request_id = %request_id.0, error = %err, "enqueue task failed");
            return Err(AppError::Internal.with_request_id(&request_id.0));
        }
    };
    match &enqueued {
        Enqueued::Stored(key) => info!(request_id = %request_id.0, %key, "webhook queued"),
        Enqueued::Duplicate(key) => {
            info!(request_id = %request_id.0, %key, "webhook already pending")
        }
    }

    // The payload is durable from here on; a failed pass leaves it for the
    // worker and the sender still gets a success status.
    let report = match state.drainer.drain_once().await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "drain pass failed");
            return Ok(Json(Value::Null));
        }
    };

    let body = match &report {
        DrainReport::Processed { key, outcome } if key == enqueued.key() => {
            outcome.response_body()
        }
        _ => Value::Null,
    };
    Ok(Json(body))
}

async fn process_inline(
    state: &AppState,
    request_id: &RequestId,
    body: &[u8],
) -> ApiResult<Json<Value>> {
    let payload = WebhookPayload::from_slice(body).map_err(|err| {
        AppError::BadRequest(format!("invalid JSON: {err}")).with_request_id(&request_id.0)
    })?;
    let outcome = state.drainer.pipeline().process(&payload).await;
    Ok(Json(outcome.response_body()))
}
