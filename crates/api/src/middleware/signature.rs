use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use freem_core::auth::{verify_signature, SIGNATURE_HEADER};

use crate::{
    error::{ApiError, AppError},
    middleware::request_id,
    state::AppState,
};

/// Largest webhook body accepted for signature checking.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Rejects requests whose `x-signature` is not the HMAC-SHA256 of the raw
/// body. A no-op when no secret is configured.
pub async fn verify_webhook_signature(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(secret) = state.webhook_secret.clone() else {
        return Ok(next.run(req).await);
    };

    let request_id = request_id::current(&req);
    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES).await.map_err(|_| {
        AppError::BadRequest("request body too large or unreadable".to_string())
            .with_request_id(&request_id)
    })?;

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !verify_signature(&secret, &bytes, signature) {
        warn!(%request_id, has_signature = !signature.is_empty(), "webhook signature rejected");
        return Err(AppError::Unauthorized.with_request_id(&request_id));
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
