use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::worker::server::WorkerState;

/// Require `Authorization: Bearer <token>` when the worker has a token
/// configured. Without one every request passes.
pub async fn bearer_auth_middleware(
    State(state): State<WorkerState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(token) = state.ctx.config.worker.auth_token.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(next.run(request).await);
    };

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if let Some(auth_val) = auth_header {
        if auth_val.strip_prefix("Bearer ") == Some(token) {
            return Ok(next.run(request).await);
        }
    }

    tracing::warn!(path = %request.uri().path(), "Rejected unauthenticated worker request");
    Err(StatusCode::UNAUTHORIZED)
}
