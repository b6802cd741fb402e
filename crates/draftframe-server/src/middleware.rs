use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::server::AppState;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Request ID middleware.
///
/// Keeps an incoming `x-request-id` or generates one, stores it in request extensions for
/// the access-log span and echoes it on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let req_id_value = req
        .headers()
        .get(&REQUEST_ID)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    let Some(req_id_value) = req_id_value else {
        return next.run(req).await;
    };
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(REQUEST_ID, req_id_value);
    res
}

/// Caller authentication for the gateway routes.
///
/// Rejects with `401` JSON; this is the only failure reported to the embedding application
/// as an HTTP error.
pub async fn caller_authentication(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match state.authenticator.authenticate(req.headers()).await {
        Ok(()) => next.run(req).await,
        Err(err) => {
            tracing::debug!(path = %req.uri().path(), "caller authentication failed");
            GatewayError::from(err).into_response()
        }
    }
}
