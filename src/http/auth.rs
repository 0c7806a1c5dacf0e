//! Bearer-token auth middleware (§4.G): when an API key is configured,
//! every `/api/*`, `/v0/*`, `/v1/*` route except `OPTIONS` requires
//! `Authorization: Bearer <key>`.

use super::SharedContext;
use crate::error::GatewayError;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;

pub async fn require_bearer_token(
    State(ctx): State<SharedContext>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &ctx.config.api_key else {
        return next.run(req).await;
    };
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => next.run(req).await,
        _ => GatewayError::AuthFailed.into_response_with(&ctx),
    }
}
