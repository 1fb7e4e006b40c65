//! API key gate for dispatch and control-plane endpoints.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::Error;
use crate::state::AppState;

/// Middleware that checks the request's bearer token against the configured
/// API key. If no key is configured, every caller is allowed. Denials carry
/// no detail about the requested resource.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api.api_key.as_deref() else {
        return next.run(request).await;
    };

    match bearer_token(&request) {
        Some(token) if token == expected => next.run(request).await,
        _ => Error::Unauthorized.into_response(),
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_auth(value: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/v1/models");
        if let Some(v) = value {
            builder = builder.header(header::AUTHORIZATION, v);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(
            bearer_token(&request_with_auth(Some("Bearer secret"))),
            Some("secret")
        );
        assert_eq!(bearer_token(&request_with_auth(Some("Basic abc"))), None);
        assert_eq!(bearer_token(&request_with_auth(None)), None);
    }
}
