//! Request ID middleware for request tracing and correlation.
//!
//! Uses the upstream proxy's `x-request-id` when present, otherwise mints a
//! UUID v4. The ID is recorded in the current span, tagged on the Sentry
//! scope and echoed in the response.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Span;
use uuid::Uuid;

/// The HTTP header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest upstream ID accepted verbatim.
const MAX_UPSTREAM_ID_LEN: usize = 128;

fn upstream_id(request: &Request) -> Option<String> {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_UPSTREAM_ID_LEN)
        .map(String::from)
}

/// Middleware that ensures every request has a request ID.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = upstream_id(&request).unwrap_or_else(|| Uuid::new_v4().to_string());

    Span::current().record("request_id", &request_id);

    sentry::configure_scope(|scope| {
        scope.set_tag("request_id", &request_id);
    });

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::{Router, body::Body, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn test_upstream_id_is_echoed() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "edge-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "edge-42");
    }

    #[tokio::test]
    async fn test_missing_id_is_generated() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }
}
