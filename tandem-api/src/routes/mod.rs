//! REST API Routes
//!
//! ```text
//! /api/v1/kv       key/value operations
//! /health          ping and per-instance stats
//! ```

use axum::{body::Body, http::Request, http::Uri, Router};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

pub mod health;
pub mod kv;

async fn fallback(uri: Uri) -> ApiError {
    ApiError::route_not_found(uri.path())
}

/// Create the complete router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/kv", kv::create_router())
        .nest("/health", health::create_router())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = tracing::field::Empty,
            )
        }))
        .with_state(state)
}


#[cfg(test)]
mod tests {
    use super::test_support::{read_json, test_app};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_unknown_path_is_enveloped_404() {
        let app = test_app(Duration::from_secs(1));
        let response = app
            .router
            .oneshot(Request::builder().uri("/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = read_json(response).await;
        assert_eq!(body["status"], "fail");
        assert_eq!(body["code"], "ROUTE_NOT_FOUND");
    }
}
