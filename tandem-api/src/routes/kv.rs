//! Key/Value REST API Routes
//!
//! - `GET    /api/v1/kv?prefix=` lists live records
//! - `GET    /api/v1/kv/:key`    reads one record
//! - `PUT    /api/v1/kv/:key`    writes `{"value": ..}` to both stores
//! - `DELETE /api/v1/kv/:key`    removes the record from both stores

use std::future::Future;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use tandem_core::KeyValue;
use tandem_storage::CACHE_INVALIDATE_KEY;

use crate::error::{ApiError, ApiResult};
use crate::extractors::RequestId;
use crate::services::{ServiceError, ServiceResult};
use crate::state::AppState;
use crate::types::{Envelope, ListQuery, PutValueRequest};

/// Run a service call under the request deadline.
async fn with_deadline<T>(
    state: &AppState,
    request_id: RequestId,
    call: impl Future<Output = ServiceResult<T>>,
) -> ApiResult<T> {
    let outcome = match tokio::time::timeout(state.request_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(state.request_timeout)),
    };
    outcome.map_err(|e| ApiError::from(e).with_request_id(request_id))
}

fn reject_reserved(key: &str, request_id: RequestId) -> ApiResult<()> {
    if key == CACHE_INVALIDATE_KEY {
        return Err(ApiError::invalid_input(format!("Key '{}' is reserved", key)).with_request_id(request_id));
    }
    Ok(())
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

pub async fn list_values(
    State(state): State<AppState>,
    request_id: RequestId,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Envelope<Vec<KeyValue>>>> {
    let records = with_deadline(&state, request_id, state.service.list(&query.prefix)).await?;
    Ok(Json(Envelope::success(request_id, records)))
}

pub async fn get_value(
    State(state): State<AppState>,
    request_id: RequestId,
    Path(key): Path<String>,
) -> ApiResult<Json<Envelope<KeyValue>>> {
    let record = with_deadline(&state, request_id, state.service.get(&key)).await?;
    Ok(Json(Envelope::success(request_id, record)))
}

pub async fn put_value(
    State(state): State<AppState>,
    request_id: RequestId,
    Path(key): Path<String>,
    body: Result<Json<PutValueRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<()>>> {
    reject_reserved(&key, request_id)?;
    let Json(body) = body.map_err(|e| ApiError::invalid_input(e.body_text()).with_request_id(request_id))?;
    if body.value.is_empty() {
        return Err(ApiError::missing_field("value").with_request_id(request_id));
    }

    let mut unit = KeyValue::new(&key, body.value);
    unit.audit.created_at = Utc::now();
    with_deadline(&state, request_id, state.service.put(unit)).await?;

    tracing::info!(%request_id, key = %key, "Value stored");
    Ok(Json(Envelope::done(request_id)))
}

pub async fn delete_value(
    State(state): State<AppState>,
    request_id: RequestId,
    Path(key): Path<String>,
) -> ApiResult<Json<Envelope<()>>> {
    reject_reserved(&key, request_id)?;
    with_deadline(&state, request_id, state.service.delete(&key)).await?;

    tracing::info!(%request_id, key = %key, "Value deleted");
    Ok(Json(Envelope::done(request_id)))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_values))
        .route("/:key", get(get_value).put(put_value).delete(delete_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{read_json, test_app, TestApp};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::time::Duration;
    use tandem_core::{ActionKind, Backend, PoolError, RepoError};
    use tandem_test_utils::fixtures;
    use tower::ServiceExt; // for `oneshot`

    fn put_request(key: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(format!("/api/v1/kv/{}", key))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let TestApp { router, etcd, postgres, .. } = test_app(Duration::from_secs(5));

        let response = router
            .clone()
            .oneshot(put_request("k1", r#"{"value":"v1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "success");
        assert!(body.get("result").is_none());
        assert_eq!(etcd.row("k1").unwrap().value, "v1");
        assert_eq!(postgres.row("k1").unwrap().value, "v1");

        let response = router.oneshot(get_request("/api/v1/kv/k1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["result"]["key"], "k1");
        assert_eq!(body["result"]["value"], "v1");
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let TestApp { router, .. } = test_app(Duration::from_secs(5));
        let id = "0b3f5c1e-2a4d-4e6f-8a9b-1c2d3e4f5a6b";

        let request = Request::builder()
            .uri("/api/v1/kv/missing")
            .header("x-request-id", id)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = read_json(response).await;
        assert_eq!(body["status"], "fail");
        assert_eq!(body["code"], "KEY_NOT_FOUND");
        assert_eq!(body["request_id"], id);
    }

    #[tokio::test]
    async fn test_invalid_request_id_is_bad_request() {
        let TestApp { router, .. } = test_app(Duration::from_secs(5));
        let request = Request::builder()
            .uri("/api/v1/kv/k1")
            .header("x-request-id", "nope")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["message"], "Invalid Request-Id");
    }

    #[tokio::test]
    async fn test_put_validation() {
        let TestApp { router, .. } = test_app(Duration::from_secs(5));

        for body in [r#"{"value":""}"#, r#"{}"#, "not json"] {
            let response = router.clone().oneshot(put_request("k1", body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
            assert_eq!(read_json(response).await["status"], "fail");
        }
    }

    #[tokio::test]
    async fn test_reserved_key_cannot_be_written() {
        let TestApp { router, etcd, .. } = test_app(Duration::from_secs(5));
        let response = router
            .oneshot(put_request(CACHE_INVALIDATE_KEY, r#"{"value":"x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(etcd.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let TestApp { router, etcd, postgres, .. } = test_app(Duration::from_secs(5));
        etcd.insert(fixtures::key_value("k1", "v1"));
        postgres.insert(fixtures::key_value("k1", "v1"));

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/v1/kv/k1")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router.oneshot(get_request("/api/v1/kv/k1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let TestApp { router, etcd, postgres, .. } = test_app(Duration::from_secs(5));
        for (k, v) in [("app/a", "1"), ("app/b", "2"), ("zzz", "3")] {
            etcd.insert(fixtures::key_value(k, v));
            postgres.insert(fixtures::key_value(k, v));
        }

        let response = router.oneshot(get_request("/api/v1/kv?prefix=app/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["result"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_maps_to_500() {
        let TestApp { router, etcd, .. } = test_app(Duration::from_secs(5));
        etcd.fail(ActionKind::Upsert, RepoError::backend_failure(Backend::Etcd, "boom"));

        let response = router.oneshot(put_request("k1", r#"{"value":"v1"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(read_json(response).await["code"], "BACKEND_ERROR");
    }

    #[tokio::test]
    async fn test_closed_pool_maps_to_503() {
        let TestApp { router, etcd, .. } = test_app(Duration::from_secs(5));
        etcd.fail(ActionKind::Upsert, RepoError::Pool(PoolError::Closed));

        let response = router.oneshot(put_request("k1", r#"{"value":"v1"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_deadline_maps_to_504() {
        let TestApp { router, etcd, postgres, .. } = test_app(Duration::from_millis(50));
        etcd.set_latency(ActionKind::Select, Duration::from_secs(10));
        postgres.set_latency(ActionKind::Select, Duration::from_secs(10));

        let response = router.oneshot(get_request("/api/v1/kv/k1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(read_json(response).await["code"], "TIMEOUT");
    }
}
