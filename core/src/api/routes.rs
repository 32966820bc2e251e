// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! HTTP routes.
//!
//! One endpoint per dispatcher action. POST bodies are decoded by hand
//! from JSON so a missing field is a 400 with the field name, not a
//! generic unprocessable-entity.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::{cors_layer, require_api_key};
use crate::dispatch::{
    CompleteResponse, Dispatcher, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    StatusResponse, SubmitJobRequest, SubmitResponse,
};
use crate::store::{Job, SubJob, WorkerRecord};

/// Build the full router over a shared dispatcher.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/status", get(server_status))
        .route("/workers/register", post(register_worker))
        .route("/workers/heartbeat", post(worker_heartbeat))
        .route("/workers", get(list_workers))
        .route("/workers/:id/stop", post(stop_worker))
        .route("/workers/:id", delete(remove_worker))
        .route("/jobs/next", get(next_job))
        .route("/jobs/complete", post(complete_job))
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/pause-all", post(pause_all))
        .route("/jobs/resume-all", post(resume_all))
        .route("/jobs/clear-completed", post(clear_completed))
        .route("/jobs/:id/batches", get(list_batches))
        .route("/jobs/:id/pause", post(pause_job))
        .route("/jobs/:id/resume", post(resume_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .layer(middleware::from_fn_with_state(
            dispatcher.clone(),
            require_api_key,
        ))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn server_status(State(dispatcher): State<Arc<Dispatcher>>) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(dispatcher.status().await?))
}

async fn register_worker(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let request: RegisterRequest = decode(body)?;
    let response = dispatcher.register_worker(&request).await?;
    Ok(Json(response).into_response())
}

async fn worker_heartbeat(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let request: HeartbeatRequest = decode(body)?;
    Ok(Json(dispatcher.heartbeat(&request).await?))
}

#[derive(Debug, Deserialize)]
struct NextJobParams {
    worker_id: Option<String>,
}

async fn next_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(params): Query<NextJobParams>,
) -> ApiResult<Response> {
    let worker_id = params
        .worker_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing worker_id parameter".into()))?;

    match dispatcher.next_for_worker(&worker_id).await? {
        Some(batch) => Ok(Json(batch).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn complete_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<CompleteResponse>> {
    let request = decode(body)?;
    dispatcher.complete(&request).await?;
    Ok(Json(CompleteResponse {
        status: "updated".to_string(),
    }))
}

async fn submit_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<SubmitResponse>> {
    let request: SubmitJobRequest = decode(body)?;
    let job = dispatcher.submit_job(request).await?;
    Ok(Json(SubmitResponse {
        status: "submitted".to_string(),
        job_id: job.id,
    }))
}

async fn list_jobs(State(dispatcher): State<Arc<Dispatcher>>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(dispatcher.list_jobs().await?))
}

async fn list_batches(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Vec<SubJob>>> {
    Ok(Json(dispatcher.list_batches(&job_id).await?))
}

async fn pause_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    dispatcher.pause_job(&job_id).await?;
    Ok(Json(json!({"status": "paused"})))
}

async fn resume_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    dispatcher.resume_job(&job_id).await?;
    Ok(Json(json!({"status": "resumed"})))
}

async fn cancel_job(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    dispatcher.cancel_job(&job_id).await?;
    Ok(Json(json!({"status": "cancelled"})))
}

async fn pause_all(State(dispatcher): State<Arc<Dispatcher>>) -> ApiResult<Json<Value>> {
    dispatcher.pause_all().await?;
    Ok(Json(json!({"status": "paused"})))
}

async fn resume_all(State(dispatcher): State<Arc<Dispatcher>>) -> ApiResult<Json<Value>> {
    dispatcher.resume_all().await?;
    Ok(Json(json!({"status": "resumed"})))
}

async fn clear_completed(State(dispatcher): State<Arc<Dispatcher>>) -> ApiResult<Json<Value>> {
    let removed = dispatcher.clear_completed().await?;
    Ok(Json(json!({"status": "cleared", "removed": removed})))
}

async fn list_workers(
    State(dispatcher): State<Arc<Dispatcher>>,
) -> ApiResult<Json<Vec<WorkerRecord>>> {
    Ok(Json(dispatcher.list_workers().await?))
}

async fn stop_worker(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<Value>> {
    dispatcher.stop_worker(&worker_id).await?;
    Ok(Json(json!({"status": "stopped"})))
}

async fn remove_worker(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<Value>> {
    dispatcher.remove_worker(&worker_id).await?;
    Ok(Json(json!({"status": "removed"})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatcherConfig;
    use crate::store::Store;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_router() -> Router {
        let store = Store::open_in_memory().await.unwrap();
        router(Arc::new(Dispatcher::new(store, DispatcherConfig::default())))
    }

    #[tokio::test]
    async fn test_status_route() {
        let app = test_router().await;
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_next_requires_worker_id() {
        let app = test_router().await;
        let response = app
            .oneshot(Request::get("/jobs/next").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_next_no_work_is_204() {
        let app = test_router().await;
        let response = app
            .oneshot(
                Request::get("/jobs/next?worker_id=w1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_register_missing_field_is_400() {
        let app = test_router().await;
        let response = app
            .oneshot(
                Request::post("/workers/register")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"worker_id": "w1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker_is_404() {
        let app = test_router().await;
        let response = app
            .oneshot(
                Request::post("/workers/heartbeat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"worker_id": "ghost"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_key_enforced_when_configured() {
        let store = Store::open_in_memory().await.unwrap();
        let config = DispatcherConfig {
            api_key: Some("farm-secret".to_string()),
            ..DispatcherConfig::default()
        };
        let app = router(Arc::new(Dispatcher::new(store, config)));

        let denied = app
            .clone()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(
                Request::get("/status")
                    .header("x-api-key", "farm-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }
}
