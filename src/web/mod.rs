//! HTTP face of the in-memory Remote Authority.
//!
//! Serves the REST contract `HttpRemoteAuthority` speaks, so the client can
//! be exercised end to end and the CLI can run a local mock backend.

use crate::core::{CanonicalRecord, Collection, Fields, RemoteError};
use crate::remote::{InMemoryRemoteAuthority, RemoteAuthority};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    UnknownResource(String),
    Remote(RemoteError),
}

impl From<RemoteError> for WebError {
    fn from(err: RemoteError) -> Self {
        WebError::Remote(err)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            WebError::UnknownResource(resource) => (
                StatusCode::NOT_FOUND,
                format!("unknown resource '{}'", resource),
                "not_found".to_string(),
            ),
            WebError::Remote(RemoteError::Transient { message }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                message,
                "unavailable".to_string(),
            ),
            WebError::Remote(RemoteError::Permanent { status, message }) => {
                let status = status
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::UNPROCESSABLE_ENTITY);
                let code = match status {
                    StatusCode::NOT_FOUND => "not_found",
                    StatusCode::CONFLICT => "conflict",
                    _ => "rejected",
                };
                (status, message, code.to_string())
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;

fn collection(resource: &str) -> Result<Collection> {
    Collection::from_resource(resource).ok_or_else(|| WebError::UnknownResource(resource.to_string()))
}

/// Router serving `/{resource}` and `/{resource}/{id}`.
pub fn router(remote: InMemoryRemoteAuthority) -> Router {
    Router::new()
        .route("/:resource", get(list_records).post(create_record))
        .route("/:resource/:id", put(update_record).delete(delete_record))
        .layer(TraceLayer::new_for_http())
        .with_state(remote)
}

async fn list_records(
    State(remote): State<InMemoryRemoteAuthority>,
    Path(resource): Path<String>,
) -> Result<Json<Vec<CanonicalRecord>>> {
    let records = remote.list(collection(&resource)?).await?;
    Ok(Json(records))
}

async fn create_record(
    State(remote): State<InMemoryRemoteAuthority>,
    Path(resource): Path<String>,
    Json(payload): Json<Fields>,
) -> Result<(StatusCode, Json<CanonicalRecord>)> {
    let record = remote.create(collection(&resource)?, &payload).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_record(
    State(remote): State<InMemoryRemoteAuthority>,
    Path((resource, id)): Path<(String, String)>,
    Json(payload): Json<Fields>,
) -> Result<Response> {
    let echo = remote.update(collection(&resource)?, &id, &payload).await?;
    Ok(match echo {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn delete_record(
    State(remote): State<InMemoryRemoteAuthority>,
    Path((resource, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    remote.delete(collection(&resource)?, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn create_returns_canonical_record() {
        let app = router(InMemoryRemoteAuthority::new());
        let request = Request::post("/expenses")
            .header("content-type", "application/json")
            .body(Body::from(json!({"amount": 50}).to_string()))
            .unwrap();

        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], json!("srv-1"));
        assert_eq!(body["amount"], json!(50));
    }

    #[tokio::test]
    async fn unknown_resource_is_404() {
        let app = router(InMemoryRemoteAuthority::new());
        let request = Request::get("/loans").body(Body::empty()).unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("not_found"));
    }

    #[tokio::test]
    async fn offline_backend_maps_to_503() {
        let remote = InMemoryRemoteAuthority::new();
        remote.set_offline(true);
        let app = router(remote);
        let request = Request::get("/incomes").body(Body::empty()).unwrap();
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
