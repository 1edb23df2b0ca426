//! HTTP surface of the backend.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use diagrammer_core::LifecycleError;
use diagrammer_protocol::{
    validate_source, DiagramDraft, DiagramRecord, ErrorInfo, KeepaliveAck, RenderedDiagram,
    ServerMessage, SourceRequest, StatusReport, ValidationReport, DIAGRAMS_PATH, KEEPALIVE_PATH,
    RENDER_PATH, SOCKET_PATH, STATUS_PATH, VALIDATE_PATH,
};
use tracing::{error, warn};

use crate::socket;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status))
        .route(KEEPALIVE_PATH, post(keepalive))
        .route(SOCKET_PATH, get(socket::upgrade))
        .route(RENDER_PATH, post(render))
        .route(VALIDATE_PATH, post(validate))
        .route(DIAGRAMS_PATH, get(list_diagrams).post(create_diagram))
        .route(
            &format!("{}/{{id}}", DIAGRAMS_PATH),
            get(get_diagram).put(update_diagram).delete(delete_diagram),
        )
        .with_state(state)
}

/// `{code, message}` envelope with the matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    info: ErrorInfo,
}

impl ApiError {
    fn bad_request(info: ErrorInfo) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            info,
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let (status, info) = match &err {
            LifecycleError::DiagramNotFound { .. } => {
                (StatusCode::NOT_FOUND, ErrorInfo::new("not_found", err.to_string()))
            }
            LifecycleError::InvalidDiagramId(_) => {
                (StatusCode::BAD_REQUEST, ErrorInfo::new("invalid_id", err.to_string()))
            }
            LifecycleError::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorInfo::new("invalid_request", message.clone()),
            ),
            LifecycleError::Syntax { message, line } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorInfo::new("syntax_error", message.clone()).with_line(*line),
            ),
            _ => {
                error!(error = %err, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorInfo::new("internal", err.to_string()),
                )
            }
        };
        Self { status, info }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.info)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.status())
}

async fn keepalive(State(state): State<AppState>) -> Json<KeepaliveAck> {
    state.idle.record_activity();
    Json(KeepaliveAck::ok(Utc::now()))
}

async fn render(
    State(state): State<AppState>,
    Json(request): Json<SourceRequest>,
) -> ApiResult<Json<RenderedDiagram>> {
    validate_source(&request.source).map_err(ApiError::bad_request)?;
    let rendered = state.renderer.render(&request.source)?;
    state.publish(ServerMessage::RenderResult {
        id: None,
        kind: rendered.kind.clone(),
        svg: rendered.svg.clone(),
    });
    Ok(Json(rendered))
}

async fn validate(
    State(state): State<AppState>,
    Json(request): Json<SourceRequest>,
) -> ApiResult<Json<ValidationReport>> {
    validate_source(&request.source).map_err(ApiError::bad_request)?;
    Ok(Json(state.renderer.report(&request.source)))
}

async fn list_diagrams(State(state): State<AppState>) -> ApiResult<Json<Vec<DiagramRecord>>> {
    Ok(Json(state.history.list()?))
}

async fn create_diagram(
    State(state): State<AppState>,
    Json(draft): Json<DiagramDraft>,
) -> ApiResult<(StatusCode, Json<DiagramRecord>)> {
    draft.validate().map_err(ApiError::bad_request)?;
    let record = state.history.create(draft)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_diagram(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DiagramRecord>> {
    Ok(Json(state.history.get(&id)?))
}

async fn update_diagram(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(draft): Json<DiagramDraft>,
) -> ApiResult<Json<DiagramRecord>> {
    draft.validate().map_err(ApiError::bad_request)?;
    Ok(Json(state.history.update(&id, draft)?))
}

async fn delete_diagram(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.history.delete(&id).map_err(|err| {
        warn!(id = %id, error = %err, "Delete failed");
        ApiError::from(err)
    })?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use diagrammer_core::{IdleConfig, JsonHistoryStore, OutlineRenderer, StorageConfig};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::idle::IdleManager;

    fn app() -> (TempDir, AppState, Router) {
        let temp = TempDir::new().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let state = AppState::new(
            3737,
            Arc::new(IdleManager::new(IdleConfig::default())),
            Arc::new(OutlineRenderer),
            Arc::new(JsonHistoryStore::new(&storage)),
        );
        let router = router(state.clone());
        (temp, state, router)
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn keepalive_marks_client_active() {
        let (_temp, _state, router) = app();
        let (_, before) = call(&router, "GET", STATUS_PATH, None).await;
        assert_eq!(before["mcpActive"], false);
        assert_eq!(before["running"], true);

        let (status, ack) = call(&router, "POST", KEEPALIVE_PATH, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["status"], "ok");

        let (_, after) = call(&router, "GET", STATUS_PATH, None).await;
        assert_eq!(after["mcpActive"], true);
        assert!(after["secondsUntilShutdown"].is_null());
    }

    #[tokio::test]
    async fn render_broadcasts_to_sockets() {
        let (_temp, state, router) = app();
        let mut frames = state.broadcast.subscribe();

        let (status, body) = call(
            &router,
            "POST",
            RENDER_PATH,
            Some(r#"{"source":"graph TD\n  A --> B"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "graph");

        match frames.try_recv().unwrap() {
            ServerMessage::RenderResult { kind, .. } => assert_eq!(kind, "graph"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn render_syntax_error_is_unprocessable() {
        let (_temp, _state, router) = app();
        let (status, body) = call(
            &router,
            "POST",
            RENDER_PATH,
            Some(r#"{"source":"graph TD\n  A[oops --> B"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "syntax_error");
        assert_eq!(body["line"], 2);
    }

    #[tokio::test]
    async fn validate_reports_without_failing() {
        let (_temp, _state, router) = app();
        let (status, body) = call(&router, "POST", VALIDATE_PATH, Some(r#"{"source":"nope"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], false);
    }

    #[tokio::test]
    async fn diagram_crud() {
        let (_temp, _state, router) = app();
        let (status, created) = call(
            &router,
            "POST",
            DIAGRAMS_PATH,
            Some(r#"{"title":"Flow","source":"graph TD\n  A --> B"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        let item = format!("{}/{}", DIAGRAMS_PATH, id);

        let (_, listed) = call(&router, "GET", DIAGRAMS_PATH, None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, updated) = call(
            &router,
            "PUT",
            &item,
            Some(r#"{"title":"Flow v2","source":"graph LR\n  A --> B"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["title"], "Flow v2");

        let (status, _) = call(&router, "DELETE", &item, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, missing) = call(&router, "GET", &item, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["code"], "not_found");
    }
}
