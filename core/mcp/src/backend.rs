//! HTTP client for the local backend.

use std::time::Duration;

use async_trait::async_trait;
use diagrammer_core::{LifecycleError, Result};
use diagrammer_protocol::{
    DiagramDraft, DiagramRecord, ErrorInfo, KeepaliveAck, RenderedDiagram, SourceRequest,
    StatusReport, ValidationReport, DIAGRAMS_PATH, KEEPALIVE_PATH, RENDER_PATH, STATUS_PATH,
    VALIDATE_PATH,
};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// What the connection supervisor needs from a backend.
#[async_trait]
pub trait BackendProbe: Send + Sync {
    /// Health probe (`GET /status`).
    async fn status(&self) -> Result<StatusReport>;

    /// Heartbeat (`POST /keepalive`).
    async fn keepalive(&self) -> Result<KeepaliveAck>;
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// Every request carries `timeout`, so a hung backend reads as a failed probe.
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LifecycleError::connectivity("building HTTP client", err))?;
        Ok(Self {
            http,
            base_url: format!("http://127.0.0.1:{}", port),
        })
    }

    pub async fn render(&self, source: &str) -> Result<RenderedDiagram> {
        let body = SourceRequest {
            source: source.to_string(),
        };
        self.send(Method::POST, RENDER_PATH, Some(&body)).await
    }

    pub async fn validate(&self, source: &str) -> Result<ValidationReport> {
        let body = SourceRequest {
            source: source.to_string(),
        };
        self.send(Method::POST, VALIDATE_PATH, Some(&body)).await
    }

    pub async fn list_diagrams(&self) -> Result<Vec<DiagramRecord>> {
        self.send::<(), _>(Method::GET, DIAGRAMS_PATH, None).await
    }

    pub async fn get_diagram(&self, id: &str) -> Result<DiagramRecord> {
        self.send::<(), _>(Method::GET, &diagram_path(id), None).await
    }

    pub async fn save_diagram(&self, id: Option<&str>, draft: &DiagramDraft) -> Result<DiagramRecord> {
        match id {
            Some(id) => self.send(Method::PUT, &diagram_path(id), Some(draft)).await,
            None => self.send(Method::POST, DIAGRAMS_PATH, Some(draft)).await,
        }
    }

    pub async fn delete_diagram(&self, id: &str) -> Result<()> {
        let path = diagram_path(id);
        let response = self.request(Method::DELETE, &path, None::<&()>).await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(error_from_response(&path, response).await)
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.request(method, path, body).await?;
        if !response.status().is_success() {
            return Err(error_from_response(path, response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|err| LifecycleError::connectivity(format!("decoding {}", path), err))
    }

    async fn request<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<reqwest::Response>
    where
        B: Serialize + ?Sized,
    {
        let mut request = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|err| LifecycleError::connectivity(path.to_string(), err))
    }
}

#[async_trait]
impl BackendProbe for BackendClient {
    async fn status(&self) -> Result<StatusReport> {
        self.send::<(), _>(Method::GET, STATUS_PATH, None).await
    }

    async fn keepalive(&self) -> Result<KeepaliveAck> {
        let ack: KeepaliveAck = self.send::<(), _>(Method::POST, KEEPALIVE_PATH, None).await?;
        if !ack.is_ok() {
            return Err(LifecycleError::connectivity(
                KEEPALIVE_PATH,
                format!("unexpected status {:?}", ack.status),
            ));
        }
        Ok(ack)
    }
}

fn diagram_path(id: &str) -> String {
    format!("{}/{}", DIAGRAMS_PATH, id)
}

async fn error_from_response(path: &str, response: reqwest::Response) -> LifecycleError {
    let status = response.status();
    let info = response.json::<ErrorInfo>().await.unwrap_or_else(|_| {
        ErrorInfo::new("http_error", status.canonical_reason().unwrap_or("request failed"))
    });
    classify_response(path, status, info)
}

fn classify_response(path: &str, status: StatusCode, info: ErrorInfo) -> LifecycleError {
    match (status, info.code.as_str()) {
        (StatusCode::UNPROCESSABLE_ENTITY, "syntax_error") => LifecycleError::Syntax {
            message: info.message,
            line: info.line,
        },
        (StatusCode::NOT_FOUND, "not_found") => LifecycleError::DiagramNotFound {
            id: path.rsplit('/').next().unwrap_or_default().to_string(),
        },
        _ => LifecycleError::Backend {
            context: path.to_string(),
            status: status.as_u16(),
            code: info.code,
            message: info.message,
        },
    }
}
