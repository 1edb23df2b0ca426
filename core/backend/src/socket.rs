//! Push channel (`GET /ws`).
//!
//! Each connection answers its own render/validate frames and relays every
//! broadcast frame (renders triggered over HTTP). All sockets close when the
//! idle manager signals shutdown.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use diagrammer_protocol::{parse_client_message, ClientMessage, ServerMessage};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

const CLOSE_GOING_AWAY: u16 = 1001;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut frames = state.broadcast.subscribe();
    let mut shutdown = state.idle.subscribe();
    info!("Socket connected");

    if *shutdown.borrow_and_update() {
        let _ = sender.send(close_frame()).await;
        return;
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Socket closed by client");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(error = %err, "Socket error");
                        break;
                    }
                };
                let reply = respond(&state, text.as_str());
                if !send_frame(&mut sender, &reply).await {
                    break;
                }
            }
            frame = frames.recv() => {
                match frame {
                    Ok(message) => {
                        if !send_frame(&mut sender, &message).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Socket fell behind broadcast; frames dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Closing socket for shutdown");
                    let _ = sender.send(close_frame()).await;
                    break;
                }
            }
        }
    }
    debug!("Socket handler finished");
}

fn respond(state: &AppState, text: &str) -> ServerMessage {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(info) => {
            return ServerMessage::Error {
                id: None,
                message: info.message,
                line: None,
            }
        }
    };

    match message {
        ClientMessage::Render { id, source } => match state.renderer.render(&source) {
            Ok(rendered) => ServerMessage::RenderResult {
                id,
                kind: rendered.kind,
                svg: rendered.svg,
            },
            Err(err) => {
                let report = state.renderer.report(&source);
                let line = report.error.and_then(|issue| issue.line);
                ServerMessage::Error {
                    id,
                    message: err.to_string(),
                    line,
                }
            }
        },
        ClientMessage::Validate { id, source } => ServerMessage::ValidationResult {
            id,
            report: state.renderer.report(&source),
        },
    }
}

/// Returns false once the peer is gone.
async fn send_frame<S>(sender: &mut S, message: &ServerMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "Failed to encode socket frame");
            return true;
        }
    };
    if sender.send(Message::Text(text.into())).await.is_err() {
        debug!("Socket send failed; peer gone");
        return false;
    }
    true
}

fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: CLOSE_GOING_AWAY,
        reason: "backend shutting down".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagrammer_core::{IdleConfig, JsonHistoryStore, OutlineRenderer, StorageConfig};
    use std::sync::Arc;

    use crate::idle::IdleManager;

    fn state() -> (tempfile::TempDir, AppState) {
        let temp = tempfile::TempDir::new().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        let state = AppState::new(
            0,
            Arc::new(IdleManager::new(IdleConfig::default())),
            Arc::new(OutlineRenderer),
            Arc::new(JsonHistoryStore::new(&storage)),
        );
        (temp, state)
    }

    #[tokio::test]
    async fn render_frame_carries_request_id() {
        let (_temp, state) = state();
        let reply = respond(&state, r#"{"type":"render","id":"r7","source":"pie\n  \"a\" : 1"}"#);
        match reply {
            ServerMessage::RenderResult { id, kind, .. } => {
                assert_eq!(id.as_deref(), Some("r7"));
                assert_eq!(kind, "pie");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn broken_source_yields_error_frame_with_line() {
        let (_temp, state) = state();
        let reply = respond(&state, r#"{"type":"render","source":"graph TD\n A{x"}"#);
        match reply {
            ServerMessage::Error { line, .. } => assert_eq!(line, Some(2)),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_frame_yields_error() {
        let (_temp, state) = state();
        assert!(matches!(
            respond(&state, "not json"),
            ServerMessage::Error { id: None, .. }
        ));
    }
}
