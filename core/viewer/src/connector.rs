//! WebSocket connector for the backend's push channel.

use async_trait::async_trait;
use diagrammer_core::{LifecycleError, Result};
use diagrammer_protocol::{parse_server_message, ClientMessage, SOCKET_PATH};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::reconnector::{SocketConnector, SocketLink};

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(port: u16) -> Self {
        Self {
            url: format!("ws://127.0.0.1:{}{}", port, SOCKET_PATH),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self) -> Result<SocketLink> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|err| LifecycleError::Socket(format!("{}: {}", self.url, err)))?;
        let (mut sink, mut stream) = socket.split();

        let (outbound, mut outgoing) = mpsc::unbounded_channel::<ClientMessage>();
        let (incoming, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "Failed to encode socket frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::text(text)).await {
                    debug!(error = %err, "Socket write failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(error = %err, "Socket read failed");
                        break;
                    }
                };
                match parse_server_message(text.as_str()) {
                    Ok(message) => {
                        if incoming.send(message).is_err() {
                            break;
                        }
                    }
                    Err(info) => warn!(code = %info.code, message = %info.message, "Ignoring malformed frame"),
                }
            }
        });

        Ok(SocketLink { outbound, inbound })
    }
}
