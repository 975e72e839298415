//! The ComfyUI event stream.
//!
//! [`ComfyUIClient`] knows where an instance lives and opens its `/ws`
//! endpoint. The job client reads events through [`EventSource`], one
//! bounded read at a time, so it can check history between reads.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::messages::{parse_message, ComfyUIMessage};

/// Limit on the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Addresses of one ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    api_url: String,
}

/// Outcome of one bounded read from the event stream.
#[derive(Debug)]
pub enum StreamRead {
    Message(ComfyUIMessage),
    /// Nothing arrived within the wait.
    Idle,
    /// Preview images, pings and message kinds we do not model.
    Other,
    Closed,
    /// Transport failure; the stream is unusable afterwards.
    Failed(String),
}

#[async_trait]
pub trait EventSource: Send {
    async fn next_message(&mut self, wait: Duration) -> StreamRead;
}

/// Opens an [`EventSource`] that receives the events of prompts submitted
/// under `client_id`.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, client_id: &str) -> Result<Box<dyn EventSource>, ComfyUIClientError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("cannot open event stream at {url}: {reason}")]
    Connect { url: String, reason: String },
}

impl ComfyUIClient {
    pub fn new(ws_url: String, api_url: String) -> Self {
        Self { ws_url, api_url }
    }

    /// Plain `ws://` and `http://` on `host:port`.
    pub fn from_host(host: &str, port: u16) -> Self {
        Self::new(format!("ws://{host}:{port}"), format!("http://{host}:{port}"))
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl StreamConnector for ComfyUIClient {
    async fn open(&self, client_id: &str) -> Result<Box<dyn EventSource>, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={client_id}", self.ws_url);
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url)).await;
        let (socket, _) = match connected {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                return Err(ComfyUIClientError::Connect {
                    url,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ComfyUIClientError::Connect {
                    url,
                    reason: format!("no handshake within {}s", CONNECT_TIMEOUT.as_secs()),
                })
            }
        };
        tracing::debug!(%client_id, url = %self.ws_url, "Event stream open");
        Ok(Box::new(Socket {
            client_id: client_id.to_string(),
            socket,
        }))
    }
}

struct Socket {
    client_id: String,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl EventSource for Socket {
    async fn next_message(&mut self, wait: Duration) -> StreamRead {
        let Ok(frame) = tokio::time::timeout(wait, self.socket.next()).await else {
            return StreamRead::Idle;
        };
        match frame {
            None => StreamRead::Closed,
            Some(Ok(Message::Text(text))) => parse_message(&text).map_or_else(
                |e| {
                    tracing::trace!(error = %e, "Skipping unmodelled event");
                    StreamRead::Other
                },
                StreamRead::Message,
            ),
            Some(Ok(Message::Close(reason))) => {
                tracing::debug!(client_id = %self.client_id, ?reason, "Event stream closed by server");
                StreamRead::Closed
            }
            Some(Ok(_)) => StreamRead::Other,
            Some(Err(e)) => StreamRead::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn urls_from_host_and_port() {
        let client = ComfyUIClient::from_host("10.0.0.5", 8188);
        assert_eq!(client.ws_url(), "ws://10.0.0.5:8188");
        assert_eq!(client.api_url(), "http://10.0.0.5:8188");
    }

    #[tokio::test]
    async fn nothing_listening_is_a_connect_error() {
        let client = ComfyUIClient::from_host("127.0.0.1", 9);
        let err = client.open("c1").await.err().unwrap();
        assert_matches!(err, ComfyUIClientError::Connect { url, .. } => {
            assert_eq!(url, "ws://127.0.0.1:9/ws?clientId=c1");
        });
    }
}
