//! WebSocket transport seam.

use crate::error::{RealtimeError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Event surfaced from a live socket to the connection controller.
#[derive(Debug)]
pub enum SocketEvent {
    /// A text frame arrived.
    Message(String),
    /// The socket closed or failed; no further events follow.
    Closed,
}

/// A live socket.
#[async_trait]
pub trait RealtimeSocket: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;
    async fn close(&self);
}

/// Dial seam so the controller is testable without a network.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(
        &self,
        url: &Url,
    ) -> Result<(Arc<dyn RealtimeSocket>, mpsc::UnboundedReceiver<SocketEvent>)>;
}

/// `tokio-tungstenite` implementation.
pub struct TungsteniteTransport {
    connect_timeout: Duration,
}

impl TungsteniteTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

struct TungsteniteSocket {
    writer: Mutex<WsWriter>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl RealtimeTransport for TungsteniteTransport {
    async fn connect(
        &self,
        url: &Url,
    ) -> Result<(Arc<dyn RealtimeSocket>, mpsc::UnboundedReceiver<SocketEvent>)> {
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(RealtimeError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let connect_result = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                RealtimeError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|error| RealtimeError::WebSocket(error.to_string()))?;

        let (stream, _response) = connect_result;
        let (writer, mut reader) = stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if events_tx.send(SocketEvent::Message(text.to_string())).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        // pong reply is queued by the websocket layer
                        debug!("received ping ({} bytes)", payload.len());
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Binary(_)) => {}
                    Ok(Message::Frame(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        warn!("websocket read error: {error}");
                        break;
                    }
                }
            }
            let _ = events_tx.send(SocketEvent::Closed);
        });

        let socket = TungsteniteSocket {
            writer: Mutex::new(writer),
            recv_task: Mutex::new(Some(task)),
        };
        Ok((Arc::new(socket), events_rx))
    }
}

#[async_trait]
impl RealtimeSocket for TungsteniteSocket {
    async fn send_text(&self, text: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| RealtimeError::WebSocket(error.to_string()))
    }

    async fn close(&self) {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
        }
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
    }
}
