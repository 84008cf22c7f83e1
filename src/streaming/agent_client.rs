//! Conversational agent WebSocket client
//!
//! # Connection Flow
//!
//! 1. `connect()` - single handshake attempt bounded by `CONNECTION_TIMEOUT`
//! 2. A writer task drains `AgentLink::outbound` into the socket
//! 3. A reader task decodes inbound frames into `AgentLink::inbound`
//! 4. `AgentConnection::close()` - send a Close frame and stop both tasks
//!
//! There is no retry: a failed handshake fails the session.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
};

use super::protocol::{parse_server_frame, AgentEvent, ClientFrame};
use super::StreamingError;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `close()` waits for the writer to flush its Close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the outbound and inbound channels
const CHANNEL_CAPACITY: usize = 256;

/// An open, bidirectional link to the agent
pub struct AgentLink {
    /// Frames to send. Dropping every clone lets the writer close the socket.
    pub outbound: mpsc::Sender<ClientFrame>,
    /// Decoded agent events. Ends after `AgentEvent::Closed`.
    pub inbound: mpsc::Receiver<AgentEvent>,
    /// Background I/O tasks backing the link
    pub connection: AgentConnection,
}

/// Owns the I/O tasks of a link
pub struct AgentConnection {
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl AgentConnection {
    pub fn new(writer: JoinHandle<()>, reader: JoinHandle<()>) -> Self {
        Self {
            writer: Some(writer),
            reader: Some(reader),
        }
    }

    /// A connection with no backing tasks (in-process links)
    pub fn detached() -> Self {
        Self {
            writer: None,
            reader: None,
        }
    }

    /// Close the link.
    ///
    /// The caller drops its outbound sender first so the writer can emit a
    /// Close frame; anything still running after `CLOSE_TIMEOUT` is aborted.
    pub async fn close(mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            if timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                log::warn!("Agent writer did not finish in {:?}, aborting", CLOSE_TIMEOUT);
                writer.abort();
            }
        }
        log::info!("Agent link closed");
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Opens agent links. One call per session.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self) -> Result<AgentLink, StreamingError>;
}

/// WebSocket implementation of `AgentConnector`
pub struct WebSocketAgent {
    url: String,
    wire_output_rate: u32,
}

impl WebSocketAgent {
    pub fn new(url: impl Into<String>, wire_output_rate: u32) -> Self {
        Self {
            url: url.into(),
            wire_output_rate,
        }
    }
}

#[async_trait]
impl AgentConnector for WebSocketAgent {
    async fn connect(&self) -> Result<AgentLink, StreamingError> {
        if self.url.trim().is_empty() {
            return Err(StreamingError::MissingUrl("agent URL is empty".to_string()));
        }
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamingError::ProtocolError(e.to_string()))?;

        log::info!("Connecting to conversational agent...");

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, false, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("Agent WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<AgentEvent>(CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            let mut frames_sent: u64 = 0;
            while let Some(frame) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("Failed to serialize agent frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    log::warn!("Agent send failed: {}", e);
                    break;
                }
                frames_sent += 1;
            }
            log::debug!("Agent writer exiting after {} frames", frames_sent);
            if let Err(e) = write.close().await {
                log::debug!("Error closing agent WebSocket: {}", e);
            }
        });

        let wire_output_rate = self.wire_output_rate;
        let reader = tokio::spawn(async move {
            let mut close_reason: Option<String> = None;
            'read: while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match parse_server_frame(&text) {
                        Ok(frame) => {
                            for event in frame.into_events(wire_output_rate) {
                                let closing = matches!(event, AgentEvent::Closed { .. });
                                if inbound_tx.send(event).await.is_err() {
                                    log::debug!("Agent inbound channel closed");
                                    return;
                                }
                                if closing {
                                    return;
                                }
                            }
                        }
                        Err(e) => log::warn!("Failed to parse agent frame: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        close_reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        log::info!("Agent closed the connection: {:?}", close_reason);
                        break 'read;
                    }
                    Err(e) => {
                        log::warn!("Agent WebSocket error: {}", e);
                        close_reason = Some(e.to_string());
                        break 'read;
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }
            let _ = inbound_tx
                .send(AgentEvent::Closed {
                    reason: close_reason,
                })
                .await;
            log::debug!("Agent reader exiting");
        });

        Ok(AgentLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            connection: AgentConnection::new(writer, reader),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_unreachable_agent_fails_once() {
        // Port 9 (discard) on localhost is not expected to speak WebSocket
        let agent = WebSocketAgent::new("ws://127.0.0.1:9/agent", 24000);
        let result = agent.connect().await;
        assert!(matches!(result, Err(StreamingError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_connecting() {
        let agent = WebSocketAgent::new("not a url", 24000);
        assert!(matches!(
            agent.connect().await,
            Err(StreamingError::ProtocolError(_))
        ));

        let agent = WebSocketAgent::new("  ", 24000);
        assert!(matches!(
            agent.connect().await,
            Err(StreamingError::MissingUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_detached_connection_closes_immediately() {
        AgentConnection::detached().close().await;
    }
}
