//! Real-time voice link to the conversational agent
//!
//! # Architecture
//!
//! ```text
//! Microphone (device rate) ──▶ AudioStreamer ──▶ codec (16kHz PCM16) ──▶ ClientFrame ──┐
//!                                   │                                                 ▼
//!                                   └──▶ recognizer tee                         AgentLink
//!                                                                              (WebSocket)
//!                                                                                     │
//! PlaybackQueue ◀── AgentEvent::Audio (24kHz) ◀── codec ◀── ServerFrame ◀─────────────┘
//! ```
//!
//! A link is opened once per session. A mid-call disconnect surfaces as
//! `AgentEvent::Closed` and is never retried.

pub mod agent_client;
pub mod audio_streamer;
pub mod codec;
pub mod protocol;

pub use agent_client::{AgentConnection, AgentConnector, AgentLink, WebSocketAgent};
pub use audio_streamer::{AudioStreamer, StreamerConfig};
pub use codec::{AudioFrame, CodecError};
pub use protocol::{AgentEvent, ClientFrame, ServerFrame};

/// Errors on the agent link
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamingError {
    /// No agent URL configured and none could be obtained
    #[error("No conversational agent URL available: {0}")]
    MissingUrl(String),
    /// Failed to establish the WebSocket connection
    #[error("Failed to connect to conversational agent: {0}")]
    ConnectionFailed(String),
    /// WebSocket protocol error
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),
    /// Failed to queue an outbound frame
    #[error("Failed to send to agent: {0}")]
    SendFailed(String),
}
