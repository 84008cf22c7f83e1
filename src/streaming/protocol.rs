//! Conversational agent wire protocol
//!
//! Every frame is a single JSON text message.
//!
//! # Outbound
//!
//! - `{"audio": {"data": "<base64 PCM16 @ 16kHz>"}}` - microphone uplink
//! - `{"text": "..."}` - a text turn (used to request the closing utterance)
//!
//! # Inbound
//!
//! - `{"audio": "<base64 PCM16 @ 24kHz>"}` (or `{"audio": {"data": ...}}`)
//! - `{"text": "..."}`
//! - both parts may arrive in the same frame
//! - `{"close": {"reason": "..."}}` or a WebSocket Close frame ends the session

use serde::{Deserialize, Serialize};

use super::codec::{self, AudioFrame};

/// Base64 audio payload wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioData {
    pub data: String,
}

/// Frames sent to the agent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Audio { audio: AudioData },
    Text { text: String },
}

impl ClientFrame {
    /// Build an uplink frame from quantized wire-rate PCM16 samples
    pub fn audio(pcm: &[i16]) -> Self {
        Self::Audio {
            audio: AudioData {
                data: codec::encode_frame(&codec::pcm_to_bytes(pcm)),
            },
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Inbound audio may be a bare string or wrapped in `{data}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AudioField {
    Inline(String),
    Wrapped(AudioData),
}

impl AudioField {
    fn payload(&self) -> &str {
        match self {
            AudioField::Inline(s) => s,
            AudioField::Wrapped(w) => &w.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct CloseInfo {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Raw inbound frame. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ServerFrame {
    #[serde(default)]
    pub audio: Option<AudioField>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub close: Option<CloseInfo>,
}

/// Decoded agent activity, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Audio(AudioFrame),
    Text(String),
    Closed { reason: Option<String> },
}

impl ServerFrame {
    /// Split one wire frame into agent events.
    ///
    /// Audio precedes text when both are present. Undecodable audio is
    /// dropped with a warning so one corrupt frame never ends the call.
    pub fn into_events(self, wire_output_rate: u32) -> Vec<AgentEvent> {
        let mut events = Vec::new();

        if let Some(audio) = &self.audio {
            match codec::decode_inbound(audio.payload(), wire_output_rate) {
                Ok(frame) if !frame.is_empty() => events.push(AgentEvent::Audio(frame)),
                Ok(_) => {}
                Err(e) => log::warn!("Dropping undecodable agent audio: {}", e),
            }
        }

        if let Some(text) = self.text {
            if !text.trim().is_empty() {
                events.push(AgentEvent::Text(text));
            }
        }

        if let Some(close) = self.close {
            events.push(AgentEvent::Closed {
                reason: close.reason,
            });
        }

        events
    }
}

/// Parse a text message from the socket
pub fn parse_server_frame(text: &str) -> Result<ServerFrame, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_audio_shape() {
        let json = serde_json::to_value(ClientFrame::audio(&[1, -1])).unwrap();
        assert_eq!(json["audio"]["data"], "AQD//w==");
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_client_text_shape() {
        let json = serde_json::to_string(&ClientFrame::text("please wrap up")).unwrap();
        assert_eq!(json, r#"{"text":"please wrap up"}"#);
    }

    #[test]
    fn test_inbound_inline_audio_and_text() {
        let frame = parse_server_frame(r#"{"audio":"AAAAQA==","text":"Hello"}"#).unwrap();
        let events = frame.into_events(24000);
        assert_eq!(events.len(), 2);
        match &events[0] {
            AgentEvent::Audio(f) => {
                assert_eq!(f.sample_rate, 24000);
                assert_eq!(f.samples.len(), 2);
            }
            other => panic!("expected audio, got {:?}", other),
        }
        assert_eq!(events[1], AgentEvent::Text("Hello".to_string()));
    }

    #[test]
    fn test_inbound_wrapped_audio() {
        let frame = parse_server_frame(r#"{"audio":{"data":"AAA="}}"#).unwrap();
        let events = frame.into_events(24000);
        assert!(matches!(events.as_slice(), [AgentEvent::Audio(_)]));
    }

    #[test]
    fn test_inbound_close_and_unknown_fields() {
        let frame =
            parse_server_frame(r#"{"close":{"reason":"done"},"ping_ms":12}"#).unwrap();
        assert_eq!(
            frame.into_events(24000),
            vec![AgentEvent::Closed {
                reason: Some("done".to_string())
            }]
        );
    }

    #[test]
    fn test_corrupt_audio_is_dropped() {
        let frame = parse_server_frame(r#"{"audio":"%%%","text":"still here"}"#).unwrap();
        assert_eq!(
            frame.into_events(24000),
            vec![AgentEvent::Text("still here".to_string())]
        );
    }
}
