//! Realtime transcription protocol types
//!
//! Transcription-only sessions on the OpenAI Realtime API:
//!
//! 1. Connect to `wss://api.openai.com/v1/realtime?intent=transcription`
//! 2. Receive `transcription_session.created`
//! 3. Send `transcription_session.update` (server VAD segments speech)
//! 4. Stream audio via `input_audio_buffer.append`
//! 5. Receive `conversation.item.input_audio_transcription.completed` per
//!    finalized utterance

use serde::{Deserialize, Serialize};

use crate::streaming::codec;

/// Realtime transcription endpoint
pub const TRANSCRIPTION_API_URL: &str = "wss://api.openai.com/v1/realtime?intent=transcription";

/// Rate the transcription session expects for PCM16 input
pub const TRANSCRIPTION_SAMPLE_RATE: u32 = 24000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSessionConfig {
    pub input_audio_format: String,
    pub input_audio_transcription: TranscriptionModel,
    pub turn_detection: TurnDetection,
}

impl Default for TranscriptionSessionConfig {
    fn default() -> Self {
        Self {
            input_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionModel {
                model: "gpt-4o-transcribe".to_string(),
                language: Some("en".to_string()),
            },
            turn_detection: TurnDetection {
                detection_type: "server_vad".to_string(),
                silence_duration_ms: Some(600),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionModel {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Messages sent to the transcription session
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "transcription_session.update")]
    SessionUpdate { session: TranscriptionSessionConfig },

    /// Base64 PCM16 @ 24kHz
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },
}

impl ClientMessage {
    pub fn session_update() -> Self {
        Self::SessionUpdate {
            session: TranscriptionSessionConfig::default(),
        }
    }

    pub fn audio_append(samples: &[i16]) -> Self {
        Self::AudioAppend {
            audio: codec::encode_frame(&codec::pcm_to_bytes(samples)),
        }
    }
}

/// Messages received from the transcription session
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "transcription_session.created", alias = "session.created")]
    SessionCreated,

    #[serde(rename = "transcription_session.updated", alias = "session.updated")]
    SessionUpdated,

    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Interim text; never forwarded
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptDelta {
        #[serde(default)]
        delta: String,
    },

    /// Finalized text for one speech segment
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptCompleted { transcript: String },

    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// The finalized transcript, if this message carries one
    pub fn final_transcript(&self) -> Option<&str> {
        match self {
            ServerMessage::TranscriptCompleted { transcript } => {
                Some(transcript.trim()).filter(|t| !t.is_empty())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_update_serialization() {
        let json = serde_json::to_string(&ClientMessage::session_update()).unwrap();
        assert!(json.contains("\"type\":\"transcription_session.update\""));
        assert!(json.contains("\"input_audio_format\":\"pcm16\""));
        assert!(json.contains("\"type\":\"server_vad\""));
    }

    #[test]
    fn test_audio_append_serialization() {
        let json = serde_json::to_string(&ClientMessage::audio_append(&[0x1234])).unwrap();
        assert!(json.contains("\"type\":\"input_audio_buffer.append\""));
        assert!(json.contains("\"audio\":\"NBI=\""));
    }

    #[test]
    fn test_only_completed_transcripts_are_final() {
        let delta: ServerMessage = serde_json::from_str(
            r#"{"type":"conversation.item.input_audio_transcription.delta","delta":"yes I"}"#,
        )
        .unwrap();
        assert_eq!(delta.final_transcript(), None);

        let done: ServerMessage = serde_json::from_str(
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"i1","transcript":" yes I did "}"#,
        )
        .unwrap();
        assert_eq!(done.final_transcript(), Some("yes I did"));
    }

    #[test]
    fn test_session_created_alias_and_unknown() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"session.created","session":{"id":"s"}}"#).unwrap();
        assert!(matches!(msg, ServerMessage::SessionCreated));

        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"input_audio_buffer.speech_started"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown));
    }

    #[test]
    fn test_error_deserialization() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"invalid_api_key","message":"Invalid API key"}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Error { error } => {
                assert_eq!(error.message, "Invalid API key");
                assert_eq!(error.code.as_deref(), Some("invalid_api_key"));
            }
            _ => panic!("Expected Error"),
        }
    }
}
