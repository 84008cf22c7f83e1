//! OpenAI Realtime transcription client
//!
//! Streams the microphone tee to a transcription-only realtime session and
//! forwards finalized transcripts. One connection attempt per session; a
//! mid-session disconnect simply ends the transcript stream.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};

use super::protocol::{ClientMessage, ServerMessage, TRANSCRIPTION_API_URL, TRANSCRIPTION_SAMPLE_RATE};
use super::{RecognitionError, RecognizerHandle, SpeechRecognizer};
use crate::streaming::{codec, AudioFrame};

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for the session to be created
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RealtimeRecognizer {
    api_key: Option<String>,
    url: String,
}

impl RealtimeRecognizer {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            url: TRANSCRIPTION_API_URL.to_string(),
        }
    }

    /// Uses `OPENAI_API_KEY` from the environment
    pub fn from_env() -> Self {
        Self::new(get_api_key())
    }
}

#[async_trait]
impl SpeechRecognizer for RealtimeRecognizer {
    async fn start(
        &self,
        mut audio: mpsc::Receiver<AudioFrame>,
    ) -> Result<RecognizerHandle, RecognitionError> {
        let api_key = self.api_key.as_deref().ok_or(RecognitionError::Unavailable(
            "OPENAI_API_KEY not set".to_string(),
        ))?;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RecognitionError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| RecognitionError::ConnectionFailed(e.to_string()))?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        log::info!("Connecting to realtime transcription...");

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| RecognitionError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| RecognitionError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        timeout(SESSION_TIMEOUT, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::SessionCreated) => return Ok(()),
                        Ok(ServerMessage::Error { error }) => {
                            return Err(RecognitionError::ConnectionFailed(error.message))
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("Failed to parse message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        return Err(RecognitionError::ConnectionFailed(
                            "Connection closed before session created".to_string(),
                        ))
                    }
                    Err(e) => return Err(RecognitionError::ConnectionFailed(e.to_string())),
                    _ => {}
                }
            }
            Err(RecognitionError::ConnectionFailed("Stream ended".to_string()))
        })
        .await
        .map_err(|_| RecognitionError::ConnectionFailed("Session creation timeout".to_string()))??;

        let update = serde_json::to_string(&ClientMessage::session_update())
            .map_err(|e| RecognitionError::ConnectionFailed(e.to_string()))?;
        write
            .send(Message::Text(update))
            .await
            .map_err(|e| RecognitionError::ConnectionFailed(e.to_string()))?;

        log::info!("Realtime transcription session ready");

        let sender = tokio::spawn(async move {
            let mut chunks: u64 = 0;
            while let Some(frame) = audio.recv().await {
                let resampled =
                    codec::resample(&frame.samples, frame.sample_rate, TRANSCRIPTION_SAMPLE_RATE);
                let pcm = codec::float_to_quantized(&resampled);
                let msg = match serde_json::to_string(&ClientMessage::audio_append(&pcm)) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("Failed to serialize audio: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(msg)).await {
                    log::warn!("Transcription send failed: {}", e);
                    break;
                }
                chunks += 1;
                if chunks % 100 == 0 {
                    log::debug!("Recognizer: sent {} chunks", chunks);
                }
            }
            let _ = write.close().await;
            log::debug!("Recognizer sender exiting");
        });

        let (transcript_tx, transcript_rx) = mpsc::channel(32);
        let receiver = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if let Some(transcript) = msg.final_transcript() {
                                log::debug!("Final transcript: {} chars", transcript.len());
                                if transcript_tx.send(transcript.to_string()).await.is_err() {
                                    break;
                                }
                            } else if let ServerMessage::Error { error } = &msg {
                                log::warn!("Transcription error: {}", error.message);
                            }
                        }
                        Err(e) => log::warn!("Failed to parse message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        log::info!("Transcription socket closed by server");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Transcription socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            log::debug!("Recognizer receiver exiting");
        });

        Ok(RecognizerHandle::new(transcript_rx, vec![sender, receiver]))
    }
}

/// Get the OpenAI API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}
