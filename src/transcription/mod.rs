//! Continuous speech recognition of the user's answers
//!
//! A recognizer consumes the raw microphone tee and emits only finalized
//! transcripts. Interim text never leaves the recognizer.

mod protocol;
mod realtime;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::streaming::AudioFrame;

pub use realtime::{get_api_key, RealtimeRecognizer};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecognitionError {
    /// No recognizer can run here (missing credentials, no backend)
    #[error("Speech recognition unavailable: {0}")]
    Unavailable(String),
    #[error("Speech recognition connection failed: {0}")]
    ConnectionFailed(String),
}

/// A running recognizer
pub struct RecognizerHandle {
    pub transcripts: mpsc::Receiver<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl RecognizerHandle {
    pub fn new(transcripts: mpsc::Receiver<String>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { transcripts, tasks }
    }

    /// Stop recognition. Idempotent.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RecognizerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Start recognizing `audio`. Finalized transcripts arrive on the handle.
    async fn start(
        &self,
        audio: mpsc::Receiver<AudioFrame>,
    ) -> Result<RecognizerHandle, RecognitionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_aborts_tasks() {
        let (_tx, rx) = mpsc::channel::<String>(1);
        let task = tokio::spawn(std::future::pending::<()>());
        let mut handle = RecognizerHandle::new(rx, vec![task]);
        handle.stop();
        handle.stop();
        assert!(handle.tasks.is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = RecognitionError::Unavailable("OPENAI_API_KEY not set".to_string());
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
