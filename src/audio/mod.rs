//! Local media: microphone, camera clip and speaker output
//!
//! Hardware is reached through `MediaDevices` so the session can run against
//! fakes. `SystemDevices` is the real implementation (cpal for audio, an
//! ffmpeg child process for the camera).

pub mod camera;
pub mod microphone;
pub mod playback;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::settings::CameraSettings;

pub use camera::{CameraClip, FfmpegCamera};
pub use microphone::MicrophoneStream;
pub use playback::{AudioSink, CpalSink, PlaybackHandle, PlaybackQueue};

/// Errors from local media devices
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MediaError {
    #[error("Permission denied for {0}")]
    Permission(String),
    #[error("No {0} device found")]
    NoDevice(String),
    #[error("Media device error: {0}")]
    Device(String),
    #[error("Recording did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Recording failed: {0}")]
    Recording(String),
}

impl MediaError {
    pub fn is_permission(&self) -> bool {
        matches!(self, MediaError::Permission(_))
    }
}

type StopFn = Box<dyn FnOnce() -> Result<(), MediaError> + Send>;

/// A live capture track. Stopping is idempotent; dropping stops it.
pub struct MediaTrack {
    label: String,
    stop: Option<StopFn>,
}

impl MediaTrack {
    pub fn new(
        label: impl Into<String>,
        stop: impl FnOnce() -> Result<(), MediaError> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            stop: Some(Box::new(stop)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_live(&self) -> bool {
        self.stop.is_some()
    }

    pub fn stop(&mut self) -> Result<(), MediaError> {
        match self.stop.take() {
            Some(stop) => {
                log::debug!("Stopping track: {}", self.label);
                stop()
            }
            None => Ok(()),
        }
    }
}

impl Drop for MediaTrack {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Failed to stop track {} on drop: {}", self.label, e);
        }
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("label", &self.label)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Access to capture and playback hardware
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the default microphone as a stream of mono frames
    async fn open_microphone(&self) -> Result<MicrophoneStream, MediaError>;

    /// Verify the camera can be opened, without recording
    async fn check_camera(&self) -> Result<(), MediaError>;

    /// Record one clip of `duration`. Timer-driven; resolves when done.
    async fn record_clip(&self, duration: Duration) -> Result<CameraClip, MediaError>;

    /// Open the default speaker for frames at `sample_rate`
    async fn open_speaker(&self, sample_rate: u32) -> Result<Arc<dyn AudioSink>, MediaError>;
}

/// Real hardware
pub struct SystemDevices {
    camera: FfmpegCamera,
}

impl SystemDevices {
    pub fn new(camera: CameraSettings, camera_grace: Duration) -> Self {
        Self {
            camera: FfmpegCamera::new(camera, camera_grace),
        }
    }
}

#[async_trait]
impl MediaDevices for SystemDevices {
    async fn open_microphone(&self) -> Result<MicrophoneStream, MediaError> {
        microphone::open_default().await
    }

    async fn check_camera(&self) -> Result<(), MediaError> {
        self.camera.check_access()
    }

    async fn record_clip(&self, duration: Duration) -> Result<CameraClip, MediaError> {
        self.camera.record(duration).await
    }

    async fn open_speaker(&self, sample_rate: u32) -> Result<Arc<dyn AudioSink>, MediaError> {
        Ok(Arc::new(CpalSink::open_default(sample_rate).await?))
    }
}
