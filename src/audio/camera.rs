//! Fixed-duration camera clip recorder
//!
//! Recording is delegated to an `ffmpeg` child process writing WebM to
//! stdout. The clip length is enforced by ffmpeg itself (`-t`); the caller
//! only waits, bounded by clip length plus a grace period.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::MediaError;
use crate::settings::CameraSettings;

/// One recorded clip. Captured and uploaded at most once per session.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraClip {
    pub bytes: Vec<u8>,
    pub duration_ms: u64,
}

pub struct FfmpegCamera {
    settings: CameraSettings,
    grace: Duration,
}

impl FfmpegCamera {
    pub fn new(settings: CameraSettings, grace: Duration) -> Self {
        Self { settings, grace }
    }

    /// Open the capture device node to surface permission problems up front.
    ///
    /// Only meaningful for device-file inputs (`v4l2`); other input formats
    /// are checked when recording starts.
    pub fn check_access(&self) -> Result<(), MediaError> {
        if self.settings.input_format != "v4l2" {
            return Ok(());
        }
        match std::fs::File::open(&self.settings.device) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(
                MediaError::Permission(format!("camera {}", self.settings.device)),
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MediaError::NoDevice(format!("camera {}", self.settings.device)))
            }
            Err(e) => Err(MediaError::Device(e.to_string())),
        }
    }

    fn args(&self, duration: Duration) -> Vec<String> {
        let secs = format!("{:.3}", duration.as_secs_f64());
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            self.settings.input_format.as_str(),
            "-t",
            secs.as_str(),
            "-i",
            self.settings.device.as_str(),
            "-an",
            "-c:v",
            "libvpx",
            "-deadline",
            "realtime",
            "-f",
            "webm",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub async fn record(&self, duration: Duration) -> Result<CameraClip, MediaError> {
        let deadline = duration + self.grace;
        log::info!(
            "Recording {:?} camera clip from {}",
            duration,
            self.settings.device
        );

        let child = Command::new(&self.settings.ffmpeg_path)
            .args(self.args(duration))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    MediaError::NoDevice(format!("recorder ({})", self.settings.ffmpeg_path))
                }
                _ => MediaError::Recording(format!("Failed to start ffmpeg: {}", e)),
            })?;

        // Dropping the child on timeout kills ffmpeg
        let output = tokio::time::timeout(deadline, child.wait_with_output())
            .await
            .map_err(|_| MediaError::Timeout(deadline))?
            .map_err(|e| MediaError::Recording(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_ffmpeg_failure(&stderr));
        }
        if output.stdout.is_empty() {
            return Err(MediaError::Recording("ffmpeg produced no video".to_string()));
        }

        log::info!("Camera clip recorded ({} bytes)", output.stdout.len());
        Ok(CameraClip {
            bytes: output.stdout,
            duration_ms: duration.as_millis() as u64,
        })
    }
}

fn classify_ffmpeg_failure(stderr: &str) -> MediaError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") || lower.contains("not authorized") {
        MediaError::Permission(format!("camera ({})", stderr))
    } else if lower.contains("no such file or directory") {
        MediaError::NoDevice("camera".to_string())
    } else {
        MediaError::Recording(stderr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(device: &str, ffmpeg: &str) -> FfmpegCamera {
        FfmpegCamera::new(
            CameraSettings {
                device: device.to_string(),
                input_format: "v4l2".to_string(),
                ffmpeg_path: ffmpeg.to_string(),
            },
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_args_limit_duration() {
        let args = camera("/dev/video2", "ffmpeg").args(Duration::from_millis(10_000));
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "10.000");
        assert!(args.contains(&"/dev/video2".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_missing_device_is_no_device() {
        let err = camera("/nonexistent/video9", "ffmpeg").check_access().unwrap_err();
        assert!(matches!(err, MediaError::NoDevice(_)));
    }

    #[test]
    fn test_ffmpeg_failure_classification() {
        assert!(classify_ffmpeg_failure("/dev/video0: Permission denied").is_permission());
        assert!(matches!(
            classify_ffmpeg_failure("/dev/video0: No such file or directory"),
            MediaError::NoDevice(_)
        ));
        assert!(matches!(
            classify_ffmpeg_failure("Unknown encoder"),
            MediaError::Recording(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_recorder_binary() {
        let err = camera("/dev/video0", "/nonexistent/ffmpeg-binary")
            .record(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NoDevice(_)));
    }
}
