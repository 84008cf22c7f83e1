//! Microphone capture via cpal
//!
//! The cpal stream is not `Send` on every backend, so it lives on a dedicated
//! thread for its whole life. The callback downmixes to mono and hands frames
//! to the async side with `try_send`; it never blocks.

use std::sync::mpsc as std_mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::{MediaError, MediaTrack};
use crate::streaming::AudioFrame;

/// Frames buffered between the device callback and the uplink
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// An open microphone
pub struct MicrophoneStream {
    pub track: MediaTrack,
    pub frames: mpsc::Receiver<AudioFrame>,
    pub sample_rate: u32,
}

/// Open the default input device.
pub async fn open_default() -> Result<MicrophoneStream, MediaError> {
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<u32, MediaError>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    thread::Builder::new()
        .name("microphone".to_string())
        .spawn(move || {
            let stream = match build_stream(frame_tx) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Blocks until stop() or the track is dropped
            let _ = stop_rx.recv();
            drop(stream);
            log::info!("Microphone stream closed");
        })
        .map_err(|e| MediaError::Device(format!("Failed to spawn microphone thread: {}", e)))?;

    let sample_rate = ready_rx
        .await
        .map_err(|_| MediaError::Device("Microphone thread exited".to_string()))??;

    let track = MediaTrack::new("microphone", move || {
        stop_tx
            .send(())
            .map_err(|_| MediaError::Device("Microphone thread already stopped".to_string()))
    });

    Ok(MicrophoneStream {
        track,
        frames: frame_rx,
        sample_rate,
    })
}

fn build_stream(frame_tx: mpsc::Sender<AudioFrame>) -> Result<(Stream, u32), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::NoDevice("microphone".to_string()))?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = device.default_input_config().map_err(map_config_error)?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    log::info!(
        "Audio input config: {} Hz, {} channels, {:?}",
        config.sample_rate.0,
        config.channels,
        sample_format
    );

    let stream = match sample_format {
        SampleFormat::I16 => build_typed::<i16>(&device, &config, frame_tx),
        SampleFormat::U16 => build_typed::<u16>(&device, &config, frame_tx),
        SampleFormat::F32 => build_typed::<f32>(&device, &config, frame_tx),
        other => Err(MediaError::Device(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| MediaError::Device(format!("Failed to start input stream: {}", e)))?;

    Ok((stream, config.sample_rate.0))
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
) -> Result<Stream, MediaError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let sample_rate = config.sample_rate.0;
    let err_fn = |err| log::error!("Audio input stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples = downmix(data, channels);
                // A full channel means the consumer is behind; drop the block
                let _ = frame_tx.try_send(AudioFrame::new(samples, sample_rate));
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

/// Average interleaved channels into one
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    use cpal::Sample;

    if channels <= 1 {
        return data.iter().map(|s| s.to_sample::<f32>()).collect();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32)
        .collect()
}

fn map_config_error(e: cpal::DefaultStreamConfigError) -> MediaError {
    match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            MediaError::NoDevice("microphone".to_string())
        }
        other => classify_backend_message(other.to_string()),
    }
}

fn map_build_error(e: cpal::BuildStreamError) -> MediaError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            MediaError::NoDevice("microphone".to_string())
        }
        other => classify_backend_message(other.to_string()),
    }
}

/// cpal reports OS permission refusals as backend-specific text
fn classify_backend_message(message: String) -> MediaError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        MediaError::Permission(format!("microphone ({})", message))
    } else {
        MediaError::Device(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[0.5f32, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn test_downmix_i16_mono() {
        let mono = downmix(&[0i16, i16::MIN], 1);
        assert_eq!(mono[0], 0.0);
        assert_eq!(mono[1], -1.0);
    }

    #[test]
    fn test_permission_message_classification() {
        assert!(classify_backend_message("Permission denied (os error 13)".to_string())
            .is_permission());
        assert!(!classify_backend_message("device busy".to_string()).is_permission());
    }

    #[tokio::test]
    #[ignore] // Requires audio hardware
    async fn test_open_default_microphone() {
        let mut mic = open_default().await.expect("microphone");
        assert!(mic.sample_rate > 0);
        assert!(mic.frames.recv().await.is_some());
        mic.track.stop().unwrap();
    }
}
