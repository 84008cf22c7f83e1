//! Playback Queue and speaker sink
//!
//! Agent utterances arrive as a burst of decoded frames. The queue plays them
//! strictly one at a time: a frame is handed to the sink only after the
//! previous one has finished, so playback may gap but never overlaps.
//!
//! ```text
//! inbound pump ──enqueue──▶ unbounded FIFO ──▶ consumer task ──play().await──▶ AudioSink
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::MediaError;
use crate::streaming::{codec, AudioFrame};

/// Something that can make a frame audible
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play one frame. Resolves once the frame has finished playing.
    async fn play(&self, frame: AudioFrame) -> Result<(), MediaError>;

    /// Silence output and release the device
    fn stop(&self);
}

/// Cloneable producer side of a `PlaybackQueue`
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<AudioFrame>,
    pending: Arc<AtomicUsize>,
}

impl PlaybackHandle {
    /// Queue a frame. Returns false once the queue has been stopped.
    pub fn enqueue(&self, frame: AudioFrame) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(frame).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Frames queued or playing
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Single-consumer FIFO in front of an `AudioSink`
pub struct PlaybackQueue {
    handle: PlaybackHandle,
    sink: Arc<dyn AudioSink>,
    task: Option<JoinHandle<()>>,
}

impl PlaybackQueue {
    pub fn start(sink: Arc<dyn AudioSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AudioFrame>();
        let pending = Arc::new(AtomicUsize::new(0));

        let consumer_sink = sink.clone();
        let consumer_pending = pending.clone();
        let task = tokio::spawn(async move {
            let mut frames_played: u64 = 0;
            while let Some(frame) = rx.recv().await {
                if let Err(e) = consumer_sink.play(frame).await {
                    log::warn!("Playback failed: {}", e);
                }
                consumer_pending.fetch_sub(1, Ordering::SeqCst);
                frames_played += 1;
                if frames_played % 100 == 0 {
                    log::debug!("Playback: {} frames played", frames_played);
                }
            }
            log::debug!("Playback consumer exiting after {} frames", frames_played);
        });

        Self {
            handle: PlaybackHandle { tx, pending },
            sink,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> PlaybackHandle {
        self.handle.clone()
    }

    pub fn enqueue(&self, frame: AudioFrame) -> bool {
        self.handle.enqueue(frame)
    }

    pub fn pending(&self) -> usize {
        self.handle.pending()
    }

    /// Drop everything queued and silence the sink. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.sink.stop();
            log::info!("Playback stopped ({} frames discarded)", self.pending());
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

type SampleBuffer = Arc<Mutex<VecDeque<f32>>>;

/// Default output device through cpal.
///
/// Opens the device at the wire output rate when it supports it. Otherwise
/// the device's default rate is used and frames are converted on the way in.
pub struct CpalSink {
    buffer: SampleBuffer,
    device_rate: u32,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl CpalSink {
    pub async fn open_default(preferred_rate: u32) -> Result<Self, MediaError> {
        let buffer: SampleBuffer = Arc::new(Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32, MediaError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let stream_buffer = buffer.clone();
        thread::Builder::new()
            .name("speaker".to_string())
            .spawn(move || {
                let stream = match build_output(stream_buffer, preferred_rate) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
                log::info!("Speaker stream closed");
            })
            .map_err(|e| MediaError::Device(format!("Failed to spawn speaker thread: {}", e)))?;

        let device_rate = ready_rx
            .await
            .map_err(|_| MediaError::Device("Speaker thread exited".to_string()))??;

        Ok(Self {
            buffer,
            device_rate,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, frame: AudioFrame) -> Result<(), MediaError> {
        let samples = if frame.sample_rate == self.device_rate {
            frame.samples
        } else {
            codec::resample(&frame.samples, frame.sample_rate, self.device_rate)
        };
        let duration = Duration::from_millis(
            samples.len() as u64 * 1000 / self.device_rate.max(1) as u64,
        );

        {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|e| MediaError::Device(e.to_string()))?;
            buffer.extend(samples);
        }

        tokio::time::sleep(duration).await;
        while self.buffered() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.clear();
        }
        if let Ok(mut stop_tx) = self.stop_tx.lock() {
            if let Some(tx) = stop_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

fn build_output(buffer: SampleBuffer, preferred_rate: u32) -> Result<(Stream, u32), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| MediaError::NoDevice("speaker".to_string()))?;

    log::info!("Using audio output device: {:?}", device.name());

    let default = device
        .default_output_config()
        .map_err(|e| MediaError::Device(e.to_string()))?;
    let sample_format = default.sample_format();
    let mut config: StreamConfig = default.into();

    let preferred = cpal::SampleRate(preferred_rate);
    let supports_preferred = device
        .supported_output_configs()
        .map(|mut configs| {
            configs.any(|c| {
                c.sample_format() == sample_format
                    && c.min_sample_rate() <= preferred
                    && c.max_sample_rate() >= preferred
            })
        })
        .unwrap_or(false);
    if supports_preferred {
        config.sample_rate = preferred;
    } else {
        log::info!(
            "Output device does not support {} Hz, using {} Hz",
            preferred_rate,
            config.sample_rate.0
        );
    }

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, buffer),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, buffer),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, buffer),
        other => Err(MediaError::Device(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| MediaError::Device(format!("Failed to start output stream: {}", e)))?;

    Ok((stream, config.sample_rate.0))
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    buffer: SampleBuffer,
) -> Result<Stream, MediaError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err| log::error!("Audio output stream error: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // try_lock: never block the device thread
                let mut source = buffer.try_lock().ok();
                for frame in data.chunks_mut(channels) {
                    let value = source
                        .as_mut()
                        .and_then(|b| b.pop_front())
                        .unwrap_or(0.0);
                    let sample = T::from_sample(value);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| MediaError::Device(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::Instant;

    /// Records play intervals and fails the test on overlap
    struct RecordingSink {
        playing: AtomicUsize,
        log: AsyncMutex<Vec<(f32, Instant, Instant)>>,
        stopped: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                playing: AtomicUsize::new(0),
                log: AsyncMutex::new(Vec::new()),
                stopped: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, frame: AudioFrame) -> Result<(), MediaError> {
            let concurrent = self.playing.fetch_add(1, Ordering::SeqCst);
            assert_eq!(concurrent, 0, "frames overlapped");
            let started = Instant::now();
            tokio::time::sleep(Duration::from_millis(frame.duration_ms())).await;
            self.playing.fetch_sub(1, Ordering::SeqCst);
            self.log
                .lock()
                .await
                .push((frame.samples[0], started, Instant::now()));
            Ok(())
        }

        fn stop(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame(marker: f32, ms: usize) -> AudioFrame {
        AudioFrame::new(vec![marker; ms * 24], 24000)
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_play_in_order_without_overlap() {
        let sink = RecordingSink::new();
        let queue = PlaybackQueue::start(sink.clone());
        let handle = queue.handle();

        for (i, ms) in [40usize, 10, 25, 5].iter().enumerate() {
            assert!(handle.enqueue(frame(i as f32, *ms)));
        }
        assert_eq!(queue.pending(), 4);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.pending(), 0);

        let log = sink.log.lock().await;
        let order: Vec<f32> = log.iter().map(|(m, _, _)| *m).collect();
        assert_eq!(order, vec![0.0, 1.0, 2.0, 3.0]);
        for pair in log.windows(2) {
            assert!(pair[1].1 >= pair[0].2, "next frame started before previous ended");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_and_is_idempotent() {
        let sink = RecordingSink::new();
        let mut queue = PlaybackQueue::start(sink.clone());
        let handle = queue.handle();
        handle.enqueue(frame(1.0, 100));
        handle.enqueue(frame(2.0, 100));

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.stop();
        queue.stop();
        assert_eq!(sink.stopped.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(sink.log.lock().await.is_empty());
        assert!(!handle.enqueue(frame(3.0, 10)));
    }

    #[tokio::test]
    #[ignore] // Requires audio hardware
    async fn test_open_default_speaker() {
        let sink = CpalSink::open_default(24000).await.expect("speaker");
        assert!(sink.device_rate > 0);
        sink.play(frame(0.0, 20)).await.unwrap();
        sink.stop();
        sink.stop();
    }
}
