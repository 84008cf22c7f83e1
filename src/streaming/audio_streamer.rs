//! Microphone uplink pump
//!
//! Bridges the microphone callback (sync, device thread) to the agent link
//! (async). Each block is resampled to the wire rate, quantized, and sent in
//! fixed-size chunks.
//!
//! # Architecture
//!
//! ```text
//! Device Thread (sync)             Tokio Runtime (async)
//! ┌──────────────────┐             ┌──────────────────────────┐
//! │ cpal callback    │──channel──▶ │ AudioStreamer::run()     │
//! │ try_send(frame)  │             │   ├─ tee to recognizer   │
//! └──────────────────┘             │   ├─ resample (16kHz)    │
//!                                  │   ├─ quantize + chunk    │
//!                                  │   └─ ClientFrame::audio  │
//!                                  └──────────────────────────┘
//! ```

use tokio::sync::mpsc;

use super::codec::{self, AudioFrame};
use super::protocol::ClientFrame;
use super::StreamingError;

/// Configuration for the uplink
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Rate the agent expects (16kHz)
    pub wire_sample_rate: u32,
    /// Chunk duration in milliseconds
    pub chunk_duration_ms: u32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            wire_sample_rate: 16000,
            chunk_duration_ms: 100,
        }
    }
}

impl StreamerConfig {
    /// Samples per chunk at the wire rate
    pub fn samples_per_chunk(&self) -> usize {
        ((self.wire_sample_rate * self.chunk_duration_ms / 1000) as usize).max(1)
    }
}

/// Streams microphone frames to the agent
pub struct AudioStreamer {
    config: StreamerConfig,
    rx: mpsc::Receiver<AudioFrame>,
    outbound: mpsc::Sender<ClientFrame>,
    /// Raw frames for the speech recognizer, if one is running
    recognizer_tee: Option<mpsc::Sender<AudioFrame>>,
    /// Accumulator of wire-rate PCM16 samples
    buffer: Vec<i16>,
    samples_per_chunk: usize,
    chunks_sent: u64,
    tee_dropped: u64,
}

impl AudioStreamer {
    pub fn new(
        rx: mpsc::Receiver<AudioFrame>,
        outbound: mpsc::Sender<ClientFrame>,
        config: StreamerConfig,
    ) -> Self {
        let samples_per_chunk = config.samples_per_chunk();
        log::info!(
            "AudioStreamer: initialized (→ {}Hz, {}ms chunks = {} samples)",
            config.wire_sample_rate,
            config.chunk_duration_ms,
            samples_per_chunk
        );

        Self {
            config,
            rx,
            outbound,
            recognizer_tee: None,
            buffer: Vec::with_capacity(samples_per_chunk * 2),
            samples_per_chunk,
            chunks_sent: 0,
            tee_dropped: 0,
        }
    }

    /// Also forward every raw frame to the speech recognizer
    pub fn with_recognizer_tee(mut self, tee: mpsc::Sender<AudioFrame>) -> Self {
        self.recognizer_tee = Some(tee);
        self
    }

    /// Run until the microphone channel closes or the link goes away.
    ///
    /// Returns the number of chunks sent.
    pub async fn run(mut self) -> Result<u64, StreamingError> {
        log::info!("AudioStreamer: starting uplink loop");

        while let Some(frame) = self.rx.recv().await {
            self.process_frame(frame).await?;
        }

        if !self.buffer.is_empty() {
            log::debug!(
                "AudioStreamer: sending final partial chunk ({} samples)",
                self.buffer.len()
            );
            self.send_chunk().await?;
        }

        log::info!(
            "AudioStreamer: uplink complete, {} chunks sent ({} recognizer frames dropped)",
            self.chunks_sent,
            self.tee_dropped
        );

        Ok(self.chunks_sent)
    }

    async fn process_frame(&mut self, frame: AudioFrame) -> Result<(), StreamingError> {
        if let Some(tee) = &self.recognizer_tee {
            // Never block the uplink on a slow recognizer
            match tee.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => self.tee_dropped += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("AudioStreamer: recognizer gone, tee detached");
                    self.recognizer_tee = None;
                }
            }
        }

        let resampled = codec::resample(
            &frame.samples,
            frame.sample_rate,
            self.config.wire_sample_rate,
        );
        self.buffer.extend(codec::float_to_quantized(&resampled));

        while self.buffer.len() >= self.samples_per_chunk {
            self.send_chunk().await?;
        }

        Ok(())
    }

    async fn send_chunk(&mut self) -> Result<(), StreamingError> {
        let chunk_size = self.buffer.len().min(self.samples_per_chunk);
        let chunk: Vec<i16> = self.buffer.drain(..chunk_size).collect();

        self.outbound
            .send(ClientFrame::audio(&chunk))
            .await
            .map_err(|e| StreamingError::SendFailed(e.to_string()))?;

        self.chunks_sent += 1;

        // Periodic logging (every 50 chunks = ~5 seconds)
        if self.chunks_sent % 50 == 0 {
            log::debug!("AudioStreamer: sent {} chunks", self.chunks_sent);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::AudioData;

    fn decoded_len(frame: &ClientFrame) -> usize {
        match frame {
            ClientFrame::Audio {
                audio: AudioData { data },
            } => codec::bytes_to_pcm(&codec::decode_frame(data).unwrap())
                .unwrap()
                .len(),
            ClientFrame::Text { .. } => panic!("unexpected text frame"),
        }
    }

    #[test]
    fn test_samples_per_chunk() {
        assert_eq!(StreamerConfig::default().samples_per_chunk(), 1600);

        let config = StreamerConfig {
            wire_sample_rate: 16000,
            chunk_duration_ms: 50,
        };
        assert_eq!(config.samples_per_chunk(), 800);
    }

    #[tokio::test]
    async fn test_uplink_resamples_and_chunks() {
        let (mic_tx, mic_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let streamer = AudioStreamer::new(mic_rx, out_tx, StreamerConfig::default());
        let handle = tokio::spawn(streamer.run());

        // 150ms at 48kHz → 2400 samples at 16kHz → one full chunk + partial
        mic_tx
            .send(AudioFrame::new(vec![0.1; 7200], 48000))
            .await
            .unwrap();
        drop(mic_tx);

        let sent = handle.await.unwrap().unwrap();
        assert_eq!(sent, 2);
        assert_eq!(decoded_len(&out_rx.recv().await.unwrap()), 1600);
        assert_eq!(decoded_len(&out_rx.recv().await.unwrap()), 800);
    }

    #[tokio::test]
    async fn test_recognizer_tee_gets_raw_frames() {
        let (mic_tx, mic_rx) = mpsc::channel(16);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (tee_tx, mut tee_rx) = mpsc::channel(16);

        let streamer = AudioStreamer::new(mic_rx, out_tx, StreamerConfig::default())
            .with_recognizer_tee(tee_tx);
        let handle = tokio::spawn(streamer.run());

        mic_tx
            .send(AudioFrame::new(vec![0.0; 480], 48000))
            .await
            .unwrap();
        drop(mic_tx);
        handle.await.unwrap().unwrap();

        let teed = tee_rx.recv().await.unwrap();
        assert_eq!(teed.sample_rate, 48000);
        assert_eq!(teed.samples.len(), 480);
    }

    #[tokio::test]
    async fn test_uplink_survives_missing_recognizer() {
        let (mic_tx, mic_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (tee_tx, tee_rx) = mpsc::channel(1);
        drop(tee_rx);

        let streamer = AudioStreamer::new(mic_rx, out_tx, StreamerConfig::default())
            .with_recognizer_tee(tee_tx);
        let handle = tokio::spawn(streamer.run());

        for _ in 0..3 {
            mic_tx
                .send(AudioFrame::new(vec![0.0; 1600], 16000))
                .await
                .unwrap();
        }
        drop(mic_tx);

        assert_eq!(handle.await.unwrap().unwrap(), 3);
        for _ in 0..3 {
            assert_eq!(decoded_len(&out_rx.recv().await.unwrap()), 1600);
        }
    }

    #[tokio::test]
    async fn test_closed_link_is_send_error() {
        let (mic_tx, mic_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        drop(out_rx);

        let streamer = AudioStreamer::new(mic_rx, out_tx, StreamerConfig::default());
        mic_tx
            .send(AudioFrame::new(vec![0.0; 1600], 16000))
            .await
            .unwrap();
        drop(mic_tx);

        assert!(matches!(
            streamer.run().await,
            Err(StreamingError::SendFailed(_))
        ));
    }
}
