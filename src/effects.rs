//! Effect runner for check-in sessions
//!
//! Executes the effects produced by the state machine. Every completion is
//! reported back as an `Event`; nothing here touches `SessionState`.
//!
//! Resources opened by effects are parked in `LiveResources` so that the
//! single `Teardown` effect can release them in a fixed order.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{MediaDevices, MediaTrack, PlaybackQueue};
use crate::backend::{CheckinAnalysis, CheckinApi, CompleteRequest, ScreeningRequest};
use crate::settings::AppSettings;
use crate::state_machine::{Effect, Event, FinalizeRequest, ServerTriage, SessionOutcome};
use crate::streaming::{
    AgentConnection, AgentConnector, AgentEvent, AudioFrame, AudioStreamer, ClientFrame,
    StreamerConfig,
};
use crate::transcription::SpeechRecognizer;
use crate::triage::{
    classify, BaselineStore, FacialSignalResult, MetricObservation, TriageInput,
    METRIC_FACIAL_SYMMETRY, METRIC_HEART_RATE,
};

/// Raw frames buffered for the recognizer
const RECOGNIZER_TEE_CAPACITY: usize = 64;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// External collaborators of a live session
#[derive(Clone)]
pub struct Collaborators {
    pub devices: Arc<dyn MediaDevices>,
    pub agent: Arc<dyn AgentConnector>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub backend: Arc<dyn CheckinApi>,
    pub baselines: Arc<dyn BaselineStore>,
}

/// What the camera task learned
#[derive(Debug, Clone)]
struct CameraReport {
    facial: FacialSignalResult,
    heart_rate_bpm: Option<f64>,
}

impl CameraReport {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            facial: FacialSignalResult::error(reason),
            heart_rate_bpm: None,
        }
    }

    fn from_analysis(analysis: CheckinAnalysis) -> Self {
        let facial = analysis
            .facial_symmetry
            .map(|f| f.to_signal())
            .unwrap_or_else(|| FacialSignalResult::missing("No facial analysis returned"));
        Self {
            facial,
            heart_rate_bpm: analysis.heart_rate.and_then(|hr| hr.usable_bpm()),
        }
    }
}

/// Everything a session has opened that teardown must release
#[derive(Default)]
struct LiveResources {
    released: bool,
    mic_track: Option<MediaTrack>,
    mic_frames: Option<mpsc::Receiver<AudioFrame>>,
    outbound: Option<mpsc::Sender<ClientFrame>>,
    inbound: Option<mpsc::Receiver<AgentEvent>>,
    connection: Option<AgentConnection>,
    playback: Option<PlaybackQueue>,
    /// Uplink, inbound and recognizer pumps
    pumps: Vec<JoinHandle<()>>,
    camera: Option<JoinHandle<CameraReport>>,
    finalize: Option<JoinHandle<()>>,
    /// Cancels the completion poll and the camera clip
    cancel: CancellationToken,
}

/// Runs effects against real (or injected) devices and services
pub struct LiveEffectRunner {
    collab: Collaborators,
    settings: Arc<AppSettings>,
    resources: Arc<Mutex<LiveResources>>,
}

impl LiveEffectRunner {
    pub fn new(collab: Collaborators, settings: AppSettings) -> Arc<Self> {
        Arc::new(Self {
            collab,
            settings: Arc::new(settings),
            resources: Arc::new(Mutex::new(LiveResources::default())),
        })
    }
}

impl EffectRunner for LiveEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::AcquireMedia { id } => {
                let devices = self.collab.devices.clone();
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    let event = match acquire_media(devices.as_ref()).await {
                        Ok((mut track, frames)) => {
                            let mut res = resources.lock().await;
                            if res.released {
                                log::info!("Media acquired after teardown, releasing");
                                let _ = track.stop();
                                return;
                            }
                            res.mic_track = Some(track);
                            res.mic_frames = Some(frames);
                            Event::MediaReady { id }
                        }
                        Err(e) => {
                            log::error!("Media acquisition failed: {}", e);
                            Event::MediaDenied {
                                id,
                                err: e.to_string(),
                            }
                        }
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::StartCamera { id, checkin_id } => {
                let devices = self.collab.devices.clone();
                let backend = self.collab.backend.clone();
                let settings = self.settings.clone();
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    let mut res = resources.lock().await;
                    if res.released {
                        return;
                    }
                    let cancel = res.cancel.clone();
                    let handle = tokio::spawn(async move {
                        let report = tokio::select! {
                            _ = cancel.cancelled() => {
                                log::info!("Camera clip cancelled");
                                CameraReport {
                                    facial: FacialSignalResult::missing("Session ended before the clip finished"),
                                    heart_rate_bpm: None,
                                }
                            }
                            report = record_and_upload(
                                devices.as_ref(),
                                backend.as_ref(),
                                &checkin_id,
                                &settings,
                            ) => report,
                        };
                        let _ = tx
                            .send(Event::CameraDone {
                                id,
                                facial: report.facial.clone(),
                            })
                            .await;
                        report
                    });
                    res.camera = Some(handle);
                });
            }

            Effect::ConnectAgent { id } => {
                let agent = self.collab.agent.clone();
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    let event = match agent.connect().await {
                        Ok(link) => {
                            let mut res = resources.lock().await;
                            if res.released {
                                log::info!("Agent connected after teardown, closing");
                                drop(res);
                                drop(link.outbound);
                                link.connection.close().await;
                                return;
                            }
                            res.outbound = Some(link.outbound);
                            res.inbound = Some(link.inbound);
                            res.connection = Some(link.connection);
                            log::info!("Agent connected");
                            Event::AgentConnected {
                                id,
                                at: Instant::now(),
                            }
                        }
                        Err(e) => {
                            log::error!("Agent connection failed: {}", e);
                            Event::AgentConnectFailed {
                                id,
                                err: e.to_string(),
                            }
                        }
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::StartConversation { id } => {
                let collab = self.collab.clone();
                let settings = self.settings.clone();
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    start_conversation(id, collab, settings, resources, tx).await;
                });
            }

            Effect::StartCompletionPoll { id, interval } => {
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    let cancel = {
                        let res = resources.lock().await;
                        if res.released {
                            return;
                        }
                        res.cancel.clone()
                    };
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    log::debug!("Completion poll started ({:?})", interval);
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                if tx.send(Event::Tick { id, now: Instant::now() }).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    log::debug!("Completion poll stopped");
                });
            }

            Effect::SendAgentText { id, text } => {
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    let outbound = resources.lock().await.outbound.clone();
                    let result = match outbound {
                        Some(outbound) => outbound
                            .send(ClientFrame::text(text))
                            .await
                            .map_err(|_| "agent link closed".to_string()),
                        None => Err("agent not connected".to_string()),
                    };
                    if let Err(e) = result {
                        let _ = tx
                            .send(Event::Warning {
                                id,
                                message: format!("Could not send closing request: {}", e),
                            })
                            .await;
                    }
                });
            }

            Effect::Finalize { id, request } => {
                let collab = self.collab.clone();
                let settings = self.settings.clone();
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    let mut res = resources.lock().await;
                    let camera = res.camera.take();
                    let handle = tokio::spawn(async move {
                        let (outcome, warnings) = finalize(&collab, &settings, camera, request).await;
                        for message in warnings {
                            let _ = tx.send(Event::Warning { id, message }).await;
                        }
                        let _ = tx
                            .send(Event::Finalized {
                                id,
                                outcome: Arc::new(outcome),
                            })
                            .await;
                    });
                    res.finalize = Some(handle);
                });
            }

            Effect::Teardown { id } => {
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    teardown(&resources).await;
                    let _ = tx.send(Event::ResourcesReleased { id }).await;
                });
            }
        }
    }
}

/// Open the microphone and make sure the camera is usable.
///
/// The microphone is released again when the camera check fails.
async fn acquire_media(
    devices: &dyn MediaDevices,
) -> Result<(MediaTrack, mpsc::Receiver<AudioFrame>), crate::audio::MediaError> {
    let mic = devices.open_microphone().await?;
    let mut track = mic.track;
    if let Err(e) = devices.check_camera().await {
        let _ = track.stop();
        return Err(e);
    }
    log::info!("Microphone open at {}Hz, camera available", mic.sample_rate);
    Ok((track, mic.frames))
}

/// Record the clip and upload it exactly once.
async fn record_and_upload(
    devices: &dyn MediaDevices,
    backend: &dyn CheckinApi,
    checkin_id: &str,
    settings: &AppSettings,
) -> CameraReport {
    let timing = &settings.timing;
    let clip = match timeout(timing.camera_deadline(), devices.record_clip(timing.camera_clip())).await {
        Ok(Ok(clip)) => clip,
        Ok(Err(e)) => {
            log::warn!("Camera recording failed: {}", e);
            return CameraReport::failed(format!("Camera recording failed: {}", e));
        }
        Err(_) => {
            log::warn!("Camera recording exceeded {:?}", timing.camera_deadline());
            return CameraReport::failed("Camera recording timed out");
        }
    };

    let analysis = match backend.upload_clip(checkin_id, &clip).await {
        Ok(analysis) => analysis,
        Err(e) => {
            log::warn!("Clip upload failed: {}", e);
            return CameraReport::failed(format!("Clip upload failed: {}", e));
        }
    };
    log::info!("Camera clip uploaded ({} bytes)", clip.bytes.len());

    if analysis.facial_symmetry.is_some() {
        return CameraReport::from_analysis(analysis);
    }

    // Analyzer results may land on the check-in after the upload returns
    match backend.fetch_checkin(checkin_id).await {
        Ok(detail) => CameraReport::from_analysis(CheckinAnalysis {
            facial_symmetry: detail.facial_symmetry,
            heart_rate: detail.heart_rate.or(analysis.heart_rate),
        }),
        Err(e) => {
            log::warn!("Check-in fetch failed: {}", e);
            CameraReport::from_analysis(analysis)
        }
    }
}

async fn start_conversation(
    id: Uuid,
    collab: Collaborators,
    settings: Arc<AppSettings>,
    resources: Arc<Mutex<LiveResources>>,
    tx: mpsc::Sender<Event>,
) {
    let (frames, inbound, outbound) = {
        let mut res = resources.lock().await;
        if res.released {
            return;
        }
        match (res.mic_frames.take(), res.inbound.take(), res.outbound.clone()) {
            (Some(frames), Some(inbound), Some(outbound)) => (frames, inbound, outbound),
            _ => {
                log::error!("Conversation started without microphone or agent link");
                return;
            }
        }
    };

    let audio = &settings.audio;
    let playback = match collab.devices.open_speaker(audio.wire_output_rate).await {
        Ok(sink) => Some(PlaybackQueue::start(sink)),
        Err(e) => {
            let _ = tx
                .send(Event::Warning {
                    id,
                    message: format!("Speaker unavailable, agent audio will not play: {}", e),
                })
                .await;
            None
        }
    };
    let player = playback.as_ref().map(|p| p.handle());

    let mut pumps = Vec::new();

    let (tee_tx, tee_rx) = mpsc::channel(RECOGNIZER_TEE_CAPACITY);
    let config = StreamerConfig {
        wire_sample_rate: audio.wire_input_rate,
        chunk_duration_ms: audio.uplink_chunk_ms,
    };
    let streamer = AudioStreamer::new(frames, outbound, config).with_recognizer_tee(tee_tx);
    pumps.push(tokio::spawn(async move {
        match streamer.run().await {
            Ok(chunks) => log::info!("Uplink finished after {} chunks", chunks),
            Err(e) => log::warn!("Uplink stopped: {}", e),
        }
    }));

    let agent_tx = tx.clone();
    pumps.push(tokio::spawn(async move {
        let mut inbound = inbound;
        while let Some(event) = inbound.recv().await {
            let event = match event {
                AgentEvent::Audio(frame) => {
                    if let Some(player) = &player {
                        player.enqueue(frame);
                    }
                    Event::AgentAudio {
                        id,
                        at: Instant::now(),
                    }
                }
                AgentEvent::Text(text) => Event::AgentText {
                    id,
                    text,
                    at: Instant::now(),
                },
                AgentEvent::Closed { reason } => {
                    let _ = agent_tx.send(Event::AgentClosed { id, reason }).await;
                    break;
                }
            };
            if agent_tx.send(event).await.is_err() {
                break;
            }
        }
        log::debug!("Agent inbound pump exiting");
    }));

    // Recognizer startup may be slow; the conversation runs meanwhile.
    // The task owns the recognizer, so aborting it stops recognition.
    let recognizer = collab.recognizer.clone();
    let transcript_tx = tx.clone();
    pumps.push(tokio::spawn(async move {
        let mut handle = match recognizer.start(tee_rx).await {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Recognizer unavailable: {}", e);
                let _ = transcript_tx
                    .send(Event::RecognizerUnavailable {
                        id,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        log::info!("Recognizer running");
        while let Some(text) = handle.transcripts.recv().await {
            if transcript_tx.send(Event::Transcript { id, text }).await.is_err() {
                break;
            }
        }
        handle.stop();
        log::debug!("Transcript pump exiting");
    }));

    let mut res = resources.lock().await;
    if res.released {
        log::info!("Conversation started after teardown, stopping");
        for pump in pumps {
            pump.abort();
        }
        if let Some(mut playback) = playback {
            playback.stop();
        }
        return;
    }
    res.pumps.extend(pumps);
    res.playback = playback;
    log::info!("Conversation running");
}

/// Wait for the camera, classify, persist. Never fails: every remote
/// problem degrades into the outcome and is returned as a warning.
async fn finalize(
    collab: &Collaborators,
    settings: &AppSettings,
    camera: Option<JoinHandle<CameraReport>>,
    request: FinalizeRequest,
) -> (SessionOutcome, Vec<String>) {
    let mut warnings = Vec::new();
    let wait = settings.timing.finalize_upload_wait();
    let camera = match camera {
        Some(handle) => match timeout(wait, handle).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => CameraReport::failed(format!("Camera task failed: {}", e)),
            Err(_) => {
                log::warn!("Camera upload still pending after {:?}", wait);
                CameraReport {
                    facial: FacialSignalResult::missing("Camera upload still pending"),
                    heart_rate_bpm: None,
                }
            }
        },
        None => CameraReport {
            facial: FacialSignalResult::missing("Camera clip was not recorded"),
            heart_rate_bpm: None,
        },
    };

    let subject = settings.subject_id.as_str();
    let baselines = collab.baselines.load(subject).await.unwrap_or_else(|e| {
        warnings.push(format!("Baselines unavailable: {}", e));
        Vec::new()
    });

    let screening = ScreeningRequest::from_slots(&request.checkin_id, &request.responses);
    if let Err(e) = collab.backend.submit_screening(&screening).await {
        warnings.push(format!("Screening submission failed: {}", e));
    }

    let transcript = Some(request.transcript.clone()).filter(|t| !t.is_empty());
    let complete = CompleteRequest {
        answers: (&request.report).into(),
        transcript,
    };
    let (server_triage, persisted) = match collab
        .backend
        .complete_checkin(&request.checkin_id, &complete)
        .await
    {
        Ok(response) => (
            Some(ServerTriage {
                status: response.triage_status,
                reasons: response.triage_reasons,
            }),
            true,
        ),
        Err(e) => {
            warnings.push(format!("Check-in completion failed: {}", e));
            (None, false)
        }
    };

    let mut observations = Vec::new();
    if let Some(bpm) = camera.heart_rate_bpm {
        observations.push(MetricObservation::new(METRIC_HEART_RATE, bpm));
    }
    if let Some(index) = camera.facial.combined_index {
        observations.push(MetricObservation::new(METRIC_FACIAL_SYMMETRY, index));
    }

    let triage = classify(
        &TriageInput {
            report: &request.report,
            facial: &camera.facial,
            observations: &observations,
            baselines: &baselines,
        },
        &settings.triage,
    );

    if !observations.is_empty() {
        if let Err(e) = collab.baselines.record(subject, &observations).await {
            warnings.push(format!("Failed to update baselines: {}", e));
        }
    }

    let outcome = SessionOutcome {
        checkin_id: request.checkin_id,
        reason: request.reason,
        triage,
        server_triage,
        answers: request.report,
        responses: request.responses,
        facial: camera.facial,
        heart_rate_bpm: camera.heart_rate_bpm,
        persisted,
    };
    (outcome, warnings)
}

/// Release everything, in order. A failing step is logged and skipped.
async fn teardown(resources: &Mutex<LiveResources>) {
    let mut res = resources.lock().await;
    res.released = true;

    // 1. media tracks
    if let Some(mut track) = res.mic_track.take() {
        match track.stop() {
            Ok(()) => log::info!("Teardown: {} stopped", track.label()),
            Err(e) => log::warn!("Teardown: failed to stop {}: {}", track.label(), e),
        }
    }
    res.mic_frames = None;

    // 2. processing: uplink, inbound decode, playback, recognizer
    for pump in res.pumps.drain(..) {
        pump.abort();
    }
    if let Some(mut playback) = res.playback.take() {
        playback.stop();
    }
    log::info!("Teardown: audio processing stopped");

    // 3. timers: completion poll and camera clip
    res.cancel.cancel();
    log::info!("Teardown: timers cleared");

    // 4. remote connection
    res.outbound = None;
    res.inbound = None;
    let connection = res.connection.take();
    let finalize = res.finalize.take();
    drop(res);

    if let Some(connection) = connection {
        connection.close().await;
    }

    // A finalize in flight still persists its result
    if let Some(finalize) = finalize {
        if let Err(e) = finalize.await {
            log::warn!("Teardown: finalize task failed: {}", e);
        }
    }
    log::info!("Teardown complete");
}
