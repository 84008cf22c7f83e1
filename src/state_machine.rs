//! Session Lifecycle Controller
//!
//! Single-writer state machine for one check-in session. Every platform
//! callback (microphone, agent socket, recognizer, camera, timers) is turned
//! into an `Event` on one queue; `reduce()` is the only place `SessionState`
//! changes, and it answers with `Effect`s for the runner to execute.
//!
//! ```text
//! idle ──▶ connecting ──▶ listening (+ camera clip in parallel) ──▶ finalizing ──▶ closed
//!               │              │
//!               └──────────────┴──▶ error (permission / connection)
//! ```
//!
//! Completion is primarily the agent speaking the exact closing sentence.
//! A periodic `Tick` runs `evaluate_completion()` as a backstop.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::aggregator::{ResponseAggregator, ResponseSlot};
use crate::script::Script;
use crate::settings::{AppSettings, TimingSettings};
use crate::triage::{FacialSignalResult, FacialStatus, SelfReport, TriageResult};

/// Session log entries kept for callers
pub const SESSION_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Connecting,
    Listening,
    Finalizing,
    Closed,
    Error,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed | Phase::Error)
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Phase::Connecting | Phase::Listening | Phase::Finalizing)
    }
}

/// Camera capture runs alongside listening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStep {
    /// Not dispatched yet
    Pending,
    /// Clip recording or uploading
    Recording,
    /// Upload finished with an analyzer verdict
    Uploaded,
    /// Recording or upload failed (non-fatal)
    Failed,
}

/// Why a session ended in `Phase::Error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    Permission(String),
    Connection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    /// Agent spoke the closing sentence
    ClosingPhrase,
    /// Closing requested but the phrase never arrived
    ClosingTimeout,
    /// Agent hung up after the closing request
    RemoteClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingTrigger {
    AllAnswered,
    Stalled,
}

/// Outcome of one completion evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    RequestClosing(ClosingTrigger),
    Finalize,
}

/// Server-side triage as returned by the completion call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerTriage {
    pub status: String,
    pub reasons: Vec<String>,
}

/// What a finished session produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub checkin_id: String,
    pub reason: FinalizeReason,
    pub triage: TriageResult,
    pub server_triage: Option<ServerTriage>,
    pub answers: SelfReport,
    pub responses: Vec<ResponseSlot>,
    pub facial: FacialSignalResult,
    pub heart_rate_bpm: Option<f64>,
    /// Completion call succeeded
    pub persisted: bool,
}

/// Everything finalize needs, captured at the moment it starts
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeRequest {
    pub checkin_id: String,
    pub reason: FinalizeReason,
    pub responses: Vec<ResponseSlot>,
    pub report: SelfReport,
    pub transcript: String,
}

/// Fixed inputs of the reducer
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRules {
    pub closing_sentence: String,
    pub closing_request: String,
    pub timing: TimingSettings,
}

impl SessionRules {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            closing_sentence: settings.closing_sentence.clone(),
            closing_request: settings.closing_request.clone(),
            timing: settings.timing.clone(),
        }
    }
}

impl Default for SessionRules {
    fn default() -> Self {
        Self::from_settings(&AppSettings::default())
    }
}

/// The single owned state of a session
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: Option<Uuid>,
    pub checkin_id: String,
    pub phase: Phase,
    /// Every phase entered, in order, starting with `Idle`
    pub phase_history: Vec<Phase>,
    pub responses: ResponseAggregator,
    pub started_at: Option<Instant>,
    /// Last agent activity (audio or text)
    pub last_agent_audio_at: Option<Instant>,
    /// Start of the most recent agent turn
    pub last_agent_burst_at: Option<Instant>,
    pub agent_turn_count: u32,
    pub listening_since: Option<Instant>,
    pub completion_prompted: bool,
    pub completion_prompted_at: Option<Instant>,
    /// Set once, when finalize is dispatched
    pub completion_sent_once: bool,
    pub camera: CameraStep,
    pub facial: Option<FacialSignalResult>,
    pub recognizer_available: bool,
    pub failure: Option<SessionFailure>,
    pub log: VecDeque<String>,
    pub teardown_requested: bool,
    pub resources_released: bool,
    pub outcome: Option<Arc<SessionOutcome>>,
}

impl SessionState {
    pub fn new(checkin_id: impl Into<String>, script: Script) -> Self {
        Self {
            session_id: None,
            checkin_id: checkin_id.into(),
            phase: Phase::Idle,
            phase_history: vec![Phase::Idle],
            responses: ResponseAggregator::new(script),
            started_at: None,
            last_agent_audio_at: None,
            last_agent_burst_at: None,
            agent_turn_count: 0,
            listening_since: None,
            completion_prompted: false,
            completion_prompted_at: None,
            completion_sent_once: false,
            camera: CameraStep::Pending,
            facial: None,
            recognizer_available: true,
            failure: None,
            log: VecDeque::new(),
            teardown_requested: false,
            resources_released: false,
            outcome: None,
        }
    }

    pub fn current_question_index(&self) -> usize {
        self.responses.current_index()
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            self.phase = phase;
            self.phase_history.push(phase);
        }
    }

    /// Append to the bounded session log
    pub fn note(&mut self, message: impl Into<String>) {
        if self.log.len() == SESSION_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(message.into());
    }

    /// Time since the agent last produced anything (or since listening began)
    fn agent_idle(&self, now: Instant) -> Duration {
        self.last_agent_audio_at
            .or(self.listening_since)
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    fn session_age(&self, now: Instant) -> Duration {
        self.started_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    /// Preconditions for asking the agent to close
    fn closing_allowed(&self) -> bool {
        let camera_dispatched = self.camera != CameraStep::Pending;
        let answers_present = self.responses.all_transcribed() || !self.recognizer_available;
        camera_dispatched && answers_present
    }
}

/// Events fed to the reducer. All but `Start`/`Stop` carry the session id.
#[derive(Debug, Clone)]
pub enum Event {
    Start {
        at: Instant,
    },
    Stop,

    MediaReady {
        id: Uuid,
    },
    MediaDenied {
        id: Uuid,
        err: String,
    },

    AgentConnected {
        id: Uuid,
        at: Instant,
    },
    AgentConnectFailed {
        id: Uuid,
        err: String,
    },
    AgentAudio {
        id: Uuid,
        at: Instant,
    },
    AgentText {
        id: Uuid,
        text: String,
        at: Instant,
    },
    AgentClosed {
        id: Uuid,
        reason: Option<String>,
    },

    Transcript {
        id: Uuid,
        text: String,
    },
    RecognizerUnavailable {
        id: Uuid,
        reason: String,
    },

    CameraDone {
        id: Uuid,
        facial: FacialSignalResult,
    },

    /// Completion evaluator tick
    Tick {
        id: Uuid,
        now: Instant,
    },

    Finalized {
        id: Uuid,
        outcome: Arc<SessionOutcome>,
    },
    ResourcesReleased {
        id: Uuid,
    },

    /// A non-fatal problem reported by an effect
    Warning {
        id: Uuid,
        message: String,
    },
}

impl Event {
    fn session_id(&self) -> Option<Uuid> {
        use Event::*;
        match self {
            Start { .. } | Stop => None,
            MediaReady { id }
            | MediaDenied { id, .. }
            | AgentConnected { id, .. }
            | AgentConnectFailed { id, .. }
            | AgentAudio { id, .. }
            | AgentText { id, .. }
            | AgentClosed { id, .. }
            | Transcript { id, .. }
            | RecognizerUnavailable { id, .. }
            | CameraDone { id, .. }
            | Tick { id, .. }
            | Finalized { id, .. }
            | ResourcesReleased { id }
            | Warning { id, .. } => Some(*id),
        }
    }
}

/// Work for the effect runner
#[derive(Debug, Clone)]
pub enum Effect {
    /// Open the microphone and verify the camera
    AcquireMedia { id: Uuid },
    /// Record the clip, then upload it once
    StartCamera { id: Uuid, checkin_id: String },
    ConnectAgent { id: Uuid },
    /// Wire uplink, inbound decoding, playback and recognizer
    StartConversation { id: Uuid },
    StartCompletionPoll { id: Uuid, interval: Duration },
    SendAgentText { id: Uuid, text: String },
    Finalize { id: Uuid, request: FinalizeRequest },
    /// Release every resource; emitted at most once
    Teardown { id: Uuid },
}

/// Decide what the completion backstop should do at `now`.
///
/// Checked in priority order:
/// 1. all answered and the agent quiet → ask for the closing sentence
/// 2. closing asked, agent idle and the grace period over → finalize
/// 3. enough turns, long idle, old enough session → treat as stalled, ask to close
pub fn evaluate_completion(
    state: &SessionState,
    now: Instant,
    rules: &SessionRules,
) -> Option<CompletionAction> {
    let t = &rules.timing;
    let idle = state.agent_idle(now);

    if !state.completion_prompted
        && state.responses.all_answered()
        && idle >= Duration::from_millis(t.answered_silence_ms)
        && state.closing_allowed()
    {
        return Some(CompletionAction::RequestClosing(ClosingTrigger::AllAnswered));
    }

    if state.completion_prompted {
        let since_prompt = state
            .completion_prompted_at
            .map(|p| now.saturating_duration_since(p))
            .unwrap_or_default();
        if idle >= Duration::from_millis(t.closing_idle_ms)
            && since_prompt >= Duration::from_millis(t.closing_grace_ms)
        {
            return Some(CompletionAction::Finalize);
        }
        return None;
    }

    if state.agent_turn_count >= t.stall_min_turns
        && idle >= Duration::from_millis(t.stall_idle_ms)
        && state.session_age(now) >= Duration::from_millis(t.stall_min_session_ms)
        && state.closing_allowed()
    {
        return Some(CompletionAction::RequestClosing(ClosingTrigger::Stalled));
    }

    None
}

fn note_agent_activity(state: &mut SessionState, at: Instant, rules: &SessionRules) {
    let gap = Duration::from_millis(rules.timing.turn_gap_ms);
    let new_turn = match state.last_agent_audio_at {
        Some(prev) => at.saturating_duration_since(prev) >= gap,
        None => true,
    };
    if new_turn {
        state.agent_turn_count += 1;
        state.last_agent_burst_at = Some(at);
        log::debug!("Agent turn {}", state.agent_turn_count);
    }
    state.last_agent_audio_at = Some(at);
}

fn is_closing_sentence(text: &str, rules: &SessionRules) -> bool {
    let expected = rules.closing_sentence.trim();
    !expected.is_empty() && text.trim() == expected
}

/// One-shot finalize. Returns no effects when already dispatched.
fn begin_finalize(state: &mut SessionState, id: Uuid, reason: FinalizeReason) -> Vec<Effect> {
    if state.completion_sent_once {
        log::debug!("Finalize already dispatched, ignoring {:?}", reason);
        return vec![];
    }
    state.completion_sent_once = true;
    state.enter(Phase::Finalizing);
    log::info!("Finalizing session ({:?})", reason);

    let request = FinalizeRequest {
        checkin_id: state.checkin_id.clone(),
        reason,
        responses: state.responses.slots().to_vec(),
        report: state.responses.self_report(),
        transcript: state.responses.transcript_text(),
    };
    vec![Effect::Finalize { id, request }]
}

/// One-shot teardown
fn request_teardown(state: &mut SessionState, effects: &mut Vec<Effect>) {
    if state.teardown_requested {
        return;
    }
    state.teardown_requested = true;
    if let Some(id) = state.session_id {
        effects.push(Effect::Teardown { id });
    } else {
        // Nothing was ever acquired
        state.resources_released = true;
    }
}

fn fail(state: &mut SessionState, failure: SessionFailure) -> Vec<Effect> {
    log::error!("Session failed: {:?}", failure);
    state.note(match &failure {
        SessionFailure::Permission(e) => format!("Permission error: {}", e),
        SessionFailure::Connection(e) => format!("Connection error: {}", e),
    });
    state.failure = Some(failure);
    state.enter(Phase::Error);
    let mut effects = vec![];
    request_teardown(state, &mut effects);
    effects
}

fn request_closing(
    state: &mut SessionState,
    id: Uuid,
    now: Instant,
    trigger: ClosingTrigger,
    rules: &SessionRules,
) -> Vec<Effect> {
    log::info!("Requesting closing sentence ({:?})", trigger);
    state.completion_prompted = true;
    state.completion_prompted_at = Some(now);
    vec![Effect::SendAgentText {
        id,
        text: rules.closing_request.clone(),
    }]
}

/// Reducer: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Events carrying another session's id are ignored
/// - Finalize and teardown are each emitted at most once
/// - Terminal phases only record late results, they never leave
pub fn reduce(state: &SessionState, event: Event, rules: &SessionRules) -> (SessionState, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let mut next = state.clone();

    if let Some(eid) = event.session_id() {
        if state.session_id != Some(eid) {
            log::debug!("Ignoring stale event for session {}", eid);
            return (next, vec![]);
        }
    }

    let effects = match (state.phase, event) {
        // -----------------
        // Stop (any phase)
        // -----------------
        (Phase::Closed | Phase::Error, Stop) => vec![],
        (_, Stop) => {
            log::info!("Stop requested");
            next.enter(Phase::Closed);
            let mut effects = vec![];
            request_teardown(&mut next, &mut effects);
            effects
        }

        // -----------------
        // Idle
        // -----------------
        (Phase::Idle, Start { at }) => {
            let id = Uuid::new_v4();
            next.session_id = Some(id);
            next.started_at = Some(at);
            next.enter(Phase::Connecting);
            vec![AcquireMedia { id }]
        }
        (phase, Start { .. }) => {
            if phase.is_terminal() {
                log::warn!("Start ignored: session already {:?}", phase);
            }
            vec![]
        }

        // -----------------
        // Connecting
        // -----------------
        (Phase::Connecting, MediaReady { id }) => {
            next.camera = CameraStep::Recording;
            vec![
                StartCamera {
                    id,
                    checkin_id: next.checkin_id.clone(),
                },
                ConnectAgent { id },
            ]
        }
        (Phase::Connecting, MediaDenied { err, .. }) => {
            fail(&mut next, SessionFailure::Permission(err))
        }
        (Phase::Connecting, AgentConnected { id, at }) => {
            next.listening_since = Some(at);
            next.enter(Phase::Listening);
            vec![
                StartConversation { id },
                StartCompletionPoll {
                    id,
                    interval: rules.timing.poll_interval(),
                },
            ]
        }
        (Phase::Connecting, AgentConnectFailed { err, .. }) => {
            fail(&mut next, SessionFailure::Connection(err))
        }

        // -----------------
        // Listening
        // -----------------
        (Phase::Listening, AgentAudio { at, .. }) => {
            note_agent_activity(&mut next, at, rules);
            vec![]
        }
        (Phase::Listening, AgentText { id, text, at }) => {
            note_agent_activity(&mut next, at, rules);
            if is_closing_sentence(&text, rules) {
                begin_finalize(&mut next, id, FinalizeReason::ClosingPhrase)
            } else {
                next.responses.observe_agent_text(&text);
                vec![]
            }
        }
        (Phase::Listening, Transcript { text, .. }) => {
            next.responses.record_transcript(&text);
            vec![]
        }
        (Phase::Listening, Tick { id, now }) => match evaluate_completion(&next, now, rules) {
            Some(CompletionAction::RequestClosing(trigger)) => {
                request_closing(&mut next, id, now, trigger, rules)
            }
            Some(CompletionAction::Finalize) => {
                begin_finalize(&mut next, id, FinalizeReason::ClosingTimeout)
            }
            None => vec![],
        },
        (Phase::Listening, AgentClosed { id, reason }) => {
            if next.completion_prompted {
                log::info!("Agent closed after closing request: {:?}", reason);
                begin_finalize(&mut next, id, FinalizeReason::RemoteClosed)
            } else {
                let reason = reason.unwrap_or_else(|| "agent closed the connection".to_string());
                fail(&mut next, SessionFailure::Connection(reason))
            }
        }

        // -----------------
        // Finalizing
        // -----------------
        (Phase::Finalizing, Finalized { outcome, .. }) => {
            log::info!(
                "Session finalized: {:?} ({:?})",
                outcome.triage.level,
                outcome.triage.reasons
            );
            next.outcome = Some(outcome);
            next.enter(Phase::Closed);
            let mut effects = vec![];
            request_teardown(&mut next, &mut effects);
            effects
        }
        // Stopped while finalize was in flight: keep the result
        (Phase::Closed, Finalized { outcome, .. }) => {
            if next.outcome.is_none() {
                next.outcome = Some(outcome);
            }
            vec![]
        }

        // -----------------
        // Any phase
        // -----------------
        (_, RecognizerUnavailable { reason, .. }) => {
            log::warn!("Speech recognition unavailable: {}", reason);
            next.recognizer_available = false;
            next.note(format!("Recognition unavailable: {}", reason));
            vec![]
        }
        (_, CameraDone { facial, .. }) => {
            next.camera = match facial.status {
                FacialStatus::Error | FacialStatus::Missing => CameraStep::Failed,
                _ => CameraStep::Uploaded,
            };
            if next.camera == CameraStep::Failed {
                next.note(format!(
                    "Camera clip: {:?} ({})",
                    facial.status,
                    facial.reason.as_deref().unwrap_or("no reason")
                ));
            }
            next.facial = Some(facial);
            vec![]
        }
        (_, ResourcesReleased { .. }) => {
            log::info!("Session resources released");
            next.resources_released = true;
            vec![]
        }
        (_, Warning { message, .. }) => {
            log::warn!("{}", message);
            next.note(message);
            vec![]
        }

        // Late or out-of-phase events
        (phase, other) => {
            log::debug!("Ignoring {:?} in {:?}", other, phase);
            vec![]
        }
    };

    (next, effects)
}
