//! Check-in session handle
//!
//! `CheckinSession` owns the event loop of one session: the loop is the only
//! writer of `SessionState` and publishes every new state on a watch channel
//! for read-only observers. A `ClientContext` admits one live session at a
//! time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::effects::EffectRunner;
use crate::script::Script;
use crate::settings::AppSettings;
use crate::state_machine::{
    reduce, Event, Phase, SessionFailure, SessionOutcome, SessionRules, SessionState,
};

/// Events queued for the loop
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Permission denied: {0}")]
    Permission(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("A check-in session is already active")]
    AlreadyActive,
    #[error("Session is closed")]
    Closed,
}

impl From<&SessionFailure> for SessionError {
    fn from(failure: &SessionFailure) -> Self {
        match failure {
            SessionFailure::Permission(e) => SessionError::Permission(e.clone()),
            SessionFailure::Connection(e) => SessionError::Connection(e.clone()),
        }
    }
}

/// Shared by every session of one client. At most one may be active.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    active: Arc<AtomicBool>,
}

impl ClientContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_active_session(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn claim(&self) -> Option<ActiveGuard> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ActiveGuard(self.active.clone()))
    }
}

/// Holds the client's session slot until dropped
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn is_done(state: &SessionState) -> bool {
    state.phase.is_terminal() && state.resources_released
}

pub struct CheckinSession {
    tx: mpsc::Sender<Event>,
    state_rx: watch::Receiver<SessionState>,
}

impl CheckinSession {
    /// Create an idle session and spawn its loop.
    ///
    /// Fails with `AlreadyActive` while another session of `ctx` is running.
    pub fn new(
        ctx: &ClientContext,
        checkin_id: impl Into<String>,
        settings: &AppSettings,
        runner: Arc<dyn EffectRunner>,
    ) -> Result<Self, SessionError> {
        let guard = ctx.claim().ok_or(SessionError::AlreadyActive)?;

        let state = SessionState::new(checkin_id, Script::new(settings.questions.clone()));
        let rules = SessionRules::from_settings(settings);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(state.clone());

        tokio::spawn(run_session_loop(
            state,
            rules,
            rx,
            tx.clone(),
            runner,
            state_tx,
            guard,
        ));

        Ok(Self { tx, state_rx })
    }

    /// Start the session and wait until it is listening.
    ///
    /// Calling it again while the session is live does nothing.
    pub async fn start(&self) -> Result<(), SessionError> {
        let phase = self.state_rx.borrow().phase;
        if phase.is_live() {
            log::debug!("Start ignored: session already {:?}", phase);
            return Ok(());
        }
        if phase.is_terminal() {
            return Err(SessionError::Closed);
        }

        self.tx
            .send(Event::Start { at: Instant::now() })
            .await
            .map_err(|_| SessionError::Closed)?;

        let mut rx = self.state_rx.clone();
        let settled = rx
            .wait_for(|s| s.phase == Phase::Listening || s.phase.is_terminal())
            .await
            .map_err(|_| SessionError::Closed)?;
        let result = match (&settled.phase, &settled.failure) {
            (Phase::Listening, _) => Ok(()),
            (Phase::Error, Some(failure)) => Err(failure.into()),
            _ => Err(SessionError::Closed),
        };
        result
    }

    /// Stop from any phase and wait for every resource to be released.
    /// Idempotent.
    pub async fn stop(&self) {
        if is_done(&self.state_rx.borrow()) {
            return;
        }
        // The loop may already be gone; waiting below covers both cases
        let _ = self.tx.send(Event::Stop).await;
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(is_done).await;
    }

    /// Wait for the session to end. Returns its outcome when it finalized.
    pub async fn wait_closed(&self) -> Option<Arc<SessionOutcome>> {
        let mut rx = self.state_rx.clone();
        let outcome = match rx.wait_for(is_done).await {
            Ok(state) => state.outcome.clone(),
            Err(_) => self.state_rx.borrow().outcome.clone(),
        };
        outcome
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }
}

impl Drop for CheckinSession {
    fn drop(&mut self) {
        if !is_done(&self.state_rx.borrow()) {
            let _ = self.tx.try_send(Event::Stop);
        }
    }
}

/// Single writer of `SessionState`
async fn run_session_loop(
    mut state: SessionState,
    rules: SessionRules,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    state_tx: watch::Sender<SessionState>,
    guard: ActiveGuard,
) {
    let mut guard = Some(guard);
    log::info!("Session loop started (check-in {})", state.checkin_id);

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        let (next, effects) = reduce(&state, event, &rules);
        if next.phase != state.phase {
            log::info!("State transition: {:?} -> {:?}", state.phase, next.phase);
        }
        state = next;

        let done = is_done(&state);
        if done {
            // Free the slot before observers see the final state
            drop(guard.take());
        }
        state_tx.send_replace(state.clone());

        for eff in effects {
            effect_runner.spawn(eff, tx.clone());
        }

        if done {
            break;
        }
    }

    log::info!("Session loop ended ({:?})", state.phase);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Effect;

    /// Answers every effect instantly
    struct InstantRunner {
        deny_media: bool,
    }

    impl EffectRunner for InstantRunner {
        fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
            let deny_media = self.deny_media;
            tokio::spawn(async move {
                let event = match effect {
                    Effect::AcquireMedia { id } if deny_media => Some(Event::MediaDenied {
                        id,
                        err: "Permission denied for microphone".to_string(),
                    }),
                    Effect::AcquireMedia { id } => Some(Event::MediaReady { id }),
                    Effect::ConnectAgent { id } => Some(Event::AgentConnected {
                        id,
                        at: Instant::now(),
                    }),
                    Effect::Teardown { id } => Some(Event::ResourcesReleased { id }),
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = tx.send(event).await;
                }
            });
        }
    }

    fn session(ctx: &ClientContext, deny_media: bool) -> Result<CheckinSession, SessionError> {
        CheckinSession::new(
            ctx,
            "checkin-1",
            &AppSettings::default(),
            Arc::new(InstantRunner { deny_media }),
        )
    }

    #[tokio::test]
    async fn test_start_reaches_listening() {
        let ctx = ClientContext::new();
        let s = session(&ctx, false).unwrap();
        s.start().await.unwrap();
        assert_eq!(s.snapshot().phase, Phase::Listening);

        // No-op while live
        s.start().await.unwrap();
        assert_eq!(s.snapshot().phase_history.len(), 3);

        s.stop().await;
        let state = s.snapshot();
        assert_eq!(state.phase, Phase::Closed);
        assert!(state.resources_released);
        assert!(s.wait_closed().await.is_none());
    }

    #[tokio::test]
    async fn test_one_session_per_context() {
        let ctx = ClientContext::new();
        let first = session(&ctx, false).unwrap();
        first.start().await.unwrap();
        assert!(ctx.has_active_session());
        assert_eq!(session(&ctx, false).err(), Some(SessionError::AlreadyActive));

        first.stop().await;
        assert!(!ctx.has_active_session());
        let second = session(&ctx, false).unwrap();
        second.stop().await;
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let ctx = ClientContext::new();
        let s = session(&ctx, true).unwrap();
        let err = s.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Permission(_)));
        s.wait_closed().await;
        assert_eq!(s.snapshot().phase, Phase::Error);
        assert!(!ctx.has_active_session());

        // Stop in Error is a no-op
        s.stop().await;
        assert_eq!(s.snapshot().phase, Phase::Error);
    }

    #[tokio::test]
    async fn test_stop_twice_is_safe() {
        let ctx = ClientContext::new();
        let s = session(&ctx, false).unwrap();
        s.start().await.unwrap();
        s.stop().await;
        s.stop().await;
        assert_eq!(s.snapshot().phase, Phase::Closed);
        assert_eq!(s.start().await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn test_drop_releases_context() {
        let ctx = ClientContext::new();
        let s = session(&ctx, false).unwrap();
        s.start().await.unwrap();
        let mut rx = s.subscribe();
        drop(s);
        let _ = rx.wait_for(is_done).await;
        assert!(!ctx.has_active_session());
    }
}
