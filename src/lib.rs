pub mod aggregator;
pub mod audio;
pub mod backend;
pub mod effects;
pub mod script;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;
pub mod transcription;
pub mod triage;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use audio::SystemDevices;
use backend::BackendClient;
use effects::{Collaborators, LiveEffectRunner};
use session::{CheckinSession, ClientContext};
use settings::AppSettings;
use streaming::WebSocketAgent;
use transcription::RealtimeRecognizer;
use triage::FileBaselineStore;

/// Guardian check-in command line arguments
#[derive(Parser, Debug)]
#[command(name = "guardian-checkin")]
#[command(version, about = "Run one live voice check-in session", long_about = None)]
pub struct Cli {
    /// Existing check-in to attach to (a new one is started when omitted)
    #[arg(short = 'c', long, value_name = "ID")]
    pub checkin_id: Option<String>,

    /// Agent WebSocket URL (overrides settings and the signed URL)
    #[arg(long, value_name = "URL")]
    pub agent_url: Option<String>,

    /// Subject whose baselines are used
    #[arg(short = 's', long, value_name = "ID")]
    pub subject: Option<String>,

    /// Settings file (default: <config_dir>/guardian-checkin/settings.json)
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Baseline store file (default: <data_dir>/guardian-checkin/baselines.json)
    #[arg(long, value_name = "FILE")]
    pub baselines: Option<PathBuf>,
}

/// Resolve settings from file, environment and command line, in that order.
pub fn resolve_settings(cli: &Cli) -> AppSettings {
    let mut settings = match &cli.settings {
        Some(path) => settings::load_settings_from(path),
        None => settings::load_settings(),
    };
    settings.apply_env_overrides();
    if let Some(url) = &cli.agent_url {
        settings.agent_url = Some(url.clone());
    }
    if let Some(subject) = &cli.subject {
        settings.subject_id = subject.clone();
    }
    settings
}

/// Run one check-in to completion and print its outcome as JSON.
pub fn run(cli: Cli) -> Result<(), String> {
    // rustls 0.23 needs a process-wide provider; a second install is harmless
    let _ = rustls::crypto::ring::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start runtime: {}", e))?;

    runtime.block_on(run_checkin(cli))
}

async fn run_checkin(cli: Cli) -> Result<(), String> {
    let settings = resolve_settings(&cli);
    log::info!("Backend: {}", settings.backend_url);

    let backend = Arc::new(
        BackendClient::new(&settings.backend_url, settings.auth_token.clone())
            .map_err(|e| e.to_string())?,
    );

    let checkin_id = match cli.checkin_id {
        Some(id) => id,
        None => {
            let started = backend.start_checkin().await.map_err(|e| e.to_string())?;
            log::info!("Started check-in {}", started.checkin_id);
            started.checkin_id
        }
    };

    let agent_url = match settings.agent_url.clone().filter(|u| !u.trim().is_empty()) {
        Some(url) => url,
        None => backend.agent_signed_url().await.map_err(|e| e.to_string())?,
    };

    let baseline_path = match cli.baselines {
        Some(path) => path,
        None => FileBaselineStore::default_path().ok_or("Could not determine data directory")?,
    };
    log::info!("Baselines: {}", baseline_path.display());

    let collab = Collaborators {
        devices: Arc::new(SystemDevices::new(
            settings.camera.clone(),
            Duration::from_millis(settings.timing.camera_grace_ms),
        )),
        agent: Arc::new(WebSocketAgent::new(agent_url, settings.audio.wire_output_rate)),
        recognizer: Arc::new(RealtimeRecognizer::from_env()),
        backend,
        baselines: Arc::new(FileBaselineStore::new(baseline_path)),
    };

    let ctx = ClientContext::new();
    let runner = LiveEffectRunner::new(collab, settings.clone());
    let session =
        CheckinSession::new(&ctx, checkin_id, &settings, runner).map_err(|e| e.to_string())?;

    if let Err(e) = session.start().await {
        session.wait_closed().await;
        return Err(e.to_string());
    }
    log::info!("Check-in running, press Ctrl+C to stop");

    let outcome = tokio::select! {
        outcome = session.wait_closed() => outcome,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, stopping session");
            session.stop().await;
            session.snapshot().outcome
        }
    };

    match outcome {
        Some(outcome) => {
            let json = serde_json::to_string_pretty(outcome.as_ref()).map_err(|e| e.to_string())?;
            println!("{}", json);
            Ok(())
        }
        None => {
            let state = session.snapshot();
            match state.failure {
                Some(failure) => Err(session::SessionError::from(&failure).to_string()),
                None => {
                    log::warn!("Session ended without a result ({:?})", state.phase);
                    Ok(())
                }
            }
        }
    }
}
