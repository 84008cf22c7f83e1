use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::script::{default_prompts, QUESTION_COUNT};

/// Directory name under the platform config/data dirs
pub const APP_DIR_NAME: &str = "guardian-checkin";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const DEFAULT_CLOSING_SENTENCE: &str =
    "Thank you for checking in today. Your answers have been recorded. Goodbye!";
pub const DEFAULT_CLOSING_REQUEST: &str =
    "All questions are answered. Please say your closing sentence now, word for word.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Check-in backend base URL (upload, completion, screenings).
    pub backend_url: String,

    /// Bearer token for the backend, if it requires auth.
    pub auth_token: Option<String>,

    /// Direct WebSocket URL of the conversational agent. When unset a signed
    /// URL is requested from the backend.
    pub agent_url: Option<String>,

    /// Whose baselines this check-in is compared against and folded into.
    pub subject_id: String,

    /// Exact sentence the agent speaks to end the call. Hearing it finalizes
    /// the session immediately.
    pub closing_sentence: String,

    /// Text turn sent to the agent to ask for the closing sentence.
    pub closing_request: String,

    /// The three scripted prompts, in order.
    pub questions: [String; QUESTION_COUNT],

    pub timing: TimingSettings,
    pub audio: AudioSettings,
    pub triage: TriageSettings,
    pub camera: CameraSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8000".to_string(),
            auth_token: None,
            agent_url: None,
            subject_id: "default".to_string(),
            closing_sentence: DEFAULT_CLOSING_SENTENCE.to_string(),
            closing_request: DEFAULT_CLOSING_REQUEST.to_string(),
            questions: default_prompts(),
            timing: TimingSettings::default(),
            audio: AudioSettings::default(),
            triage: TriageSettings::default(),
            camera: CameraSettings::default(),
        }
    }
}

/// Completion heuristics and timers. All values are empirically tuned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Completion evaluator period.
    pub poll_interval_ms: u64,
    /// Agent silence after its last burst before asking it to close, once
    /// every question is answered.
    pub answered_silence_ms: u64,
    /// After the closing request: agent idle time before finalizing anyway.
    pub closing_idle_ms: u64,
    /// After the closing request: minimum wait before finalizing anyway.
    pub closing_grace_ms: u64,
    /// Stall detection: minimum agent turns.
    pub stall_min_turns: u32,
    /// Stall detection: minimum agent idle time.
    pub stall_idle_ms: u64,
    /// Stall detection: minimum session age.
    pub stall_min_session_ms: u64,
    /// Agent silence that separates two turns.
    pub turn_gap_ms: u64,
    /// Camera clip length.
    pub camera_clip_ms: u64,
    /// Extra time beyond the clip length before a recording is abandoned.
    pub camera_grace_ms: u64,
    /// How long finalize waits for a still-running camera upload.
    pub finalize_upload_wait_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            answered_silence_ms: 1500,
            closing_idle_ms: 4500,
            closing_grace_ms: 4500,
            stall_min_turns: 4,
            stall_idle_ms: 6000,
            stall_min_session_ms: 18000,
            turn_gap_ms: 800,
            camera_clip_ms: 10_000,
            camera_grace_ms: 5000,
            finalize_upload_wait_ms: 20_000,
        }
    }
}

impl TimingSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn camera_clip(&self) -> Duration {
        Duration::from_millis(self.camera_clip_ms)
    }

    pub fn camera_deadline(&self) -> Duration {
        Duration::from_millis(self.camera_clip_ms + self.camera_grace_ms)
    }

    pub fn finalize_upload_wait(&self) -> Duration {
        Duration::from_millis(self.finalize_upload_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Microphone audio is resampled to this rate before it is sent.
    pub wire_input_rate: u32,
    /// Agent audio arrives at this rate and is played without resampling.
    pub wire_output_rate: u32,
    /// Uplink chunk length.
    pub uplink_chunk_ms: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            wire_input_rate: 16000,
            wire_output_rate: 24000,
            uplink_chunk_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageSettings {
    /// Baseline drift beyond this many standard deviations is a warning.
    pub deviation_sigma: f64,
    /// Baselines with fewer samples contribute no signal.
    pub min_baseline_samples: u64,
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            deviation_sigma: 2.5,
            min_baseline_samples: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Capture device passed to ffmpeg `-i`.
    pub device: String,
    /// ffmpeg input format (`v4l2`, `avfoundation`, `dshow`).
    pub input_format: String,
    pub ffmpeg_path: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            input_format: "v4l2".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl AppSettings {
    /// Apply `CHECKIN_*` environment overrides. Blank values are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("CHECKIN_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(token) = get("CHECKIN_AUTH_TOKEN") {
            self.auth_token = Some(token);
        }
        if let Some(url) = get("CHECKIN_AGENT_URL") {
            self.agent_url = Some(url);
        }
        if let Some(subject) = get("CHECKIN_SUBJECT_ID") {
            self.subject_id = subject;
        }
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails when the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
