//! Check-in backend collaborator
//!
//! The session only needs four calls: upload the camera clip, re-fetch the
//! check-in when the upload carried no facial result, record the screening
//! answers and complete the check-in. They sit behind `CheckinApi` so the
//! controller can run against an in-process fake.

mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregator::ResponseSlot;
use crate::audio::CameraClip;
use crate::triage::{FacialSignalResult, FacialStatus, SelfReport};

pub use client::BackendClient;

/// Errors talking to the check-in backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Backend error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Failed to parse backend response: {0}")]
    Parse(String),
}

/// Facial analyzer output as the backend reports it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacialSymmetryPayload {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub combined_index: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FacialSymmetryPayload {
    pub fn to_signal(&self) -> FacialSignalResult {
        let status = match self.status.as_deref() {
            Some(s) => FacialStatus::parse(s),
            None => FacialStatus::Error,
        };
        FacialSignalResult {
            status,
            reason: self.reason.clone().or_else(|| self.error.clone()),
            combined_index: self.combined_index.filter(|v| v.is_finite()),
        }
    }
}

/// Remote heart-rate estimate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartRatePayload {
    #[serde(default)]
    pub avg_hr_bpm: Option<f64>,
    #[serde(default)]
    pub hr_quality: Option<String>,
    #[serde(default)]
    pub sqi: Option<f64>,
}

impl HeartRatePayload {
    /// The estimate, unless the analyzer rated its own quality as low
    pub fn usable_bpm(&self) -> Option<f64> {
        let low = self
            .hr_quality
            .as_deref()
            .is_some_and(|q| q.eq_ignore_ascii_case("low"));
        if low {
            return None;
        }
        self.avg_hr_bpm.filter(|bpm| bpm.is_finite() && *bpm > 0.0)
    }
}

/// Analyzer results attached to a check-in (upload response or detail)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CheckinAnalysis {
    #[serde(default)]
    pub facial_symmetry: Option<FacialSymmetryPayload>,
    #[serde(default)]
    pub heart_rate: Option<HeartRatePayload>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckinStarted {
    pub checkin_id: String,
    #[serde(default)]
    pub started_at: Option<String>,
}

/// `answers` object of the completion request
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CompletionAnswers {
    pub dizziness: bool,
    pub chest_pain: bool,
    pub trouble_breathing: bool,
    pub medication_taken: Option<bool>,
}

impl From<&SelfReport> for CompletionAnswers {
    /// Unresolved symptoms are sent as "not reported".
    fn from(report: &SelfReport) -> Self {
        Self {
            dizziness: report.dizziness.unwrap_or(false),
            chest_pain: report.chest_pain.unwrap_or(false),
            trouble_breathing: report.trouble_breathing.unwrap_or(false),
            medication_taken: report.medication_taken,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompleteRequest {
    pub answers: CompletionAnswers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompleteResponse {
    #[serde(default)]
    pub checkin_id: Option<String>,
    pub triage_status: String,
    #[serde(default)]
    pub triage_reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreeningItem {
    pub q: String,
    pub answer: Option<bool>,
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreeningRequest {
    pub checkin_id: Option<String>,
    pub responses: Vec<ScreeningItem>,
}

impl ScreeningRequest {
    pub fn from_slots(checkin_id: &str, slots: &[ResponseSlot]) -> Self {
        Self {
            checkin_id: Some(checkin_id.to_string()),
            responses: slots
                .iter()
                .map(|slot| ScreeningItem {
                    q: slot.question.prompt.clone(),
                    answer: slot.answer,
                    transcript: slot.transcript.clone(),
                })
                .collect(),
        }
    }
}

/// Backend calls made during a session
#[async_trait]
pub trait CheckinApi: Send + Sync {
    /// `POST /checkins/{id}/upload`
    async fn upload_clip(
        &self,
        checkin_id: &str,
        clip: &CameraClip,
    ) -> Result<CheckinAnalysis, BackendError>;

    /// `GET /checkins/{id}`
    async fn fetch_checkin(&self, checkin_id: &str) -> Result<CheckinAnalysis, BackendError>;

    /// `POST /screenings`
    async fn submit_screening(&self, request: &ScreeningRequest) -> Result<(), BackendError>;

    /// `POST /checkins/{id}/complete`
    async fn complete_checkin(
        &self,
        checkin_id: &str,
        request: &CompleteRequest,
    ) -> Result<CompleteResponse, BackendError>;
}
