//! Triage Classifier
//!
//! Pure, ordered, first-match-wins rules over the self-report answers, the
//! facial-signal status and per-subject baselines:
//!
//! 1. RED    - chest pain or trouble breathing reported
//! 2. RED    - facial ALERT together with reported dizziness
//! 3. YELLOW - facial WARN, or a tracked metric drifting from its baseline
//! 4. YELLOW - dizziness reported
//! 5. GREEN  - nothing above fired
//!
//! Only the first matching tier is reported. `reasons` is never empty.

pub mod baseline;

use serde::{Deserialize, Serialize};

use crate::settings::TriageSettings;
pub use baseline::{BaselineError, BaselineRecord, BaselineStore, FileBaselineStore, InMemoryBaselineStore};

/// Metric fed from the heart-rate estimate
pub const METRIC_HEART_RATE: &str = "heart_rate";
/// Metric fed from the facial analyzer's combined index
pub const METRIC_FACIAL_SYMMETRY: &str = "facial_symmetry_index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriageLevel {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageResult {
    pub level: TriageLevel,
    pub reasons: Vec<String>,
}

impl TriageResult {
    fn new(level: TriageLevel, reasons: Vec<String>) -> Self {
        Self { level, reasons }
    }
}

/// Facial-signal analyzer verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FacialStatus {
    Normal,
    Warn,
    Alert,
    Error,
    Missing,
}

impl FacialStatus {
    /// Lenient parse of analyzer status strings.
    ///
    /// Accepts both the NORMAL/WARN/ALERT vocabulary and the traffic-light
    /// one. Anything unrecognized is an analyzer error.
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "normal" | "green" | "ok" => FacialStatus::Normal,
            "warn" | "warning" | "yellow" => FacialStatus::Warn,
            "alert" | "red" => FacialStatus::Alert,
            "missing" | "skipped" => FacialStatus::Missing,
            "error" | "retry" => FacialStatus::Error,
            other => {
                log::warn!("Unknown facial status '{}', treating as error", other);
                FacialStatus::Error
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacialSignalResult {
    pub status: FacialStatus,
    pub reason: Option<String>,
    /// Combined asymmetry index, when the analyzer produced one
    #[serde(default)]
    pub combined_index: Option<f64>,
}

impl FacialSignalResult {
    pub fn missing(reason: impl Into<String>) -> Self {
        Self {
            status: FacialStatus::Missing,
            reason: Some(reason.into()),
            combined_index: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: FacialStatus::Error,
            reason: Some(reason.into()),
            combined_index: None,
        }
    }
}

/// Self-reported answers. `None` means no signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfReport {
    pub feeling_well: Option<bool>,
    pub dizziness: Option<bool>,
    pub chest_pain: Option<bool>,
    pub trouble_breathing: Option<bool>,
    pub medication_taken: Option<bool>,
}

/// A metric value measured during this check-in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricObservation {
    pub metric_type: String,
    pub value: f64,
}

impl MetricObservation {
    pub fn new(metric_type: impl Into<String>, value: f64) -> Self {
        Self {
            metric_type: metric_type.into(),
            value,
        }
    }
}

/// Everything the classifier looks at
#[derive(Debug, Clone, Copy)]
pub struct TriageInput<'a> {
    pub report: &'a SelfReport,
    pub facial: &'a FacialSignalResult,
    pub observations: &'a [MetricObservation],
    pub baselines: &'a [BaselineRecord],
}

/// Classify a completed check-in
pub fn classify(input: &TriageInput<'_>, settings: &TriageSettings) -> TriageResult {
    use TriageLevel::*;

    let report = input.report;
    let dizziness = report.dizziness == Some(true);

    // Rule 1
    let mut red_flags = Vec::new();
    if report.chest_pain == Some(true) {
        red_flags.push("Self-reported red flag symptom: chest pain".to_string());
    }
    if report.trouble_breathing == Some(true) {
        red_flags.push("Self-reported red flag symptom: trouble breathing".to_string());
    }
    if !red_flags.is_empty() {
        return TriageResult::new(Red, red_flags);
    }

    // Rule 2
    if input.facial.status == FacialStatus::Alert && dizziness {
        return TriageResult::new(
            Red,
            vec![format!(
                "Facial signal alert with reported dizziness{}",
                detail(&input.facial.reason)
            )],
        );
    }

    // Rule 3
    let mut warnings = Vec::new();
    if input.facial.status == FacialStatus::Warn {
        warnings.push(format!(
            "Facial signal warning{}",
            detail(&input.facial.reason)
        ));
    }
    warnings.extend(baseline_deviations(input, settings));
    if !warnings.is_empty() {
        return TriageResult::new(Yellow, warnings);
    }

    // Rule 4
    if dizziness {
        return TriageResult::new(Yellow, vec!["Reported dizziness".to_string()]);
    }

    TriageResult::new(Green, vec!["No concerning signals detected".to_string()])
}

fn detail(reason: &Option<String>) -> String {
    match reason.as_deref().map(str::trim) {
        Some(r) if !r.is_empty() => format!(": {}", r),
        _ => String::new(),
    }
}

/// Reasons for every metric whose latest value drifts beyond the allowed
/// multiple of its baseline standard deviation.
///
/// The latest value is this check-in's observation, falling back to the
/// baseline's recorded last value. Baselines below the minimum sample count,
/// or with zero spread, contribute nothing.
fn baseline_deviations(input: &TriageInput<'_>, settings: &TriageSettings) -> Vec<String> {
    input
        .baselines
        .iter()
        .filter(|b| b.sample_count >= settings.min_baseline_samples)
        .filter(|b| b.stddev.is_finite() && b.stddev > f64::EPSILON)
        .filter_map(|b| {
            let latest = input
                .observations
                .iter()
                .rev()
                .find(|o| o.metric_type == b.metric_type)
                .map(|o| o.value)
                .or(b.last_value)?;
            let sigmas = (latest - b.mean).abs() / b.stddev;
            (sigmas > settings.deviation_sigma).then(|| {
                format!(
                    "{} {:.1} deviates {:.1}σ from baseline mean {:.1}",
                    b.metric_type, latest, sigmas, b.mean
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal() -> FacialSignalResult {
        FacialSignalResult {
            status: FacialStatus::Normal,
            reason: None,
            combined_index: None,
        }
    }

    fn with_status(status: FacialStatus) -> FacialSignalResult {
        FacialSignalResult {
            status,
            reason: Some("asymmetry above threshold".to_string()),
            combined_index: Some(0.2),
        }
    }

    fn baseline(metric: &str, mean: f64, stddev: f64, n: u64) -> BaselineRecord {
        BaselineRecord {
            subject_id: "subject-1".to_string(),
            metric_type: metric.to_string(),
            mean,
            stddev,
            sample_count: n,
            last_value: None,
            updated_at: None,
        }
    }

    fn run(
        report: SelfReport,
        facial: FacialSignalResult,
        observations: &[MetricObservation],
        baselines: &[BaselineRecord],
    ) -> TriageResult {
        classify(
            &TriageInput {
                report: &report,
                facial: &facial,
                observations,
                baselines,
            },
            &TriageSettings::default(),
        )
    }

    #[test]
    fn test_chest_pain_is_red_regardless() {
        let report = SelfReport {
            chest_pain: Some(true),
            feeling_well: Some(true),
            medication_taken: Some(true),
            ..Default::default()
        };
        for facial in [normal(), with_status(FacialStatus::Warn), with_status(FacialStatus::Error)] {
            let result = run(report, facial, &[], &[baseline(METRIC_HEART_RATE, 70.0, 2.0, 10)]);
            assert_eq!(result.level, TriageLevel::Red);
            assert!(result.reasons.iter().any(|r| r.contains("chest pain")));
        }
    }

    #[test]
    fn test_all_clear_is_green_with_reason() {
        let report = SelfReport {
            feeling_well: Some(true),
            dizziness: Some(false),
            chest_pain: Some(false),
            trouble_breathing: None,
            medication_taken: None,
        };
        let result = run(report, normal(), &[], &[]);
        assert_eq!(result.level, TriageLevel::Green);
        assert!(!result.reasons.is_empty());
    }

    #[test]
    fn test_alert_with_dizziness_is_red() {
        let report = SelfReport {
            dizziness: Some(true),
            ..Default::default()
        };
        let result = run(report, with_status(FacialStatus::Alert), &[], &[]);
        assert_eq!(result.level, TriageLevel::Red);
        assert_eq!(result.reasons.len(), 1);
    }

    #[test]
    fn test_alert_without_dizziness_is_not_escalated() {
        let result = run(SelfReport::default(), with_status(FacialStatus::Alert), &[], &[]);
        assert_eq!(result.level, TriageLevel::Green);
    }

    #[test]
    fn test_warn_is_yellow_and_first_tier_only() {
        let report = SelfReport {
            dizziness: Some(true),
            ..Default::default()
        };
        let result = run(report, with_status(FacialStatus::Warn), &[], &[]);
        assert_eq!(result.level, TriageLevel::Yellow);
        assert_eq!(result.reasons.len(), 1);
        assert!(result.reasons[0].starts_with("Facial signal warning"));
    }

    #[test]
    fn test_three_sigma_deviation_is_at_least_yellow() {
        let obs = [MetricObservation::new(METRIC_HEART_RATE, 76.0)];
        let result = run(
            SelfReport::default(),
            normal(),
            &obs,
            &[baseline(METRIC_HEART_RATE, 70.0, 2.0, 3)],
        );
        assert!(result.level >= TriageLevel::Yellow);
        assert!(result.reasons[0].contains(METRIC_HEART_RATE));
    }

    #[test]
    fn test_small_baseline_contributes_no_signal() {
        let obs = [MetricObservation::new(METRIC_HEART_RATE, 120.0)];
        let result = run(
            SelfReport::default(),
            normal(),
            &obs,
            &[baseline(METRIC_HEART_RATE, 70.0, 2.0, 2)],
        );
        assert_eq!(result.level, TriageLevel::Green);
    }

    #[test]
    fn test_deviation_uses_last_value_without_observation() {
        let mut record = baseline(METRIC_FACIAL_SYMMETRY, 0.05, 0.01, 8);
        record.last_value = Some(0.09);
        let result = run(SelfReport::default(), normal(), &[], &[record]);
        assert_eq!(result.level, TriageLevel::Yellow);
    }

    #[test]
    fn test_zero_spread_baseline_is_ignored() {
        let obs = [MetricObservation::new(METRIC_HEART_RATE, 90.0)];
        let result = run(
            SelfReport::default(),
            normal(),
            &obs,
            &[baseline(METRIC_HEART_RATE, 70.0, 0.0, 5)],
        );
        assert_eq!(result.level, TriageLevel::Green);
    }

    #[test]
    fn test_dizziness_alone_is_yellow() {
        let report = SelfReport {
            dizziness: Some(true),
            ..Default::default()
        };
        let result = run(report, FacialSignalResult::error("upload failed"), &[], &[]);
        assert_eq!(result.level, TriageLevel::Yellow);
        assert_eq!(result.reasons, vec!["Reported dizziness".to_string()]);
    }

    #[test]
    fn test_facial_status_parse() {
        assert_eq!(FacialStatus::parse("WARNING"), FacialStatus::Warn);
        assert_eq!(FacialStatus::parse("yellow"), FacialStatus::Warn);
        assert_eq!(FacialStatus::parse("Red"), FacialStatus::Alert);
        assert_eq!(FacialStatus::parse("GREEN"), FacialStatus::Normal);
        assert_eq!(FacialStatus::parse("retry"), FacialStatus::Error);
        assert_eq!(FacialStatus::parse("SKIPPED"), FacialStatus::Missing);
        assert_eq!(FacialStatus::parse("banana"), FacialStatus::Error);
    }

    #[test]
    fn test_level_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&TriageLevel::Yellow).unwrap(), "\"YELLOW\"");
    }
}
