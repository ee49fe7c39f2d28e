//! Run diagnostics: wall-clock timing and warning counts per stage.
//!
//! Every [`Pipeline::run`](crate::Pipeline::run) collects a
//! [`RunDiagnostics`] alongside the subject's data. Timestamps come from
//! `web-time`, which wraps `std::time::Instant` on native targets.
//!
//! Durations are serialized as fractional seconds (`f64`), since
//! `std::time::Duration` does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stages::StageName;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics for one subject run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Subject identifier.
    pub subject_id: String,
    /// Executed stages in order. A stage that failed is the last entry.
    pub stages: Vec<StageDiagnostics>,
    /// Wall-clock duration of the whole run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Which stage.
    pub stage: StageName,
    /// Wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Warnings the stage added to the subject.
    pub warnings: usize,
    /// Whether the stage returned successfully.
    pub succeeded: bool,
}

impl RunDiagnostics {
    /// Start diagnostics for a subject.
    #[must_use]
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..Self::default()
        }
    }

    /// Record one stage execution.
    pub fn record(&mut self, stage: StageName, duration: Duration, warnings: usize, succeeded: bool) {
        self.stages.push(StageDiagnostics {
            stage,
            duration,
            warnings,
            succeeded,
        });
    }

    /// Diagnostics for `stage`, if it ran.
    #[must_use]
    pub fn stage(&self, stage: StageName) -> Option<&StageDiagnostics> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Run Diagnostics: {}\n{}", self.subject_id, "=".repeat(60)));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for diag in &self.stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let status = if diag.succeeded { "ok" } else { "FAILED" };
            lines.push(format!(
                "{:<24} {ms:>8.3}ms {pct:>9.1}%  {status}, {} warning(s)",
                diag.stage.label(),
                diag.warnings,
            ));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn duration_ms_converts_correctly() {
        let ms = duration_ms(Duration::from_millis(1234));
        assert!((ms - 1234.0).abs() < 0.01);
    }

    #[test]
    fn report_lists_stages_in_order() {
        let mut diag = RunDiagnostics::new("sub-01");
        diag.record(StageName::SkullStripping, Duration::from_millis(30), 0, true);
        diag.record(StageName::Registration, Duration::from_millis(70), 1, false);
        diag.total_duration = Duration::from_millis(100);

        let report = diag.report();
        assert!(report.contains("Run Diagnostics: sub-01"));
        let skull = report.find("Skull stripping").unwrap();
        let reg = report.find("Registration").unwrap();
        assert!(skull < reg);
        assert!(report.contains("FAILED, 1 warning(s)"));
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let mut diag = RunDiagnostics::new("s");
        diag.record(StageName::QualityControl, Duration::from_millis(1500), 0, true);
        let json = serde_json::to_value(&diag).unwrap();
        assert!((json["stages"][0]["duration"].as_f64().unwrap() - 1.5).abs() < 1e-9);
        assert_eq!(json["stages"][0]["stage"], "quality_control");

        let back: RunDiagnostics = serde_json::from_value(json).unwrap();
        assert_eq!(back.stage(StageName::QualityControl).unwrap().duration, Duration::from_millis(1500));
    }
}
