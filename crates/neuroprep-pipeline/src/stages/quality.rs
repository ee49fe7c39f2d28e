//! Quality metrics. Never fatal: anything that cannot be measured is
//! left out, and threshold violations only raise warnings.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::config::QcConfig;
use crate::data::{Field, ProcessingData, WarningKind};
use crate::engine::ImageEngine;
use crate::report;
use crate::stages::{StageName, cached_resource};
use crate::stats;
use crate::types::{PipelineError, Volume};

/// Metrics and threshold violations from one QC run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QcReport {
    /// Metric name to value.
    pub metrics: BTreeMap<String, f64>,
    /// Human-readable threshold violations.
    pub violations: Vec<String>,
}

impl QcReport {
    /// Returns `true` if every configured threshold was met.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Tissue maps whose supra-threshold voxel counts are reported.
const VOLUMES: [(Field, &str); 3] = [
    (Field::GmProbability, "gm_volume"),
    (Field::WmProbability, "wm_volume"),
    (Field::CsfProbability, "csf_volume"),
];

/// Quality control stage.
#[derive(Debug)]
pub struct QualityControl {
    config: QcConfig,
    reference: Option<Volume>,
    last_report: Option<QcReport>,
}

impl QualityControl {
    /// Build from configuration. The reference template is loaded on first
    /// use.
    #[must_use]
    pub fn new(config: &QcConfig) -> Self {
        Self {
            config: config.clone(),
            reference: None,
            last_report: None,
        }
    }

    /// Report from the most recent run.
    #[must_use]
    pub const fn last_report(&self) -> Option<&QcReport> {
        self.last_report.as_ref()
    }

    /// Compute metrics, replace the subject's QC metrics, and check
    /// thresholds.
    ///
    /// # Errors
    ///
    /// Returns an engine error only if one escapes a metric computation;
    /// unavailable metrics are warned about and omitted.
    pub fn run(
        &mut self,
        engine: &dyn ImageEngine,
        data: &mut ProcessingData,
        output_dir: Option<&Path>,
    ) -> Result<QcReport, PipelineError> {
        tracing::info!(subject = data.subject_id(), "computing quality metrics");
        let mut metrics = BTreeMap::new();

        if let Some(snr) = snr(data) {
            metrics.insert("snr".to_owned(), snr);
        }

        if data.has_registration() {
            match self.registration_mi(engine, data) {
                Ok(Some(mi)) => {
                    metrics.insert("registration_mi".to_owned(), mi);
                }
                Ok(None) => {}
                Err((kind, message)) => {
                    data.warn(Some(StageName::QualityControl), kind, message);
                }
            }
        }

        let space = |field| {
            if data.has_registration() {
                data.template().get(field)
            } else {
                data.native().get(field)
            }
        };
        for (field, key) in VOLUMES {
            if let Some(map) = space(field) {
                #[allow(clippy::cast_precision_loss)]
                metrics.insert(key.to_owned(), map.count_above(0.5) as f64);
            }
        }

        #[allow(clippy::cast_precision_loss)]
        metrics.insert("num_steps".to_owned(), data.processing_steps().len() as f64);

        data.replace_qc_metrics(metrics.clone());
        data.record_step(StageName::QualityControl);

        if self.config.generate_report
            && let Some(dir) = output_dir
            && let Err(e) = write_report(data, dir)
        {
            data.warn(
                Some(StageName::QualityControl),
                WarningKind::ArtifactNotSaved,
                e.to_string(),
            );
        }

        let violations = self.check_thresholds(&metrics);
        for violation in &violations {
            data.warn(
                Some(StageName::QualityControl),
                WarningKind::QualityThreshold,
                violation.clone(),
            );
        }
        if violations.is_empty() {
            tracing::info!(subject = data.subject_id(), "all quality checks passed");
        }

        let report = QcReport {
            metrics,
            violations,
        };
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// `Ok(None)` when no reference template is configured.
    fn registration_mi(
        &mut self,
        engine: &dyn ImageEngine,
        data: &ProcessingData,
    ) -> Result<Option<f64>, (WarningKind, String)> {
        let Some(path) = &self.config.template else {
            return Ok(None);
        };
        let Some(image) = data.template().get(Field::Image) else {
            return Ok(None);
        };
        let reference = cached_resource(&mut self.reference, engine, path, "QC template")
            .map_err(|e| (WarningKind::MissingReference, e.to_string()))?;
        engine
            .mutual_information(image, reference)
            .map(Some)
            .map_err(|e| {
                (
                    WarningKind::MetricUnavailable,
                    format!("registration MI unavailable: {e}"),
                )
            })
    }

    fn check_thresholds(&self, metrics: &BTreeMap<String, f64>) -> Vec<String> {
        let thresholds = self.config.thresholds;
        let mut violations = Vec::new();
        if let (Some(&snr), Some(min)) = (metrics.get("snr"), thresholds.snr_min)
            && snr < min
        {
            violations.push(format!("SNR ({snr:.2}) below threshold ({min})"));
        }
        if let (Some(&mi), Some(min)) = (
            metrics.get("registration_mi"),
            thresholds.registration_mi_min,
        ) && mi < min
        {
            violations.push(format!("Registration MI ({mi:.4}) below threshold ({min})"));
        }
        violations
    }
}

/// Mean of the original native image inside the brain mask over its
/// population standard deviation outside it.
///
/// The working image is zero outside the mask once skull stripping has
/// run, so the unmodified scan is measured instead.
fn snr(data: &ProcessingData) -> Option<f64> {
    let mask = data.native().get(Field::BrainMask)?;
    let image = data.native().original_image();
    if mask.shape() != image.shape() {
        return None;
    }

    let mut inside = Vec::new();
    let mut outside = Vec::new();
    for (&m, &v) in mask.data().iter().zip(image.data()) {
        if m > 0.0 {
            inside.push(f64::from(v));
        } else {
            outside.push(f64::from(v));
        }
    }
    let signal = stats::mean(&inside)?;
    let noise = stats::std_dev(&outside)?;
    (noise > 0.0).then(|| signal / noise)
}

fn write_report(data: &ProcessingData, dir: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    let path = dir.join(format!("{}_qc_report.txt", data.subject_id()));
    std::fs::write(&path, report::qc_report(data)).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(path = %path.display(), "saved QC report");
    Ok(())
}
