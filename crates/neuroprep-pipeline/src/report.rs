//! Plain-text reports: processing summary, final summary and QC report.
//!
//! These are pure functions of a subject's [`ProcessingData`]; callers
//! decide where the text goes.

use std::collections::BTreeMap;

use crate::data::{Field, ProcessingData};
use crate::layout::{
    FINAL_FIELDS, feature_file_name, final_field_name, pet_skull_stripped_name, pet_template_name,
};

/// Bookkeeping metric left out of every report.
const HIDDEN_METRIC: &str = "num_steps";

const fn yes_no(flag: bool) -> &'static str {
    if flag { "Yes" } else { "No" }
}

fn steps(data: &ProcessingData, separator: &str) -> String {
    data.processing_steps()
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(separator)
}

fn metric_lines(metrics: &BTreeMap<String, f64>) -> impl Iterator<Item = String> + '_ {
    metrics
        .iter()
        .filter(|(key, _)| key.as_str() != HIDDEN_METRIC)
        .map(|(key, value)| format!("{key}: {value}"))
}

fn finish(lines: Vec<String>) -> String {
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// Summary written next to the stage outputs.
#[must_use]
pub fn summary(data: &ProcessingData) -> String {
    let mut lines = vec![
        "Preprocessing Summary".to_owned(),
        "=".repeat(60),
        String::new(),
        format!("Subject ID: {}", data.subject_id()),
        format!("Processing Steps: {}", data.processing_steps().len()),
        format!("Steps: {}", steps(data, " -> ")),
        String::new(),
        "Results:".to_owned(),
        "-".repeat(60),
        format!("Brain extraction: {}", yes_no(data.has_brain_extraction())),
        format!("Registration: {}", yes_no(data.has_registration())),
        format!("Segmentation: {}", yes_no(data.has_segmentation())),
        format!(
            "ROI features: {}",
            yes_no(data.template().roi_features().is_some())
        ),
    ];

    if !data.qc_metrics().is_empty() {
        lines.push(String::new());
        lines.push("Quality Metrics:".to_owned());
        lines.push("-".repeat(60));
        lines.extend(metric_lines(data.qc_metrics()));
    }

    if !data.warnings().is_empty() {
        lines.push(String::new());
        lines.push(format!("Warnings ({}):", data.warnings().len()));
        lines.push("-".repeat(60));
        lines.extend(data.warnings().iter().map(|w| format!("- {w}")));
    }

    finish(lines)
}

/// Summary written to `final/`, listing the exported files.
#[must_use]
pub fn final_summary(data: &ProcessingData) -> String {
    let subject = data.subject_id();
    let mut lines = vec![
        "Final Processing Results".to_owned(),
        "=".repeat(60),
        String::new(),
        format!("Subject ID: {subject}"),
        format!("Processing Steps: {}", steps(data, " -> ")),
        String::new(),
        "Final Outputs (MNI Space):".to_owned(),
        "-".repeat(60),
    ];
    for field in FINAL_FIELDS {
        if data.template().get(field).is_some() {
            lines.push(format!(
                "{}: {}",
                output_label(field),
                final_field_name(subject, field)
            ));
        }
    }

    if let Some(pet) = data.pet()
        && (pet.template().is_some() || pet.skull_stripped().is_some())
    {
        lines.push(String::new());
        lines.push("PET Results:".to_owned());
        if pet.template().is_some() {
            lines.push(format!("PET MNI: {}", pet_template_name(subject)));
        }
        if pet.skull_stripped().is_some() {
            lines.push(format!(
                "PET Skull-stripped: {}",
                pet_skull_stripped_name(subject)
            ));
        }
    }

    if let Some(features) = data.template().roi_features()
        && !features.is_empty()
    {
        lines.push(String::new());
        lines.push("ROI Features:".to_owned());
        lines.extend(
            features
                .keys()
                .map(|name| format!("  - {}", feature_file_name(subject, name))),
        );
    }

    if !data.qc_metrics().is_empty() {
        lines.push(String::new());
        lines.push("Quality Metrics:".to_owned());
        lines.push("-".repeat(60));
        lines.extend(metric_lines(data.qc_metrics()));
    }

    finish(lines)
}

/// Report written by the quality control stage.
#[must_use]
pub fn qc_report(data: &ProcessingData) -> String {
    let mut lines = vec![
        "Quality Control Report".to_owned(),
        "=".repeat(50),
        String::new(),
        format!("Subject ID: {}", data.subject_id()),
        format!("Processing Steps: {}", steps(data, ", ")),
        String::new(),
        "Quality Metrics:".to_owned(),
        "-".repeat(50),
    ];
    lines.extend(metric_lines(data.qc_metrics()));
    finish(lines)
}

const fn output_label(field: Field) -> &'static str {
    match field {
        Field::Image => "T1 Image",
        Field::BrainMask => "Brain Mask",
        Field::SegmentationLabels => "Segmentation",
        Field::GmProbability => "GM Probability",
        Field::WmProbability => "WM Probability",
        Field::CsfProbability => "CSF Probability",
    }
}
