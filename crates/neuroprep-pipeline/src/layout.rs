//! Per-subject output directories and artifact file names.

use std::path::{Path, PathBuf};

use crate::data::Field;
use crate::types::PipelineError;

/// Template-space fields exported to `final/`, in write order.
pub const FINAL_FIELDS: [Field; 6] = [
    Field::Image,
    Field::BrainMask,
    Field::GmProbability,
    Field::WmProbability,
    Field::CsfProbability,
    Field::SegmentationLabels,
];

/// `<base>/<subject>/{intermediate,final,qc,logs}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    base_dir: PathBuf,
}

impl OutputLayout {
    /// Layout rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base>/<subject>`.
    #[must_use]
    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.base_dir.join(subject)
    }

    /// Default stage output directory.
    #[must_use]
    pub fn intermediate_dir(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject).join("intermediate")
    }

    /// Exported template-space results.
    #[must_use]
    pub fn final_dir(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject).join("final")
    }

    /// Quality control output.
    #[must_use]
    pub fn qc_dir(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject).join("qc")
    }

    #[must_use]
    pub fn logs_dir(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject).join("logs")
    }

    /// Create all four subject directories.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if a directory cannot be created.
    pub fn create_subject_dirs(&self, subject: &str) -> Result<(), PipelineError> {
        for dir in [
            self.intermediate_dir(subject),
            self.final_dir(subject),
            self.qc_dir(subject),
            self.logs_dir(subject),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        }
        Ok(())
    }
}

/// File name of an exported template-space field.
#[must_use]
pub fn final_field_name(subject: &str, field: Field) -> String {
    let stem = match field {
        Field::Image => "T1_MNI",
        Field::BrainMask => "brain_mask_MNI",
        Field::SegmentationLabels => "segmentation_MNI",
        Field::GmProbability => "GM_probability_MNI",
        Field::WmProbability => "WM_probability_MNI",
        Field::CsfProbability => "CSF_probability_MNI",
    };
    format!("{subject}_{stem}.nii.gz")
}

/// File name of an exported ROI feature array.
#[must_use]
pub fn feature_file_name(subject: &str, feature: &str) -> String {
    format!("{subject}_{feature}.npy")
}

#[must_use]
pub fn pet_template_name(subject: &str) -> String {
    format!("{subject}_PET_MNI.nii.gz")
}

#[must_use]
pub fn pet_skull_stripped_name(subject: &str) -> String {
    format!("{subject}_PET_skull_stripped.nii.gz")
}

/// Processing summary, written to the stage output directory.
#[must_use]
pub fn summary_name(subject: &str) -> String {
    format!("{subject}_summary.txt")
}

/// Final summary, written to `final/`.
#[must_use]
pub fn final_summary_name(subject: &str) -> String {
    format!("{subject}_final_summary.txt")
}
