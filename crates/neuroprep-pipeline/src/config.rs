//! Pipeline configuration.
//!
//! Deserialized from YAML or JSON. Every section and key is optional:
//! absent stage sections are disabled and unknown keys are ignored.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::stages::StageName;
use crate::types::{Modality, PipelineError, RegistrationParams};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run-wide settings.
    pub general: GeneralConfig,
    /// Where results go.
    pub output: OutputConfig,
    /// Brain extraction.
    pub skull_stripping: SkullStrippingConfig,
    /// Tissue classification.
    pub segmentation: SegmentationConfig,
    /// Alignment to the standard template.
    pub registration: RegistrationConfig,
    /// PET-to-MRI fusion.
    pub pet_processing: PetConfig,
    /// Atlas-based regional features.
    pub roi_extraction: RoiConfig,
    /// Quality metrics and report.
    pub quality_control: QcConfig,
}

/// Run-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Free-form configuration version, reported in the config summary.
    pub version: String,
    /// Reported in the config summary; stages use their own flags.
    pub save_intermediate: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_owned(),
            save_intermediate: false,
        }
    }
}

/// Output location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root directory; each subject gets a subdirectory.
    pub base_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("output"),
        }
    }
}

/// Skull-stripping stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkullStrippingConfig {
    /// Whether the stage runs.
    pub enabled: bool,
    /// Available methods.
    pub methods: SkullStrippingMethods,
    /// Save the stripped image after each method.
    pub save_intermediate: bool,
}

/// Brain extraction methods, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkullStrippingMethods {
    /// Learned brain extraction.
    pub antspynet: LearnedExtractionConfig,
    /// Intensity-threshold extraction.
    pub ants: ThresholdExtractionConfig,
}

/// Learned brain extraction parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedExtractionConfig {
    /// Whether the method runs.
    pub enabled: bool,
    /// Image contrast.
    pub modality: Modality,
}

/// Threshold brain extraction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdExtractionConfig {
    /// Whether the method runs.
    pub enabled: bool,
    /// Lowest intensity kept in the mask.
    pub threshold: f32,
}

impl Default for ThresholdExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.1,
        }
    }
}

/// Segmentation stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Whether the stage runs.
    pub enabled: bool,
    /// Available methods.
    pub methods: SegmentationMethods,
    /// Save labels and probability maps.
    pub save_intermediate: bool,
}

/// Tissue classification methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationMethods {
    /// Atropos-style k-means classification.
    pub atropos: AtroposConfig,
}

/// Atropos parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtroposConfig {
    /// Whether the method runs.
    pub enabled: bool,
    /// Number of tissue classes.
    pub num_classes: usize,
}

impl Default for AtroposConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            num_classes: 3,
        }
    }
}

/// Registration stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Whether the stage runs.
    pub enabled: bool,
    /// Template image path.
    pub template: PathBuf,
    /// Available transform models.
    pub methods: RegistrationMethods,
    /// Save the warped image.
    pub save_intermediate: bool,
}

/// Transform models. At most one is used; see the registration stage for
/// precedence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationMethods {
    /// Non-linear.
    pub syn: SynConfig,
    /// Affine.
    pub affine: Toggle,
    /// Rigid.
    pub rigid: Toggle,
}

/// Non-linear registration parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynConfig {
    /// Whether the model is enabled.
    pub enabled: bool,
    /// Solver parameters.
    #[serde(flatten)]
    pub params: RegistrationParams,
}

/// A method with no parameters besides its switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggle {
    /// Whether the method is enabled.
    pub enabled: bool,
}

/// PET fusion stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PetConfig {
    /// Whether the stage runs.
    pub enabled: bool,
    /// Save registered and masked PET.
    pub save_intermediate: bool,
}

/// A per-region statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    /// Mean probability.
    Mean,
    /// Population standard deviation of probability.
    Std,
    /// Region size in voxels.
    Volume,
    /// Median probability.
    Median,
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mean => "mean",
            Self::Std => "std",
            Self::Volume => "volume",
            Self::Median => "median",
        })
    }
}

/// ROI extraction stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    /// Whether the stage runs.
    pub enabled: bool,
    /// Atlas label image path.
    pub atlas_path: PathBuf,
    /// Atlas name used in output filenames.
    pub atlas: String,
    /// Statistics per region, in column order.
    pub statistics: Vec<Statistic>,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            atlas_path: PathBuf::new(),
            atlas: "atlas".to_owned(),
            statistics: vec![Statistic::Mean],
        }
    }
}

/// Quality control stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// Whether the stage runs.
    pub enabled: bool,
    /// Reference template for registration quality.
    pub template: Option<PathBuf>,
    /// Warning thresholds.
    pub thresholds: QcThresholds,
    /// Write a text report.
    pub generate_report: bool,
}

/// Lower bounds that raise warnings when crossed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcThresholds {
    /// Minimum acceptable SNR.
    pub snr_min: Option<f64>,
    /// Minimum acceptable registration mutual information.
    pub registration_mi_min: Option<f64>,
}

/// Condensed view of a configuration for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSummary {
    /// Configuration version.
    pub version: String,
    /// Stages that will run, in execution order.
    pub enabled_steps: Vec<StageName>,
    /// Output root.
    pub output_dir: PathBuf,
    /// Global intermediate-saving flag.
    pub save_intermediate: bool,
}

impl PipelineConfig {
    /// Parse YAML.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the text is not valid YAML for
    /// this schema.
    pub fn from_yaml_str(text: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(text).map_err(|e| PipelineError::Config(format!("invalid YAML: {e}")))
    }

    /// Parse JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the text is not valid JSON for
    /// this schema.
    pub fn from_json_str(text: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(text).map_err(|e| PipelineError::Config(format!("invalid JSON: {e}")))
    }

    /// Load from a file, choosing JSON for `.json` and YAML otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if the file cannot be read, or
    /// [`PipelineError::Config`] if it does not parse.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    /// Whether a stage is switched on.
    #[must_use]
    pub const fn is_enabled(&self, stage: StageName) -> bool {
        match stage {
            StageName::SkullStripping => self.skull_stripping.enabled,
            StageName::Segmentation => self.segmentation.enabled,
            StageName::Registration => self.registration.enabled,
            StageName::PetProcessing => self.pet_processing.enabled,
            StageName::RoiExtraction => self.roi_extraction.enabled,
            StageName::QualityControl => self.quality_control.enabled,
        }
    }

    /// Check settings that can be judged without touching the filesystem.
    ///
    /// Method selection and resource existence are checked when the stage
    /// runs.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.registration.enabled && self.registration.template.as_os_str().is_empty() {
            return Err(PipelineError::Config(
                "registration is enabled but no template is configured".to_owned(),
            ));
        }
        if self.roi_extraction.enabled {
            if self.roi_extraction.atlas_path.as_os_str().is_empty() {
                return Err(PipelineError::Config(
                    "roi_extraction is enabled but no atlas_path is configured".to_owned(),
                ));
            }
            if self.roi_extraction.statistics.is_empty() {
                return Err(PipelineError::Config(
                    "roi_extraction.statistics must name at least one statistic".to_owned(),
                ));
            }
        }
        if self.segmentation.enabled && self.segmentation.methods.atropos.num_classes == 0 {
            return Err(PipelineError::Config(
                "segmentation.methods.atropos.num_classes must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Condensed view for display.
    #[must_use]
    pub fn config_summary(&self) -> ConfigSummary {
        ConfigSummary {
            version: self.general.version.clone(),
            enabled_steps: StageName::ORDER
                .into_iter()
                .filter(|&s| self.is_enabled(s))
                .collect(),
            output_dir: self.output.base_dir.clone(),
            save_intermediate: self.general.save_intermediate,
        }
    }
}
