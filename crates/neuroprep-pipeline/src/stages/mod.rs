//! Processing stages and their fixed execution order.
//!
//! Each [`Stage`] variant wraps one stage implementation. Stages read and
//! write a subject's [`ProcessingData`] in place and are configured
//! independently; the only state they keep between subjects is a lazily
//! loaded reference image (template or atlas).

pub mod pet;
pub mod quality;
pub mod registration;
pub mod roi;
pub mod segmentation;
pub mod skull_strip;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::data::ProcessingData;
use crate::engine::ImageEngine;
use crate::types::{PipelineError, Volume};

pub use pet::PetProcessing;
pub use quality::{QcReport, QualityControl};
pub use registration::{Registration, select_transform};
pub use roi::RoiExtraction;
pub use segmentation::{Segmentation, SegmentationPath, fallback_segmentation};
pub use skull_strip::SkullStripping;

/// Identifier of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Brain extraction.
    SkullStripping,
    /// Tissue classification.
    Segmentation,
    /// Alignment to the template.
    Registration,
    /// PET-to-MRI fusion.
    PetProcessing,
    /// Atlas-based regional features.
    RoiExtraction,
    /// Quality metrics.
    QualityControl,
}

impl StageName {
    /// All stages in execution order.
    ///
    /// Segmentation runs before registration so that tissue maps are
    /// produced in native space and carried across by registration.
    pub const ORDER: [Self; 6] = [
        Self::SkullStripping,
        Self::Segmentation,
        Self::Registration,
        Self::PetProcessing,
        Self::RoiExtraction,
        Self::QualityControl,
    ];

    /// Key used in configuration and the processing log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SkullStripping => "skull_stripping",
            Self::Segmentation => "segmentation",
            Self::Registration => "registration",
            Self::PetProcessing => "pet_processing",
            Self::RoiExtraction => "roi_extraction",
            Self::QualityControl => "quality_control",
        }
    }

    /// Human-readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SkullStripping => "Skull stripping",
            Self::Segmentation => "Segmentation",
            Self::Registration => "Registration",
            Self::PetProcessing => "PET processing",
            Self::RoiExtraction => "ROI extraction",
            Self::QualityControl => "Quality control",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured stage.
#[derive(Debug)]
pub enum Stage {
    /// See [`SkullStripping`].
    SkullStripping(SkullStripping),
    /// See [`Segmentation`].
    Segmentation(Segmentation),
    /// See [`Registration`].
    Registration(Registration),
    /// See [`PetProcessing`].
    PetProcessing(PetProcessing),
    /// See [`RoiExtraction`].
    RoiExtraction(RoiExtraction),
    /// See [`QualityControl`].
    QualityControl(QualityControl),
}

impl Stage {
    /// Build a stage from its configuration section.
    #[must_use]
    pub fn new(name: StageName, config: &PipelineConfig) -> Self {
        match name {
            StageName::SkullStripping => {
                Self::SkullStripping(SkullStripping::new(&config.skull_stripping))
            }
            StageName::Segmentation => Self::Segmentation(Segmentation::new(&config.segmentation)),
            StageName::Registration => Self::Registration(Registration::new(&config.registration)),
            StageName::PetProcessing => {
                Self::PetProcessing(PetProcessing::new(&config.pet_processing))
            }
            StageName::RoiExtraction => {
                Self::RoiExtraction(RoiExtraction::new(&config.roi_extraction))
            }
            StageName::QualityControl => {
                Self::QualityControl(QualityControl::new(&config.quality_control))
            }
        }
    }

    /// Every enabled stage, in execution order.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Vec<Self> {
        StageName::ORDER
            .into_iter()
            .filter(|&name| config.is_enabled(name))
            .map(|name| Self::new(name, config))
            .collect()
    }

    /// Which stage this is.
    #[must_use]
    pub const fn name(&self) -> StageName {
        match self {
            Self::SkullStripping(_) => StageName::SkullStripping,
            Self::Segmentation(_) => StageName::Segmentation,
            Self::Registration(_) => StageName::Registration,
            Self::PetProcessing(_) => StageName::PetProcessing,
            Self::RoiExtraction(_) => StageName::RoiExtraction,
            Self::QualityControl(_) => StageName::QualityControl,
        }
    }

    /// Run the stage against one subject.
    ///
    /// On success the stage has appended its name to the processing log,
    /// except PET processing for a subject without PET.
    ///
    /// # Errors
    ///
    /// Returns the stage's [`PipelineError`]; the subject should be
    /// abandoned.
    pub fn run(
        &mut self,
        engine: &dyn ImageEngine,
        data: &mut ProcessingData,
        output_dir: Option<&Path>,
    ) -> Result<(), PipelineError> {
        match self {
            Self::SkullStripping(stage) => stage.run(engine, data, output_dir),
            Self::Segmentation(stage) => stage.run(engine, data, output_dir),
            Self::Registration(stage) => stage.run(engine, data, output_dir),
            Self::PetProcessing(stage) => stage.run(engine, data, output_dir),
            Self::RoiExtraction(stage) => stage.run(engine, data, output_dir),
            Self::QualityControl(stage) => stage.run(engine, data, output_dir).map(|_| ()),
        }
    }
}

/// Write a volume through the engine, creating the parent directory.
pub(crate) fn write_artifact(
    engine: &dyn ImageEngine,
    volume: &Volume,
    path: &Path,
) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    engine.write_image(volume, path)?;
    tracing::debug!(path = %path.display(), "saved");
    Ok(())
}

/// Load a reference image once and keep it.
pub(crate) fn cached_resource<'a>(
    cache: &'a mut Option<Volume>,
    engine: &dyn ImageEngine,
    path: &Path,
    kind: &'static str,
) -> Result<&'a Volume, PipelineError> {
    let missing = || PipelineError::MissingResource {
        kind,
        path: path.to_path_buf(),
    };
    if cache.is_none() {
        if !engine.image_exists(path) {
            return Err(missing());
        }
        let volume = engine.read_image(path)?;
        tracing::info!(kind, path = %path.display(), shape = ?volume.shape(), "loaded");
        *cache = Some(volume);
    }
    cache.as_ref().ok_or_else(missing)
}
