//! Subject-level orchestration.
//!
//! A [`Pipeline`] owns a validated configuration, an engine, and one
//! instance of every enabled stage. [`Pipeline::run`] loads a subject,
//! drives the stages in their fixed order, and exports the results:
//!
//! ```rust
//! # use neuroprep_pipeline::{Pipeline, PipelineConfig, PipelineError, SubjectInput};
//! # use neuroprep_pipeline::testing::{MemoryEngine, synthetic_head};
//! # fn run() -> Result<(), PipelineError> {
//! let engine = MemoryEngine::new();
//! engine.insert("/virtual/sub-01_T1.nii.gz", synthetic_head());
//!
//! let out = tempfile::tempdir().map_err(|e| PipelineError::io("tmp", e))?;
//! let mut config = PipelineConfig::default();
//! config.output.base_dir = out.path().to_path_buf();
//! config.skull_stripping.enabled = true;
//! config.skull_stripping.methods.antspynet.enabled = true;
//!
//! let mut pipeline = Pipeline::new(config, engine)?;
//! let outcome = pipeline.run(&SubjectInput::new("sub-01", "/virtual/sub-01_T1.nii.gz"), None)?;
//! assert!(outcome.data.has_brain_extraction());
//! # Ok(())
//! # }
//! # run().unwrap();
//! ```
//!
//! Stage errors abandon the subject and propagate; nothing is rolled back.

use std::path::{Path, PathBuf};

use crate::config::{ConfigSummary, PipelineConfig};
use crate::data::{ProcessingData, WarningKind};
use crate::diagnostics::RunDiagnostics;
use crate::engine::ImageEngine;
use crate::layout::{
    FINAL_FIELDS, OutputLayout, feature_file_name, final_field_name, final_summary_name,
    pet_skull_stripped_name, pet_template_name, summary_name,
};
use crate::report;
use crate::stages::roi::save_features;
use crate::stages::{Stage, StageName};
use crate::types::PipelineError;

/// Input files for one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectInput {
    /// Subject identifier; names the output directory.
    pub subject_id: String,
    /// Primary MRI image.
    pub mri: PathBuf,
    /// Optional PET image.
    pub pet: Option<PathBuf>,
}

impl SubjectInput {
    /// An MRI-only subject.
    #[must_use]
    pub fn new(subject_id: impl Into<String>, mri: impl Into<PathBuf>) -> Self {
        Self {
            subject_id: subject_id.into(),
            mri: mri.into(),
            pet: None,
        }
    }

    /// Attach a PET image.
    #[must_use]
    pub fn with_pet(mut self, pet: impl Into<PathBuf>) -> Self {
        self.pet = Some(pet.into());
        self
    }
}

/// Result of a successful subject run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Final state of the subject. Transform files named by its
    /// registration chains may already be released by the engine.
    pub data: ProcessingData,
    /// Per-stage timings.
    pub diagnostics: RunDiagnostics,
    /// Files written to `final/`, in write order.
    pub final_outputs: Vec<PathBuf>,
}

/// Configured preprocessing pipeline.
#[derive(Debug)]
pub struct Pipeline<E> {
    config: PipelineConfig,
    engine: E,
    layout: OutputLayout,
    stages: Vec<Stage>,
}

impl<E: ImageEngine> Pipeline<E> {
    /// Validate `config` and build its enabled stages.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the configuration is invalid.
    pub fn new(config: PipelineConfig, engine: E) -> Result<Self, PipelineError> {
        config.validate()?;
        let stages = Stage::from_config(&config);
        let layout = OutputLayout::new(&config.output.base_dir);
        tracing::info!(
            engine = engine.name(),
            stages = ?stages.iter().map(Stage::name).collect::<Vec<_>>(),
            "pipeline ready"
        );
        Ok(Self {
            config,
            engine,
            layout,
            stages,
        })
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The engine stages run on.
    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Output directory layout.
    #[must_use]
    pub const fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Enabled stages, in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Condensed configuration view.
    #[must_use]
    pub fn config_summary(&self) -> ConfigSummary {
        self.config.config_summary()
    }

    /// Process one subject.
    ///
    /// Stage outputs go to `output_dir` when given, otherwise to the
    /// subject's `intermediate/` directory; quality control always writes
    /// to `qc/`. A PET path that does not exist is warned about and the
    /// subject continues MRI-only.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputNotFound`] if the MRI is missing, the
    /// first stage error, or an I/O error while exporting.
    pub fn run(
        &mut self,
        input: &SubjectInput,
        output_dir: Option<&Path>,
    ) -> Result<RunOutcome, PipelineError> {
        let result = self.process(input, output_dir);
        self.engine.finish_subject(&input.subject_id);
        result
    }

    fn process(
        &mut self,
        input: &SubjectInput,
        output_dir: Option<&Path>,
    ) -> Result<RunOutcome, PipelineError> {
        let started = web_time::Instant::now();
        let subject = input.subject_id.as_str();
        tracing::info!(subject, mri = %input.mri.display(), "processing subject");

        if !self.engine.image_exists(&input.mri) {
            return Err(PipelineError::InputNotFound(input.mri.clone()));
        }
        let image = self.engine.read_image(&input.mri)?;
        tracing::info!(subject, shape = ?image.shape(), "loaded MRI");
        let mut data = ProcessingData::new(subject, image);

        if let Some(pet_path) = &input.pet {
            if self.engine.image_exists(pet_path) {
                let pet = self.engine.read_image(pet_path)?;
                tracing::info!(subject, shape = ?pet.shape(), "loaded PET");
                data = data.with_pet(pet);
            } else {
                data.warn(
                    None,
                    WarningKind::MissingInput,
                    format!("PET file not found: {}", pet_path.display()),
                );
            }
        }

        let stage_dir = output_dir.map_or_else(|| self.layout.intermediate_dir(subject), Path::to_path_buf);
        self.layout.create_subject_dirs(subject)?;
        std::fs::create_dir_all(&stage_dir).map_err(|e| PipelineError::io(&stage_dir, e))?;
        let qc_dir = self.layout.qc_dir(subject);

        let mut diagnostics = RunDiagnostics::new(subject);
        for stage in &mut self.stages {
            let name = stage.name();
            let dir = if name == StageName::QualityControl {
                &qc_dir
            } else {
                &stage_dir
            };
            tracing::info!(subject, stage = %name, "starting {}", name.label());
            let stage_start = web_time::Instant::now();
            let warnings_before = data.warnings().len();
            let result = stage.run(&self.engine, &mut data, Some(dir));
            diagnostics.record(
                name,
                stage_start.elapsed(),
                data.warnings().len() - warnings_before,
                result.is_ok(),
            );
            if let Err(e) = result {
                tracing::error!(subject, stage = %name, error = %e, "stage failed");
                return Err(e);
            }
            tracing::info!(subject, stage = %name, "completed");
        }

        write_text(&stage_dir.join(summary_name(subject)), &report::summary(&data))?;
        let final_outputs = self.export_final(&data)?;

        diagnostics.total_duration = started.elapsed();
        let steps: Vec<&str> = data.processing_steps().iter().map(|s| s.as_str()).collect();
        tracing::info!(
            subject,
            steps = %steps.join(" -> "),
            warnings = data.warnings().len(),
            "pipeline completed"
        );
        tracing::debug!("\n{}", diagnostics.report());

        Ok(RunOutcome {
            data,
            diagnostics,
            final_outputs,
        })
    }

    /// Write template-space results, ROI features, PET results and the
    /// final summary to `final/`.
    fn export_final(&self, data: &ProcessingData) -> Result<Vec<PathBuf>, PipelineError> {
        let subject = data.subject_id();
        let dir = self.layout.final_dir(subject);
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        let mut written = Vec::new();

        for field in FINAL_FIELDS {
            if let Some(volume) = data.template().get(field) {
                let path = dir.join(final_field_name(subject, field));
                self.engine.write_image(volume, &path)?;
                written.push(path);
            }
        }

        if let Some(features) = data.template().roi_features() {
            for (name, array) in features {
                let path = dir.join(feature_file_name(subject, name));
                save_features(&path, array)?;
                written.push(path);
            }
        }

        if let Some(pet) = data.pet() {
            let outputs = [
                (pet.template(), pet_template_name(subject)),
                (pet.skull_stripped(), pet_skull_stripped_name(subject)),
            ];
            for (volume, name) in outputs {
                if let Some(volume) = volume {
                    let path = dir.join(name);
                    self.engine.write_image(volume, &path)?;
                    written.push(path);
                }
            }
        }

        let summary = dir.join(final_summary_name(subject));
        write_text(&summary, &report::final_summary(data))?;
        written.push(summary);

        for path in &written {
            tracing::debug!(path = %path.display(), "exported");
        }
        tracing::info!(subject, dir = %dir.display(), files = written.len(), "final results saved");
        Ok(written)
    }
}

fn write_text(path: &Path, text: &str) -> Result<(), PipelineError> {
    std::fs::write(path, text).map_err(|e| PipelineError::io(path, e))
}
