//! [`ImageEngine`] implementation over the ANTs command-line tools.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

use ndarray::Array3;
use neuroprep_pipeline::{
    EngineError, ImageEngine, Interpolation, Modality, Registered, RegistrationParams, Segmented,
    TransformChain, TransformType, Volume,
};
use tempfile::TempDir;

use crate::commands::{
    RegistrationOutputs, apply_transforms_args, atropos_args, atropos_probability,
    registration_args, synthstrip_args,
};
use crate::error::AntsError;
use crate::nifti_io::{read_volume, write_volume};
use crate::tools::{self, AntsTools};

/// Engine that stages images as NIfTI in a scratch directory and runs the
/// ANTs tools on them.
///
/// Each call stages its inputs and outputs in a directory of its own that
/// is removed when the call returns. Transform files produced by
/// [`ImageEngine::register`] go to a per-subject directory instead and
/// stay valid until [`ImageEngine::finish_subject`].
#[derive(Debug)]
pub struct AntsEngine {
    tools: AntsTools,
    scratch: TempDir,
    subject: RefCell<Option<TempDir>>,
    next_id: Cell<usize>,
}

impl AntsEngine {
    /// Locate the tools on `ANTSPATH`/`PATH` and create a scratch directory.
    ///
    /// # Errors
    ///
    /// Returns [`AntsError::ToolNotFound`] if a required tool is missing,
    /// or [`AntsError::Io`] if the scratch directory cannot be created.
    pub fn discover() -> Result<Self, AntsError> {
        Self::with_tools(AntsTools::discover()?)
    }

    /// Use already-resolved tools.
    ///
    /// # Errors
    ///
    /// Returns [`AntsError::Io`] if the scratch directory cannot be created.
    pub fn with_tools(tools: AntsTools) -> Result<Self, AntsError> {
        let scratch = tempfile::Builder::new()
            .prefix("neuroprep-")
            .tempdir()
            .map_err(|source| AntsError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        tracing::debug!(scratch = %scratch.path().display(), "created scratch directory");
        Ok(Self {
            tools,
            scratch,
            subject: RefCell::new(None),
            next_id: Cell::new(0),
        })
    }

    /// The resolved tool paths.
    #[must_use]
    pub const fn tools(&self) -> &AntsTools {
        &self.tools
    }

    /// Root of every staged image and transform.
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    fn scratch_subdir(&self, prefix: &str) -> Result<TempDir, AntsError> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(self.scratch.path())
            .map_err(|source| AntsError::Io {
                path: self.scratch.path().to_path_buf(),
                source,
            })
    }

    /// Directory for files that must outlive one call, created on demand.
    fn subject_dir(&self) -> Result<PathBuf, AntsError> {
        let mut subject = self.subject.borrow_mut();
        if let Some(dir) = subject.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = self.scratch_subdir("subject-")?;
        let path = dir.path().to_path_buf();
        *subject = Some(dir);
        Ok(path)
    }

    /// A fresh path under `dir`; the numeric prefix keeps calls apart.
    fn scratch_path(&self, dir: &Path, name: &str) -> PathBuf {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        dir.join(format!("{id:04}_{name}"))
    }

    fn stage(&self, dir: &Path, volume: &Volume, name: &str) -> Result<PathBuf, AntsError> {
        let path = self.scratch_path(dir, &format!("{name}.nii.gz"));
        write_volume(volume, &path)?;
        Ok(path)
    }

    fn register_files(
        &self,
        fixed: &Volume,
        moving: &Volume,
        transform: TransformType,
        params: &RegistrationParams,
    ) -> Result<Registered, AntsError> {
        let call = self.scratch_subdir("register-")?;
        let fixed_path = self.stage(call.path(), fixed, "fixed")?;
        let moving_path = self.stage(call.path(), moving, "moving")?;
        let prefix = self.scratch_path(&self.subject_dir()?, "reg_");
        let args = registration_args(&fixed_path, &moving_path, &prefix, transform, params);
        tools::run(&self.tools.registration, &args)?;

        let outputs = RegistrationOutputs::new(&prefix);
        if let Some(missing) = outputs.expected(transform).into_iter().find(|p| !p.is_file()) {
            return Err(AntsError::MissingOutput(missing.to_path_buf()));
        }
        let warped = read_volume(&outputs.warped)?;
        discard(&outputs.warped);
        let (forward, inverse) = outputs.chains(transform);
        Ok(Registered {
            warped,
            forward,
            inverse,
        })
    }

    fn apply_files(
        &self,
        fixed: &Volume,
        moving: &Volume,
        transforms: &TransformChain,
        interpolation: Interpolation,
    ) -> Result<Volume, AntsError> {
        let call = self.scratch_subdir("apply-")?;
        let reference = self.stage(call.path(), fixed, "reference")?;
        let input = self.stage(call.path(), moving, "input")?;
        let output = self.scratch_path(call.path(), "resampled.nii.gz");
        let args = apply_transforms_args(&reference, &input, &output, transforms, interpolation);
        tools::run(&self.tools.apply_transforms, &args)?;
        read_output(&output)
    }

    fn segment_files(
        &self,
        image: &Volume,
        mask: Option<&Volume>,
        num_classes: usize,
    ) -> Result<Segmented, AntsError> {
        let call = self.scratch_subdir("segment-")?;
        let dir = call.path();
        let image_path = self.stage(dir, image, "segment_input")?;
        let mask_path = match mask {
            Some(mask) => self.stage(dir, mask, "segment_mask")?,
            None => self.stage(
                dir,
                &image.with_data(Array3::ones(image.data().raw_dim())),
                "segment_mask",
            )?,
        };
        let labels = self.scratch_path(dir, "segmentation.nii.gz");
        let prob_prefix = self.scratch_path(dir, "prob");
        let args = atropos_args(&image_path, &mask_path, num_classes, &labels, &prob_prefix);
        tools::run(&self.tools.atropos, &args)?;

        let mut probabilities = Vec::with_capacity(num_classes);
        for class in 1..=num_classes {
            let path = atropos_probability(&prob_prefix, class);
            if !path.is_file() {
                tracing::warn!(class, "Atropos wrote no probability map");
                break;
            }
            probabilities.push(read_volume(&path)?);
        }
        Ok(Segmented {
            labels: read_output(&labels)?,
            probabilities,
        })
    }

    fn synthstrip_files(&self, synthstrip: &Path, image: &Volume) -> Result<Volume, AntsError> {
        let call = self.scratch_subdir("strip-")?;
        let input = self.stage(call.path(), image, "strip_input")?;
        let mask = self.scratch_path(call.path(), "brain_mask.nii.gz");
        tools::run(synthstrip, &synthstrip_args(&input, &mask))?;
        let mask = read_output(&mask)?;
        // Binarise; some versions write 0/255.
        Ok(mask.threshold(f32::MIN_POSITIVE, f32::MAX))
    }
}

/// Best-effort removal; whatever remains goes with the subject directory.
fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!(path = %path.display(), error = %e, "could not remove scratch file");
    }
}

fn read_output(path: &Path) -> Result<Volume, AntsError> {
    if !path.is_file() {
        return Err(AntsError::MissingOutput(path.to_path_buf()));
    }
    read_volume(path)
}

impl ImageEngine for AntsEngine {
    fn name(&self) -> &str {
        "ants"
    }

    fn read_image(&self, path: &Path) -> Result<Volume, EngineError> {
        read_volume(path).map_err(|e| e.into_engine_error("read_image"))
    }

    fn write_image(&self, volume: &Volume, path: &Path) -> Result<(), EngineError> {
        write_volume(volume, path).map_err(|e| e.into_engine_error("write_image"))
    }

    fn register(
        &self,
        fixed: &Volume,
        moving: &Volume,
        transform: TransformType,
        params: &RegistrationParams,
    ) -> Result<Registered, EngineError> {
        tracing::debug!(%transform, "antsRegistration");
        self.register_files(fixed, moving, transform, params)
            .map_err(|e| e.into_engine_error("register"))
    }

    fn apply_transforms(
        &self,
        fixed: &Volume,
        moving: &Volume,
        transforms: &TransformChain,
        interpolation: Interpolation,
    ) -> Result<Volume, EngineError> {
        tracing::debug!(%interpolation, transforms = transforms.len(), "antsApplyTransforms");
        self.apply_files(fixed, moving, transforms, interpolation)
            .map_err(|e| e.into_engine_error("apply_transforms"))
    }

    fn segment(
        &self,
        image: &Volume,
        mask: Option<&Volume>,
        num_classes: usize,
    ) -> Result<Segmented, EngineError> {
        tracing::debug!(num_classes, masked = mask.is_some(), "Atropos");
        self.segment_files(image, mask, num_classes)
            .map_err(|e| e.into_engine_error("segment"))
    }

    fn finish_subject(&self, subject: &str) {
        let released = self.subject.borrow_mut().take();
        if let Some(dir) = released {
            tracing::debug!(subject, dir = %dir.path().display(), "releasing subject scratch");
            if let Err(e) = dir.close() {
                tracing::warn!(subject, error = %e, "could not remove subject scratch");
            }
        }
    }

    fn extract_brain_mask(
        &self,
        image: &Volume,
        modality: Modality,
    ) -> Result<Volume, EngineError> {
        let Some(synthstrip) = &self.tools.synthstrip else {
            return Err(EngineError::Unavailable(format!(
                "{} not found on PATH",
                tools::SYNTHSTRIP
            )));
        };
        // SynthStrip is contrast-agnostic.
        tracing::debug!(modality = modality.as_str(), "mri_synthstrip");
        self.synthstrip_files(synthstrip, image)
            .map_err(|e| e.into_engine_error("extract_brain_mask"))
    }
}
