//! Space-aware per-subject state.
//!
//! [`ProcessingData`] holds everything known about one subject while the
//! pipeline runs. Fields are bound to a space by construction: native
//! fields live in [`NativeSpace`], template fields in [`TemplateSpace`],
//! and the only way between them is [`ProcessingData::transform_to_template`].
//! Template-space writes are refused until registration has installed a
//! native-to-template transform.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::ArrayD;
use serde::Serialize;

use crate::engine::ImageEngine;
use crate::stages::StageName;
use crate::types::{Interpolation, PipelineError, Registered, TransformChain, Volume};

/// Image-valued fields that exist in both spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Working intensity image.
    Image,
    /// Binary brain mask.
    BrainMask,
    /// Hard tissue labels.
    SegmentationLabels,
    /// Grey matter probability.
    GmProbability,
    /// White matter probability.
    WmProbability,
    /// Cerebrospinal fluid probability.
    CsfProbability,
}

impl Field {
    /// Every field.
    pub const ALL: [Self; 6] = [
        Self::Image,
        Self::BrainMask,
        Self::SegmentationLabels,
        Self::GmProbability,
        Self::WmProbability,
        Self::CsfProbability,
    ];

    /// Fields carried into template space after registration. The image
    /// itself is produced by the registration call.
    pub const PROPAGATED: [Self; 5] = [
        Self::BrainMask,
        Self::SegmentationLabels,
        Self::GmProbability,
        Self::WmProbability,
        Self::CsfProbability,
    ];

    /// Key name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::BrainMask => "brain_mask",
            Self::SegmentationLabels => "segmentation_labels",
            Self::GmProbability => "gm_probability",
            Self::WmProbability => "wm_probability",
            Self::CsfProbability => "csf_probability",
        }
    }

    /// Resampling kernel appropriate for the field's values.
    ///
    /// Discrete fields must not gain new values, so they use
    /// nearest-neighbour.
    #[must_use]
    pub const fn interpolation(self) -> Interpolation {
        match self {
            Self::BrainMask | Self::SegmentationLabels => Interpolation::NearestNeighbor,
            Self::Image | Self::GmProbability | Self::WmProbability | Self::CsfProbability => {
                Interpolation::Linear
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Optional image slots shared by both spaces.
#[derive(Debug, Clone, Default, PartialEq)]
struct Slots {
    brain_mask: Option<Volume>,
    segmentation_labels: Option<Volume>,
    gm_probability: Option<Volume>,
    wm_probability: Option<Volume>,
    csf_probability: Option<Volume>,
}

impl Slots {
    const fn get(&self, field: Field) -> Option<&Volume> {
        match field {
            Field::Image => None,
            Field::BrainMask => self.brain_mask.as_ref(),
            Field::SegmentationLabels => self.segmentation_labels.as_ref(),
            Field::GmProbability => self.gm_probability.as_ref(),
            Field::WmProbability => self.wm_probability.as_ref(),
            Field::CsfProbability => self.csf_probability.as_ref(),
        }
    }

    /// Slot for a non-image field. `Field::Image` is held by the owning
    /// space and never reaches here.
    const fn slot_mut(&mut self, field: Field) -> Option<&mut Option<Volume>> {
        match field {
            Field::Image => None,
            Field::BrainMask => Some(&mut self.brain_mask),
            Field::SegmentationLabels => Some(&mut self.segmentation_labels),
            Field::GmProbability => Some(&mut self.gm_probability),
            Field::WmProbability => Some(&mut self.wm_probability),
            Field::CsfProbability => Some(&mut self.csf_probability),
        }
    }
}

/// Subject-space fields.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeSpace {
    image: Volume,
    original_image: Volume,
    slots: Slots,
}

impl NativeSpace {
    /// Current working image (skull-stripped once that stage has run).
    #[must_use]
    pub const fn image(&self) -> &Volume {
        &self.image
    }

    /// The image as loaded. Never modified.
    #[must_use]
    pub const fn original_image(&self) -> &Volume {
        &self.original_image
    }

    /// Look up a field. [`Field::Image`] is always present.
    #[must_use]
    pub const fn get(&self, field: Field) -> Option<&Volume> {
        match field {
            Field::Image => Some(&self.image),
            _ => self.slots.get(field),
        }
    }
}

/// Standard-template-space fields. Empty until registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateSpace {
    image: Option<Volume>,
    slots: Slots,
    roi_labels: Option<Vec<i32>>,
    roi_features: Option<BTreeMap<String, ArrayD<f64>>>,
}

impl TemplateSpace {
    /// Look up a field.
    #[must_use]
    pub const fn get(&self, field: Field) -> Option<&Volume> {
        match field {
            Field::Image => self.image.as_ref(),
            _ => self.slots.get(field),
        }
    }

    /// Sorted atlas labels used for the ROI features.
    #[must_use]
    pub fn roi_labels(&self) -> Option<&[i32]> {
        self.roi_labels.as_deref()
    }

    /// ROI feature arrays keyed by feature-set name.
    #[must_use]
    pub const fn roi_features(&self) -> Option<&BTreeMap<String, ArrayD<f64>>> {
        self.roi_features.as_ref()
    }

    /// Returns `true` if nothing has been written to template space.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.image.is_none()
            && Field::PROPAGATED.iter().all(|&f| self.slots.get(f).is_none())
            && self.roi_labels.is_none()
            && self.roi_features.is_none()
    }
}

/// Transform chains between the two spaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transforms {
    /// Native-to-template chain.
    pub native_to_template: Option<TransformChain>,
    /// Template-to-native chain.
    pub template_to_native: Option<TransformChain>,
}

/// PET images attached to a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct PetData {
    original: Volume,
    registered_to_mri: Option<Volume>,
    skull_stripped: Option<Volume>,
    template: Option<Volume>,
}

impl PetData {
    /// PET as loaded.
    #[must_use]
    pub const fn original(&self) -> &Volume {
        &self.original
    }

    /// PET rigidly aligned to the native MRI (native space).
    #[must_use]
    pub const fn registered_to_mri(&self) -> Option<&Volume> {
        self.registered_to_mri.as_ref()
    }

    /// Registered PET restricted to the brain (native space).
    #[must_use]
    pub const fn skull_stripped(&self) -> Option<&Volume> {
        self.skull_stripped.as_ref()
    }

    /// PET resampled into template space.
    #[must_use]
    pub const fn template(&self) -> Option<&Volume> {
        self.template.as_ref()
    }
}

/// Why [`ProcessingData::transform_to_template`] did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No native-to-template transform installed yet.
    NoTransform,
    /// No template-space reference image.
    NoTemplateImage,
    /// The native field is unset.
    FieldAbsent,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoTransform => "no native-to-template transform",
            Self::NoTemplateImage => "no template-space image",
            Self::FieldAbsent => "native field not set",
        })
    }
}

/// Outcome of propagating a field into template space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Propagation {
    /// The template field was written.
    Applied,
    /// Nothing was written.
    Skipped(SkipReason),
}

/// Category of a recorded warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// An optional input file was not found.
    MissingInput,
    /// A step that prefers a brain mask ran without one.
    MissingBrainMask,
    /// A step needing a transform or template image was skipped.
    MissingTransform,
    /// An optional reference image could not be loaded.
    MissingReference,
    /// Several methods were enabled; lower-precedence ones were ignored.
    MethodOverridden,
    /// Primary segmentation failed and the fallback was used.
    SegmentationFallback,
    /// A QC metric crossed its configured threshold.
    QualityThreshold,
    /// An intermediate artifact could not be written.
    ArtifactNotSaved,
    /// A metric could not be computed.
    MetricUnavailable,
}

/// Structured record of a degraded or skipped step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// Stage that raised it, if any.
    pub stage: Option<StageName>,
    /// Category.
    pub kind: WarningKind,
    /// Human-readable detail.
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "[{stage}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Immutable snapshot of a subject's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingSummary {
    /// Subject identifier.
    pub subject_id: String,
    /// Stages executed, in order.
    pub processing_steps: Vec<StageName>,
    /// A native brain mask exists.
    pub has_brain_extraction: bool,
    /// A template-space image exists.
    pub has_registration: bool,
    /// A grey matter map exists in either space.
    pub has_segmentation: bool,
    /// ROI features were extracted.
    pub has_roi_features: bool,
    /// Copy of the QC metrics.
    pub qc_metrics: BTreeMap<String, f64>,
    /// Number of warnings recorded.
    pub warning_count: usize,
}

/// All state for one subject during a run.
#[derive(Debug, Clone)]
pub struct ProcessingData {
    subject_id: String,
    native: NativeSpace,
    template: TemplateSpace,
    transforms: Transforms,
    pet: Option<PetData>,
    processing_steps: Vec<StageName>,
    qc_metrics: BTreeMap<String, f64>,
    warnings: Vec<Warning>,
}

impl ProcessingData {
    /// Start a subject from its loaded primary image.
    ///
    /// The image becomes both the working image and the write-once
    /// original.
    #[must_use]
    pub fn new(subject_id: impl Into<String>, image: Volume) -> Self {
        Self {
            subject_id: subject_id.into(),
            native: NativeSpace {
                original_image: image.clone(),
                image,
                slots: Slots::default(),
            },
            template: TemplateSpace::default(),
            transforms: Transforms::default(),
            pet: None,
            processing_steps: Vec::new(),
            qc_metrics: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Attach a loaded PET image.
    #[must_use]
    pub fn with_pet(mut self, pet: Volume) -> Self {
        self.pet = Some(PetData {
            original: pet,
            registered_to_mri: None,
            skull_stripped: None,
            template: None,
        });
        self
    }

    /// Subject identifier.
    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Native-space fields.
    #[must_use]
    pub const fn native(&self) -> &NativeSpace {
        &self.native
    }

    /// Template-space fields.
    #[must_use]
    pub const fn template(&self) -> &TemplateSpace {
        &self.template
    }

    /// Installed transform chains.
    #[must_use]
    pub const fn transforms(&self) -> &Transforms {
        &self.transforms
    }

    /// PET images, if the subject has PET.
    #[must_use]
    pub const fn pet(&self) -> Option<&PetData> {
        self.pet.as_ref()
    }

    /// Stages executed so far.
    #[must_use]
    pub fn processing_steps(&self) -> &[StageName] {
        &self.processing_steps
    }

    /// Latest QC metrics.
    #[must_use]
    pub const fn qc_metrics(&self) -> &BTreeMap<String, f64> {
        &self.qc_metrics
    }

    /// Warnings recorded so far.
    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// A native brain mask exists.
    #[must_use]
    pub const fn has_brain_extraction(&self) -> bool {
        self.native.slots.brain_mask.is_some()
    }

    /// A template-space image exists.
    #[must_use]
    pub const fn has_registration(&self) -> bool {
        self.template.image.is_some()
    }

    /// A grey matter probability map exists in either space.
    #[must_use]
    pub const fn has_segmentation(&self) -> bool {
        self.native.slots.gm_probability.is_some() || self.template.slots.gm_probability.is_some()
    }

    /// The subject has a PET image.
    #[must_use]
    pub const fn has_pet(&self) -> bool {
        self.pet.is_some()
    }

    /// Write a native-space field.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ShapeMismatch`] if `volume` is not on the
    /// native grid.
    pub fn set_native(&mut self, field: Field, volume: Volume) -> Result<(), PipelineError> {
        self.native.image.ensure_same_grid(&volume, field.name())?;
        match self.native.slots.slot_mut(field) {
            Some(slot) => *slot = Some(volume),
            None => self.native.image = volume,
        }
        Ok(())
    }

    /// Write a template-space field.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SpaceViolation`] before registration, or
    /// [`PipelineError::ShapeMismatch`] if `volume` is not on the template
    /// grid.
    pub fn set_template(&mut self, field: Field, volume: Volume) -> Result<(), PipelineError> {
        self.check_template_write(field.name())?;
        if let Some(reference) = &self.template.image {
            reference.ensure_same_grid(&volume, field.name())?;
        }
        match self.template.slots.slot_mut(field) {
            Some(slot) => *slot = Some(volume),
            None => self.template.image = Some(volume),
        }
        Ok(())
    }

    /// Store ROI extraction results in template space.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SpaceViolation`] before registration.
    pub fn set_roi_results(
        &mut self,
        labels: Vec<i32>,
        features: BTreeMap<String, ArrayD<f64>>,
    ) -> Result<(), PipelineError> {
        self.check_template_write("roi_features")?;
        self.template.roi_labels = Some(labels);
        self.template.roi_features = Some(features);
        Ok(())
    }

    /// Install a registration result: the template image together with
    /// both transform chains.
    pub fn install_registration(&mut self, registered: Registered) {
        self.transforms.native_to_template = Some(registered.forward);
        self.transforms.template_to_native = Some(registered.inverse);
        self.template.image = Some(registered.warped);
    }

    /// Resample a native field into template space.
    ///
    /// Does nothing (and says why) when the transform, the template image
    /// or the native field is missing.
    ///
    /// # Errors
    ///
    /// Returns an error only if the engine fails or returns a volume off
    /// the template grid.
    pub fn transform_to_template(
        &mut self,
        engine: &dyn ImageEngine,
        field: Field,
        interpolation: Interpolation,
    ) -> Result<Propagation, PipelineError> {
        let Some(chain) = &self.transforms.native_to_template else {
            return Ok(Propagation::Skipped(SkipReason::NoTransform));
        };
        let Some(reference) = &self.template.image else {
            return Ok(Propagation::Skipped(SkipReason::NoTemplateImage));
        };
        let Some(source) = self.native.get(field) else {
            return Ok(Propagation::Skipped(SkipReason::FieldAbsent));
        };

        tracing::debug!(%field, %interpolation, "propagating to template space");
        let resampled = engine.apply_transforms(reference, source, chain, interpolation)?;
        self.set_template(field, resampled)?;
        Ok(Propagation::Applied)
    }

    /// Store the PET image aligned to the native MRI.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Precondition`] if the subject has no PET or
    /// [`PipelineError::ShapeMismatch`] if not on the native grid.
    pub fn set_pet_registered(&mut self, volume: Volume) -> Result<(), PipelineError> {
        self.native.image.ensure_same_grid(&volume, "pet_registered")?;
        self.pet_mut()?.registered_to_mri = Some(volume);
        Ok(())
    }

    /// Store the brain-masked PET image.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_pet_registered`].
    pub fn set_pet_skull_stripped(&mut self, volume: Volume) -> Result<(), PipelineError> {
        self.native.image.ensure_same_grid(&volume, "pet_skull_stripped")?;
        self.pet_mut()?.skull_stripped = Some(volume);
        Ok(())
    }

    /// Store the template-space PET image.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SpaceViolation`] before registration and
    /// [`PipelineError::Precondition`] if the subject has no PET.
    pub fn set_pet_template(&mut self, volume: Volume) -> Result<(), PipelineError> {
        self.check_template_write("pet")?;
        if let Some(reference) = &self.template.image {
            reference.ensure_same_grid(&volume, "pet")?;
        }
        self.pet_mut()?.template = Some(volume);
        Ok(())
    }

    /// Append a completed stage to the processing log.
    pub fn record_step(&mut self, stage: StageName) {
        self.processing_steps.push(stage);
    }

    /// Replace all QC metrics.
    pub fn replace_qc_metrics(&mut self, metrics: BTreeMap<String, f64>) {
        self.qc_metrics = metrics;
    }

    /// Record a warning and emit it to the log.
    pub fn warn(&mut self, stage: Option<StageName>, kind: WarningKind, message: impl Into<String>) {
        let warning = Warning {
            stage,
            kind,
            message: message.into(),
        };
        tracing::warn!(
            subject = %self.subject_id,
            stage = ?warning.stage,
            kind = ?warning.kind,
            "{}",
            warning.message
        );
        self.warnings.push(warning);
    }

    /// Snapshot of progress.
    #[must_use]
    pub fn processing_summary(&self) -> ProcessingSummary {
        ProcessingSummary {
            subject_id: self.subject_id.clone(),
            processing_steps: self.processing_steps.clone(),
            has_brain_extraction: self.has_brain_extraction(),
            has_registration: self.has_registration(),
            has_segmentation: self.has_segmentation(),
            has_roi_features: self.template.roi_features.is_some(),
            qc_metrics: self.qc_metrics.clone(),
            warning_count: self.warnings.len(),
        }
    }

    fn check_template_write(&self, what: &'static str) -> Result<(), PipelineError> {
        if self.transforms.native_to_template.is_none() {
            return Err(PipelineError::SpaceViolation(what));
        }
        Ok(())
    }

    fn pet_mut(&mut self) -> Result<&mut PetData, PipelineError> {
        self.pet
            .as_mut()
            .ok_or_else(|| PipelineError::Precondition("subject has no PET image".to_owned()))
    }
}
