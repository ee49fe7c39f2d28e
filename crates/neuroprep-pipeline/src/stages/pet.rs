//! PET fusion: PET to native MRI, brain masking, then template space.
//!
//! Each step degrades gracefully: a missing prerequisite is recorded as a
//! warning and the remaining steps continue.

use std::path::Path;

use crate::config::PetConfig;
use crate::data::{Field, ProcessingData, WarningKind};
use crate::engine::ImageEngine;
use crate::stages::{StageName, write_artifact};
use crate::types::{Interpolation, PipelineError, RegistrationParams, TransformType};

/// PET processing stage.
#[derive(Debug)]
pub struct PetProcessing {
    config: PetConfig,
}

impl PetProcessing {
    /// Build from configuration.
    #[must_use]
    pub const fn new(config: &PetConfig) -> Self {
        Self { config: *config }
    }

    /// Process the subject's PET image, if any.
    ///
    /// A subject without PET passes through untouched and the stage is not
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns an engine error from registration or resampling.
    pub fn run(
        &mut self,
        engine: &dyn ImageEngine,
        data: &mut ProcessingData,
        output_dir: Option<&Path>,
    ) -> Result<(), PipelineError> {
        let Some(pet) = data.pet() else {
            tracing::debug!(subject = data.subject_id(), "no PET image, skipping");
            return Ok(());
        };

        // 1. Rigid PET -> MRI, MRI fixed.
        tracing::info!(subject = data.subject_id(), "registering PET to native MRI");
        let registered = engine.register(
            data.native().image(),
            pet.original(),
            TransformType::Rigid,
            &RegistrationParams::default(),
        )?;
        data.set_pet_registered(registered.warped)?;

        // 2. Brain mask.
        let registered = data.pet().and_then(|p| p.registered_to_mri()).cloned();
        if let Some(registered) = registered {
            let stripped = match data.native().get(Field::BrainMask) {
                Some(mask) => registered.masked(mask)?,
                None => {
                    data.warn(
                        Some(StageName::PetProcessing),
                        WarningKind::MissingBrainMask,
                        "no brain mask available, using registered PET unmasked",
                    );
                    registered
                }
            };
            data.set_pet_skull_stripped(stripped)?;
        }

        // 3. Native -> template.
        move_to_template(engine, data)?;

        data.record_step(StageName::PetProcessing);

        if self.config.save_intermediate
            && let Some(dir) = output_dir
        {
            save(engine, data, dir);
        }
        tracing::info!(subject = data.subject_id(), "PET processing complete");
        Ok(())
    }
}

fn move_to_template(
    engine: &dyn ImageEngine,
    data: &mut ProcessingData,
) -> Result<(), PipelineError> {
    let reason = match (
        data.pet().and_then(|p| p.skull_stripped()),
        &data.transforms().native_to_template,
        data.template().get(Field::Image),
    ) {
        (Some(source), Some(chain), Some(reference)) => {
            let resampled =
                engine.apply_transforms(reference, source, chain, Interpolation::Linear)?;
            return data.set_pet_template(resampled);
        }
        (None, _, _) => "no skull-stripped PET available",
        (_, None, _) => "no native-to-template transform available",
        (_, _, None) => "no template image available",
    };
    data.warn(
        Some(StageName::PetProcessing),
        WarningKind::MissingTransform,
        format!("PET not moved to template space: {reason}"),
    );
    Ok(())
}

fn save(engine: &dyn ImageEngine, data: &mut ProcessingData, dir: &Path) {
    let subject = data.subject_id().to_owned();
    let Some(pet) = data.pet() else {
        return;
    };
    let outputs = [
        (pet.registered_to_mri(), format!("{subject}_PET_registered.nii.gz")),
        (pet.skull_stripped(), format!("{subject}_PET_skull_stripped.nii.gz")),
    ];
    let failures: Vec<String> = outputs
        .iter()
        .filter_map(|(volume, name)| volume.map(|v| (v, name)))
        .filter_map(|(volume, name)| write_artifact(engine, volume, &dir.join(name)).err())
        .map(|e| e.to_string())
        .collect();
    for message in failures {
        data.warn(
            Some(StageName::PetProcessing),
            WarningKind::ArtifactNotSaved,
            message,
        );
    }
}
