//! Brain extraction in native space.

use std::path::Path;

use crate::config::SkullStrippingConfig;
use crate::data::ProcessingData;
use crate::engine::ImageEngine;
use crate::method::{MethodOutput, MethodTable};
use crate::stages::StageName;
use crate::types::{PipelineError, Volume};

/// Intermediate filename suffix.
const SUFFIX: &str = "skull_stripped";

/// Skull-stripping stage.
///
/// Methods, in execution order:
/// - `antspynet`: learned brain extraction through the engine.
/// - `ants`: intensity threshold.
///
/// Each enabled method replaces the native image with the masked image
/// and sets the native brain mask.
#[derive(Debug)]
pub struct SkullStripping {
    methods: MethodTable,
}

impl SkullStripping {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &SkullStrippingConfig) -> Self {
        let learned = config.methods.antspynet;
        let threshold = config.methods.ants;

        let methods = MethodTable::new(StageName::SkullStripping, SUFFIX)
            .save_intermediate(config.save_intermediate)
            .with_method("antspynet", learned.enabled, move |engine, data| {
                let image = data.native().image();
                let mask = engine.extract_brain_mask(image, learned.modality)?;
                strip("antspynet", image, mask)
            })
            .with_method("ants", threshold.enabled, move |engine, data| {
                let image = data.native().image();
                let mask = engine.threshold_mask(image, threshold.threshold)?;
                strip("ants", image, mask)
            });
        Self { methods }
    }

    /// The method table.
    #[must_use]
    pub const fn methods(&self) -> &MethodTable {
        &self.methods
    }

    /// Run every enabled method and log the stage once.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when no method is enabled, or the
    /// first method failure.
    pub fn run(
        &mut self,
        engine: &dyn ImageEngine,
        data: &mut ProcessingData,
        output_dir: Option<&Path>,
    ) -> Result<(), PipelineError> {
        let ran = self.methods.run(engine, data, output_dir)?;
        data.record_step(StageName::SkullStripping);
        tracing::info!(subject = data.subject_id(), methods = ?ran, "skull stripping complete");
        Ok(())
    }
}

fn strip(
    method: &'static str,
    image: &Volume,
    mask: Volume,
) -> Result<Option<MethodOutput>, PipelineError> {
    let stripped = image.masked(&mask).map_err(|e| PipelineError::MethodOutput {
        method: method.to_owned(),
        reason: e.to_string(),
    })?;
    Ok(Some(MethodOutput {
        image: stripped,
        brain_mask: Some(mask),
    }))
}
