//! Alignment of the native image to the standard template.
//!
//! Registration is the only stage that creates template space: it installs
//! the warped image and both transform chains together, then carries every
//! populated native field across.

use std::path::Path;

use crate::config::{RegistrationConfig, RegistrationMethods};
use crate::data::{Field, ProcessingData, Propagation, SkipReason, WarningKind};
use crate::engine::ImageEngine;
use crate::stages::{StageName, cached_resource, write_artifact};
use crate::types::{PipelineError, TransformType, Volume};

/// Pick the transform model from the enabled methods.
///
/// Precedence is SyN, then affine, then rigid. Returns the chosen model
/// and the enabled models it overrides.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if no model is enabled.
pub fn select_transform(
    methods: &RegistrationMethods,
) -> Result<(TransformType, Vec<TransformType>), PipelineError> {
    let mut enabled = [
        (TransformType::SyN, methods.syn.enabled),
        (TransformType::Affine, methods.affine.enabled),
        (TransformType::Rigid, methods.rigid.enabled),
    ]
    .into_iter()
    .filter_map(|(kind, on)| on.then_some(kind));

    let selected = enabled
        .next()
        .ok_or_else(|| PipelineError::Config("no registration method enabled".to_owned()))?;
    Ok((selected, enabled.collect()))
}

/// Registration stage.
#[derive(Debug)]
pub struct Registration {
    config: RegistrationConfig,
    template: Option<Volume>,
}

impl Registration {
    /// Build from configuration. The template is loaded on first use.
    #[must_use]
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            config: config.clone(),
            template: None,
        }
    }

    /// Register the native image to the template and propagate native
    /// fields into template space.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if no method is enabled,
    /// [`PipelineError::MissingResource`] if the template does not exist,
    /// or an engine error.
    pub fn run(
        &mut self,
        engine: &dyn ImageEngine,
        data: &mut ProcessingData,
        output_dir: Option<&Path>,
    ) -> Result<(), PipelineError> {
        let (selected, overridden) = select_transform(&self.config.methods)?;
        if !overridden.is_empty() {
            let ignored: Vec<&str> = overridden.iter().map(|t| t.as_str()).collect();
            data.warn(
                Some(StageName::Registration),
                WarningKind::MethodOverridden,
                format!("{selected} takes precedence; ignoring {}", ignored.join(", ")),
            );
        }

        let template = cached_resource(
            &mut self.template,
            engine,
            &self.config.template,
            "template",
        )?;

        tracing::info!(subject = data.subject_id(), transform = %selected, "registering to template");
        let registered = engine.register(
            template,
            data.native().image(),
            selected,
            &self.config.methods.syn.params,
        )?;
        data.install_registration(registered);

        for field in Field::PROPAGATED {
            match data.transform_to_template(engine, field, field.interpolation())? {
                Propagation::Applied | Propagation::Skipped(SkipReason::FieldAbsent) => {}
                Propagation::Skipped(reason) => data.warn(
                    Some(StageName::Registration),
                    WarningKind::MissingTransform,
                    format!("{field} not propagated: {reason}"),
                ),
            }
        }

        if self.config.save_intermediate
            && let Some(dir) = output_dir
            && let Some(image) = data.template().get(Field::Image)
        {
            let path = dir.join(format!("{}_registered.nii.gz", data.subject_id()));
            if let Err(e) = write_artifact(engine, image, &path) {
                data.warn(
                    Some(StageName::Registration),
                    WarningKind::ArtifactNotSaved,
                    e.to_string(),
                );
            }
        }

        data.record_step(StageName::Registration);
        tracing::info!(subject = data.subject_id(), "registration complete");
        Ok(())
    }
}
