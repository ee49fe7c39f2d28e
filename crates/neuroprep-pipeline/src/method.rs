//! Dispatcher for stages with interchangeable algorithms.
//!
//! A [`MethodTable`] is an ordered list of named methods, each with an
//! `enabled` switch. Every enabled method runs, in declaration order, and
//! writes its outputs into native space; a later method overwrites an
//! earlier one's results.

use std::fmt;
use std::path::Path;

use crate::data::{Field, ProcessingData, WarningKind};
use crate::engine::ImageEngine;
use crate::stages::{StageName, write_artifact};
use crate::types::{PipelineError, Volume};

/// What a method hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodOutput {
    /// New native working image.
    pub image: Volume,
    /// Brain mask on the same grid, if the method produces one.
    pub brain_mask: Option<Volume>,
}

/// A method body. Returning `Ok(None)` means the method produced nothing,
/// which the dispatcher treats as a configuration error.
pub type MethodFn =
    Box<dyn Fn(&dyn ImageEngine, &ProcessingData) -> Result<Option<MethodOutput>, PipelineError>>;

/// One named method.
pub struct Method {
    name: &'static str,
    enabled: bool,
    handler: MethodFn,
}

impl Method {
    /// Method name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the method will run.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Ordered method list for one stage.
#[derive(Debug)]
pub struct MethodTable {
    stage: StageName,
    suffix: &'static str,
    save_intermediate: bool,
    methods: Vec<Method>,
}

impl MethodTable {
    /// An empty table. `suffix` names intermediate files
    /// (`<subject>_<method>_<suffix>.nii.gz`).
    #[must_use]
    pub const fn new(stage: StageName, suffix: &'static str) -> Self {
        Self {
            stage,
            suffix,
            save_intermediate: false,
            methods: Vec::new(),
        }
    }

    /// Save the native image after each method.
    #[must_use]
    pub const fn save_intermediate(mut self, save: bool) -> Self {
        self.save_intermediate = save;
        self
    }

    /// Append a method. Declaration order is execution order.
    #[must_use]
    pub fn with_method(
        mut self,
        name: &'static str,
        enabled: bool,
        handler: impl Fn(&dyn ImageEngine, &ProcessingData) -> Result<Option<MethodOutput>, PipelineError>
        + 'static,
    ) -> Self {
        self.methods.push(Method {
            name,
            enabled,
            handler: Box::new(handler),
        });
        self
    }

    /// All methods, in execution order.
    #[must_use]
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Names of the methods that will run.
    #[must_use]
    pub fn enabled_names(&self) -> Vec<&'static str> {
        self.methods
            .iter()
            .filter(|m| m.enabled)
            .map(|m| m.name)
            .collect()
    }

    /// Run every enabled method against `data`.
    ///
    /// Returns the names of the methods that ran.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when no method is enabled,
    /// [`PipelineError::MethodOutput`] when a method returns nothing or
    /// output off the native grid, and any error a method raises.
    pub fn run(
        &self,
        engine: &dyn ImageEngine,
        data: &mut ProcessingData,
        output_dir: Option<&Path>,
    ) -> Result<Vec<&'static str>, PipelineError> {
        let enabled: Vec<&Method> = self.methods.iter().filter(|m| m.enabled).collect();
        if enabled.is_empty() {
            return Err(PipelineError::Config(format!(
                "no {} method enabled",
                self.stage
            )));
        }

        let mut ran = Vec::with_capacity(enabled.len());
        for method in enabled {
            tracing::info!(stage = %self.stage, method = method.name, "running method");
            let output =
                (method.handler)(engine, &*data)?.ok_or_else(|| PipelineError::MethodOutput {
                    method: method.name.to_owned(),
                    reason: "returned no result".to_owned(),
                })?;
            self.accept(method.name, data, output)?;
            ran.push(method.name);

            if self.save_intermediate
                && let Some(dir) = output_dir
            {
                let path = dir.join(format!(
                    "{}_{}_{}.nii.gz",
                    data.subject_id(),
                    method.name,
                    self.suffix
                ));
                if let Err(e) = write_artifact(engine, data.native().image(), &path) {
                    data.warn(Some(self.stage), WarningKind::ArtifactNotSaved, e.to_string());
                }
            }
        }
        Ok(ran)
    }

    fn accept(
        &self,
        method: &'static str,
        data: &mut ProcessingData,
        output: MethodOutput,
    ) -> Result<(), PipelineError> {
        let native = data.native().image().shape();
        let invalid = |what: &str, shape: [usize; 3]| PipelineError::MethodOutput {
            method: method.to_owned(),
            reason: format!("{what} grid {shape:?} differs from native grid {native:?}"),
        };
        if output.image.shape() != native {
            return Err(invalid("image", output.image.shape()));
        }
        if let Some(mask) = &output.brain_mask
            && mask.shape() != native
        {
            return Err(invalid("mask", mask.shape()));
        }

        tracing::debug!(stage = %self.stage, method, "writing native outputs");
        data.set_native(Field::Image, output.image)?;
        if let Some(mask) = output.brain_mask {
            data.set_native(Field::BrainMask, mask)?;
        }
        Ok(())
    }
}
