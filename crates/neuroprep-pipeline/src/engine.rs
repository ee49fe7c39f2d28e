//! The image-processing engine seam.
//!
//! Everything numerically heavy (registration solvers, brain extraction,
//! tissue classification, resampling, image I/O) sits behind
//! [`ImageEngine`]. The pipeline only sequences calls and keeps track of
//! which space each result lives in.

use std::path::{Path, PathBuf};

use crate::stats;
use crate::types::{
    Interpolation, Modality, Registered, RegistrationParams, Segmented, TransformChain,
    TransformType, Volume,
};

/// Errors reported by an engine implementation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine (or one of its tools) is not installed.
    #[error("image engine unavailable: {0}")]
    Unavailable(String),

    /// An engine operation ran but did not succeed.
    #[error("{operation} failed: {message}")]
    Failed {
        /// Which capability was invoked.
        operation: &'static str,
        /// Engine-provided diagnostic.
        message: String,
    },

    /// Reading or writing an image or scratch file failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Shorthand for [`EngineError::Failed`].
    #[must_use]
    pub fn failed(operation: &'static str, message: impl ToString) -> Self {
        Self::Failed {
            operation,
            message: message.to_string(),
        }
    }
}

/// Capabilities the pipeline needs from an image-processing backend.
///
/// All methods take `&self`: engines may keep scratch state internally but
/// are driven strictly sequentially.
pub trait ImageEngine {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    /// Whether an image can be read from `path`.
    fn image_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Load a volume from disk.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the file cannot be read or decoded.
    fn read_image(&self, path: &Path) -> Result<Volume, EngineError>;

    /// Store a volume on disk.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the file cannot be written.
    fn write_image(&self, volume: &Volume, path: &Path) -> Result<(), EngineError>;

    /// Register `moving` onto `fixed`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the solver fails.
    fn register(
        &self,
        fixed: &Volume,
        moving: &Volume,
        transform: TransformType,
        params: &RegistrationParams,
    ) -> Result<Registered, EngineError>;

    /// Resample `moving` onto the grid of `fixed` through `transforms`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if resampling fails.
    fn apply_transforms(
        &self,
        fixed: &Volume,
        moving: &Volume,
        transforms: &TransformChain,
        interpolation: Interpolation,
    ) -> Result<Volume, EngineError>;

    /// Classify `image` into `num_classes` tissues, restricted to `mask`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if classification fails.
    fn segment(
        &self,
        image: &Volume,
        mask: Option<&Volume>,
        num_classes: usize,
    ) -> Result<Segmented, EngineError>;

    /// Learned brain extraction.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if extraction is unavailable or fails.
    fn extract_brain_mask(&self, image: &Volume, modality: Modality)
    -> Result<Volume, EngineError>;

    /// Called once a subject is done, whether it succeeded or not.
    ///
    /// Engines that keep per-subject scratch files release them here;
    /// transform chains returned by [`ImageEngine::register`] for that
    /// subject may no longer resolve afterwards.
    fn finish_subject(&self, _subject: &str) {}

    /// Intensity-threshold brain mask: voxels in `[low, max]`.
    ///
    /// # Errors
    ///
    /// The default implementation never fails.
    fn threshold_mask(&self, image: &Volume, low: f32) -> Result<Volume, EngineError> {
        Ok(image.threshold(low, image.max_value()))
    }

    /// Mutual information between two images on the same grid.
    ///
    /// # Errors
    ///
    /// The default implementation fails when the grids differ.
    fn mutual_information(&self, a: &Volume, b: &Volume) -> Result<f64, EngineError> {
        if a.shape() != b.shape() {
            return Err(EngineError::failed(
                "mutual_information",
                format!("grid {:?} does not match {:?}", a.shape(), b.shape()),
            ));
        }
        let xs: Vec<f32> = a.data().iter().copied().collect();
        let ys: Vec<f32> = b.data().iter().copied().collect();
        stats::mutual_information(&xs, &ys)
            .ok_or_else(|| EngineError::failed("mutual_information", "empty images"))
    }
}
