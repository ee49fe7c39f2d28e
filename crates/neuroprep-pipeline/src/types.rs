//! Shared types for the neuroprep preprocessing pipeline.

use std::fmt;
use std::path::PathBuf;

use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// Physical placement of a voxel grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Voxel size along each axis (millimetres).
    pub spacing: [f64; 3],
    /// World coordinate of voxel `(0, 0, 0)`.
    pub origin: [f64; 3],
    /// Direction cosines, one row per world axis.
    pub direction: [[f64; 3]; 3],
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            spacing: [1.0; 3],
            origin: [0.0; 3],
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }
}

/// A scalar 3D image: voxel data plus the grid it lives on.
///
/// Every image the pipeline handles (intensity images, masks, label maps,
/// probability maps) is a `Volume`. Masks are stored as `0.0`/`1.0` and
/// label maps as whole numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<f32>,
    geometry: Geometry,
}

impl Volume {
    /// Create a volume from voxel data and its geometry.
    #[must_use]
    pub const fn new(data: Array3<f32>, geometry: Geometry) -> Self {
        Self { data, geometry }
    }

    /// Create a volume on a unit-spaced grid at the origin.
    #[must_use]
    pub fn from_data(data: Array3<f32>) -> Self {
        Self::new(data, Geometry::default())
    }

    /// Borrow the voxel data.
    #[must_use]
    pub const fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Consume the volume and return the voxel data.
    #[must_use]
    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    /// Grid geometry.
    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Grid shape as `[x, y, z]`.
    #[must_use]
    pub fn shape(&self) -> [usize; 3] {
        self.data.dim().into()
    }

    /// Total number of voxels.
    #[must_use]
    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    /// A new volume on the same grid with different voxel data.
    #[must_use]
    pub fn with_data(&self, data: Array3<f32>) -> Self {
        Self::new(data, self.geometry)
    }

    /// Check that `other` lies on a grid of the same shape.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ShapeMismatch`] naming `context` when the
    /// shapes differ.
    pub fn ensure_same_grid(&self, other: &Self, context: &'static str) -> Result<(), PipelineError> {
        if self.shape() == other.shape() {
            Ok(())
        } else {
            Err(PipelineError::ShapeMismatch {
                context,
                expected: self.shape(),
                actual: other.shape(),
            })
        }
    }

    /// Voxel-wise product with a mask on the same grid.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ShapeMismatch`] if the mask grid differs.
    pub fn masked(&self, mask: &Self) -> Result<Self, PipelineError> {
        self.ensure_same_grid(mask, "mask")?;
        Ok(self.with_data(&self.data * &mask.data))
    }

    /// Sorted, de-duplicated positive label values.
    #[must_use]
    pub fn positive_labels(&self) -> Vec<i32> {
        #[allow(clippy::cast_possible_truncation)]
        let mut labels: Vec<i32> = self
            .data
            .iter()
            .filter(|&&v| v > 0.0)
            .map(|&v| v.round() as i32)
            .filter(|&v| v > 0)
            .collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    /// Number of voxels strictly greater than `threshold`.
    #[must_use]
    pub fn count_above(&self, threshold: f32) -> usize {
        self.data.iter().filter(|&&v| v > threshold).count()
    }

    /// Largest voxel value, or `0.0` for an empty grid.
    #[must_use]
    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(0.0_f32, f32::max)
    }

    /// Binary mask of voxels within `[low, high]`.
    #[must_use]
    pub fn threshold(&self, low: f32, high: f32) -> Self {
        let mut mask = Array3::<f32>::zeros(self.data.raw_dim());
        Zip::from(&mut mask).and(&self.data).for_each(|m, &v| {
            if v >= low && v <= high {
                *m = 1.0;
            }
        });
        self.with_data(mask)
    }
}

/// Resampling kernel used when moving an image between grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interpolation {
    /// Nearest-neighbour: never invents values; used for masks and labels.
    NearestNeighbor,
    /// Trilinear: used for intensities and probability maps.
    Linear,
}

impl Interpolation {
    /// Name as understood by ANTs-style tools.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NearestNeighbor => "NearestNeighbor",
            Self::Linear => "Linear",
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformType {
    /// Six degrees of freedom.
    Rigid,
    /// Twelve degrees of freedom.
    Affine,
    /// Affine followed by symmetric diffeomorphic normalisation.
    SyN,
}

impl TransformType {
    /// Name as understood by ANTs-style tools.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rigid => "Rigid",
            Self::Affine => "Affine",
            Self::SyN => "SyN",
        }
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of the non-linear registration stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParams {
    /// Gradient step size.
    pub grad_step: f64,
    /// Regularisation of the update field.
    pub flow_sigma: f64,
    /// Regularisation of the total field.
    pub total_sigma: f64,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            grad_step: 0.1,
            flow_sigma: 3.0,
            total_sigma: 0.0,
        }
    }
}

/// One transform file in a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    /// Location of the transform on disk.
    pub path: PathBuf,
    /// Apply the inverse of the stored transform.
    pub inverse: bool,
}

impl Transform {
    /// A transform applied as stored.
    #[must_use]
    pub fn forward(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inverse: false,
        }
    }

    /// A transform applied inverted.
    #[must_use]
    pub fn inverted(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inverse: true,
        }
    }
}

/// Ordered, composable list of transforms.
///
/// Order follows the ANTs convention: the last transform is applied
/// first to the moving image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformChain(Vec<Transform>);

impl TransformChain {
    /// Create a chain from its transforms.
    #[must_use]
    pub const fn new(transforms: Vec<Transform>) -> Self {
        Self(transforms)
    }

    /// Returns `true` if the chain has no transforms (identity).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of transforms in the chain.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// The transforms, in application-list order.
    #[must_use]
    pub fn transforms(&self) -> &[Transform] {
        &self.0
    }
}

/// Result of an engine registration call.
#[derive(Debug, Clone, PartialEq)]
pub struct Registered {
    /// Moving image resampled onto the fixed grid.
    pub warped: Volume,
    /// Moving-to-fixed chain.
    pub forward: TransformChain,
    /// Fixed-to-moving chain.
    pub inverse: TransformChain,
}

/// Result of an engine tissue classification call.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmented {
    /// Hard label image (`1..=num_classes`, `0` outside the mask).
    pub labels: Volume,
    /// One probability image per class, in class order.
    pub probabilities: Vec<Volume>,
}

/// Contrast of the image handed to brain extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// T1-weighted.
    #[default]
    T1,
    /// T2-weighted.
    T2,
    /// Fluid-attenuated inversion recovery.
    Flair,
}

impl Modality {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::T1 => "t1",
            Self::T2 => "t2",
            Self::Flair => "flair",
        }
    }
}

/// Errors that can occur while processing a subject.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The image-processing engine reported a failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Configuration is invalid or selects no usable method.
    #[error("configuration error: {0}")]
    Config(String),

    /// A configured external resource (template, atlas) does not exist.
    #[error("{kind} not found: {}", .path.display())]
    MissingResource {
        /// What kind of resource was expected.
        kind: &'static str,
        /// Where it was expected.
        path: PathBuf,
    },

    /// A stage's prerequisites were not met.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A template-space field was written before the transform existed.
    #[error("cannot write template-space {0} before native-to-template transform exists")]
    SpaceViolation(&'static str),

    /// Two operands that must share a grid do not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// What was being combined.
        context: &'static str,
        /// Shape of the reference grid.
        expected: [usize; 3],
        /// Shape of the offending grid.
        actual: [usize; 3],
    },

    /// A method returned no result or an unusable one.
    #[error("method {method} produced invalid output: {reason}")]
    MethodOutput {
        /// Name of the method.
        method: String,
        /// What was wrong with its output.
        reason: String,
    },

    /// Fallback segmentation found no positive voxels to classify.
    #[error("no brain voxels found for segmentation")]
    NoBrainVoxels,

    /// A primary input image does not exist.
    #[error("input image not found: {}", .0.display())]
    InputNotFound(PathBuf),

    /// Filesystem access failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Writing an array file failed.
    #[error("export error: {0}")]
    Export(String),
}

impl PipelineError {
    /// Wrap an I/O error with the path it concerns.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
