//! In-memory engine and synthetic volumes for tests and dry runs.
//!
//! [`MemoryEngine`] keeps every "file" in a map, so stage logic can be
//! exercised without ANTs or a filesystem. Registration and resampling are
//! plain index-scaling onto the fixed grid, which is enough to check which
//! grid and which space each result lands in.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::Array3;

use crate::engine::{EngineError, ImageEngine};
use crate::types::{
    Interpolation, Modality, Registered, RegistrationParams, Segmented, Transform,
    TransformChain, TransformType, Volume,
};

/// An [`ImageEngine`] backed by a path-to-volume map.
#[derive(Debug)]
pub struct MemoryEngine {
    images: RefCell<HashMap<PathBuf, Volume>>,
    reads: RefCell<HashMap<PathBuf, usize>>,
    written: RefCell<Vec<PathBuf>>,
    registrations: RefCell<Vec<TransformType>>,
    finished: RefCell<Vec<String>>,
    brain_extraction: bool,
    segmentation_fails: bool,
    probability_outputs: Option<usize>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// An engine with every capability working.
    #[must_use]
    pub fn new() -> Self {
        Self {
            images: RefCell::default(),
            reads: RefCell::default(),
            written: RefCell::default(),
            registrations: RefCell::default(),
            finished: RefCell::default(),
            brain_extraction: true,
            segmentation_fails: false,
            probability_outputs: None,
        }
    }

    /// Learned brain extraction reports itself unavailable.
    #[must_use]
    pub const fn without_brain_extraction(mut self) -> Self {
        self.brain_extraction = false;
        self
    }

    /// Tissue classification always fails.
    #[must_use]
    pub const fn failing_segmentation(mut self) -> Self {
        self.segmentation_fails = true;
        self
    }

    /// Return at most `count` probability maps from classification.
    #[must_use]
    pub const fn with_probability_outputs(mut self, count: usize) -> Self {
        self.probability_outputs = Some(count);
        self
    }

    /// Place a volume at `path`.
    pub fn insert(&self, path: impl AsRef<Path>, volume: Volume) {
        self.images
            .borrow_mut()
            .insert(path.as_ref().to_path_buf(), volume);
    }

    /// The volume currently stored at `path`.
    #[must_use]
    pub fn stored(&self, path: &Path) -> Option<Volume> {
        self.images.borrow().get(path).cloned()
    }

    /// Every path written through [`ImageEngine::write_image`], in order.
    #[must_use]
    pub fn written_paths(&self) -> Vec<PathBuf> {
        self.written.borrow().clone()
    }

    /// How many times `path` has been read.
    #[must_use]
    pub fn read_count(&self, path: &Path) -> usize {
        self.reads.borrow().get(path).copied().unwrap_or(0)
    }

    /// Transform models requested so far, in call order.
    #[must_use]
    pub fn registrations(&self) -> Vec<TransformType> {
        self.registrations.borrow().clone()
    }

    /// Subjects passed to [`ImageEngine::finish_subject`], in order.
    #[must_use]
    pub fn finished_subjects(&self) -> Vec<String> {
        self.finished.borrow().clone()
    }

    fn transform_paths(&self, transform: TransformType) -> (TransformChain, TransformChain) {
        let prefix = format!("memory/reg{}_", self.registrations.borrow().len());
        let affine = PathBuf::from(format!("{prefix}0GenericAffine.mat"));
        match transform {
            TransformType::SyN => (
                TransformChain::new(vec![
                    Transform::forward(format!("{prefix}1Warp.nii.gz")),
                    Transform::forward(affine.clone()),
                ]),
                TransformChain::new(vec![
                    Transform::inverted(affine),
                    Transform::forward(format!("{prefix}1InverseWarp.nii.gz")),
                ]),
            ),
            TransformType::Rigid | TransformType::Affine => (
                TransformChain::new(vec![Transform::forward(affine.clone())]),
                TransformChain::new(vec![Transform::inverted(affine)]),
            ),
        }
    }
}

impl ImageEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    fn finish_subject(&self, subject: &str) {
        self.finished.borrow_mut().push(subject.to_owned());
    }

    fn image_exists(&self, path: &Path) -> bool {
        self.images.borrow().contains_key(path)
    }

    fn read_image(&self, path: &Path) -> Result<Volume, EngineError> {
        let volume = self.stored(path).ok_or_else(|| EngineError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such volume"),
        })?;
        *self.reads.borrow_mut().entry(path.to_path_buf()).or_default() += 1;
        Ok(volume)
    }

    fn write_image(&self, volume: &Volume, path: &Path) -> Result<(), EngineError> {
        self.insert(path, volume.clone());
        self.written.borrow_mut().push(path.to_path_buf());
        Ok(())
    }

    fn register(
        &self,
        fixed: &Volume,
        moving: &Volume,
        transform: TransformType,
        _params: &RegistrationParams,
    ) -> Result<Registered, EngineError> {
        let (forward, inverse) = self.transform_paths(transform);
        self.registrations.borrow_mut().push(transform);
        Ok(Registered {
            warped: resample(fixed, moving, Interpolation::Linear),
            forward,
            inverse,
        })
    }

    fn apply_transforms(
        &self,
        fixed: &Volume,
        moving: &Volume,
        _transforms: &TransformChain,
        interpolation: Interpolation,
    ) -> Result<Volume, EngineError> {
        Ok(resample(fixed, moving, interpolation))
    }

    fn segment(
        &self,
        image: &Volume,
        mask: Option<&Volume>,
        num_classes: usize,
    ) -> Result<Segmented, EngineError> {
        if self.segmentation_fails {
            return Err(EngineError::failed("segment", "classifier did not converge"));
        }
        if num_classes == 0 {
            return Err(EngineError::failed("segment", "no classes requested"));
        }
        let mut segmented = equal_width_classes(image, mask, num_classes)
            .ok_or_else(|| EngineError::failed("segment", "no voxels to classify"))?;
        if let Some(count) = self.probability_outputs {
            segmented.probabilities.truncate(count);
        }
        Ok(segmented)
    }

    fn extract_brain_mask(
        &self,
        image: &Volume,
        _modality: Modality,
    ) -> Result<Volume, EngineError> {
        if !self.brain_extraction {
            return Err(EngineError::Unavailable(
                "learned brain extraction not installed".to_owned(),
            ));
        }
        let cutoff = 0.1 * image.max_value();
        Ok(image.with_data(image.data().mapv(|v| if v > cutoff { 1.0 } else { 0.0 })))
    }
}

/// Split positive (masked) voxels into `classes` equal-width intensity
/// bins labelled `1..=classes`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn equal_width_classes(image: &Volume, mask: Option<&Volume>, classes: usize) -> Option<Segmented> {
    let inside = |index: (usize, usize, usize), v: f32| {
        v > 0.0 && mask.is_none_or(|m| m.data().get(index).is_some_and(|&m| m > 0.0))
    };
    let (lo, hi) = image
        .data()
        .indexed_iter()
        .filter(|&(i, &v)| inside(i, v))
        .fold(None, |acc: Option<(f32, f32)>, (_, &v)| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })?;

    let width = (hi - lo) / classes as f32;
    let labels = Array3::from_shape_fn(image.data().raw_dim(), |index| {
        let v = image.data()[index];
        if !inside(index, v) {
            return 0.0;
        }
        let bin = if width > 0.0 {
            (((v - lo) / width) as usize).min(classes - 1)
        } else {
            0
        };
        (bin + 1) as f32
    });
    let probabilities = (1..=classes)
        .map(|class| {
            let class = class as f32;
            image.with_data(labels.mapv(|l| if (l - class).abs() < 0.5 { 1.0 } else { 0.0 }))
        })
        .collect();
    Some(Segmented {
        labels: image.with_data(labels),
        probabilities,
    })
}

/// Resample `moving` onto the grid of `fixed` by scaling voxel indices.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn resample(fixed: &Volume, moving: &Volume, interpolation: Interpolation) -> Volume {
    let source = moving.data();
    let from = moving.shape();
    let to = fixed.shape();
    let scale = |axis: usize, i: usize| {
        if to[axis] > 1 {
            i as f32 * (from[axis] - 1) as f32 / (to[axis] - 1) as f32
        } else {
            0.0
        }
    };

    let data = Array3::from_shape_fn((to[0], to[1], to[2]), |(i, j, k)| {
        let coord = [scale(0, i), scale(1, j), scale(2, k)];
        match interpolation {
            Interpolation::NearestNeighbor => {
                let [x, y, z] = coord.map(|c| c.round() as usize);
                source[[x, y, z]]
            }
            Interpolation::Linear => trilinear(source, from, coord),
        }
    });
    fixed.with_data(data)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn trilinear(source: &Array3<f32>, shape: [usize; 3], coord: [f32; 3]) -> f32 {
    let lower = coord.map(|c| c.floor() as usize);
    let upper = [0, 1, 2].map(|a| (lower[a] + 1).min(shape[a] - 1));
    let t = [0, 1, 2].map(|a| coord[a] - lower[a] as f32);

    let mut value = 0.0;
    let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
    for corner in 0..8_usize {
        let mut weight = 1.0;
        let mut index = [0; 3];
        for axis in 0..3 {
            if (corner >> axis) & 1 == 1 {
                index[axis] = upper[axis];
                weight *= t[axis];
            } else {
                index[axis] = lower[axis];
                weight *= 1.0 - t[axis];
            }
        }
        let sample = source[index];
        lo = lo.min(sample);
        hi = hi.max(sample);
        value += weight * sample;
    }
    // Rounding in the weights must not push a value outside its corners.
    value.clamp(lo, hi)
}

#[allow(clippy::cast_precision_loss)]
fn radius(index: (usize, usize, usize), centre: f32) -> f32 {
    let (x, y, z) = index;
    let d = [x, y, z].map(|c| c as f32 - centre);
    d.iter().map(|d| d * d).sum::<f32>().sqrt()
}

/// A 20³ head: nested spheres at 300, 200 and 100 on low background
/// noise between 0 and 4.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn synthetic_head() -> Volume {
    Volume::from_data(Array3::from_shape_fn((20, 20, 20), |index| {
        let (x, y, z) = index;
        match radius(index, 9.5) {
            r if r < 4.0 => 300.0,
            r if r < 6.0 => 200.0,
            r if r < 8.0 => 100.0,
            _ => ((x * 7 + y * 13 + z * 3) % 5) as f32,
        }
    }))
}

/// A 16³ template with nested spheres at 300, 200 and 100.
#[must_use]
pub fn template_volume() -> Volume {
    Volume::from_data(Array3::from_shape_fn((16, 16, 16), |index| {
        match radius(index, 7.5) {
            r if r < 3.0 => 300.0,
            r if r < 5.0 => 200.0,
            r if r < 7.0 => 100.0,
            _ => 0.0,
        }
    }))
}

/// A 10³ PET image with uptake falling off from the centre.
#[must_use]
pub fn pet_volume() -> Volume {
    Volume::from_data(Array3::from_shape_fn((10, 10, 10), |index| {
        let r = radius(index, 4.5);
        1000.0 / (1.0 + r * r)
    }))
}

/// Octant labels on the [`template_volume`] grid with a one-voxel
/// unlabelled border. Labels 1-4 cover the low-x half, 5-8 the high-x half.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn octant_atlas() -> Volume {
    let template = template_volume();
    let [n, _, _] = template.shape();
    let half = n / 2;
    let atlas = Array3::from_shape_fn((n, n, n), |(x, y, z)| {
        if [x, y, z].iter().any(|&c| c == 0 || c == n - 1) {
            return 0.0;
        }
        let octant = usize::from(x >= half) * 4 + usize::from(y >= half) * 2 + usize::from(z >= half);
        (octant + 1) as f32
    });
    template.with_data(atlas)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn read_counts_and_missing_paths() {
        let engine = MemoryEngine::new();
        let path = Path::new("/virtual/a.nii.gz");
        assert!(!engine.image_exists(path));
        assert!(engine.read_image(path).is_err());
        engine.insert(path, template_volume());
        engine.read_image(path).unwrap();
        engine.read_image(path).unwrap();
        assert_eq!(engine.read_count(path), 2);
    }

    #[test]
    fn resample_lands_on_fixed_grid() {
        let out = resample(&template_volume(), &synthetic_head(), Interpolation::Linear);
        assert_eq!(out.shape(), [16, 16, 16]);
        // Corners map to corners.
        assert!((out.data()[[0, 0, 0]] - synthetic_head().data()[[0, 0, 0]]).abs() < 1e-4);
    }

    #[test]
    fn nearest_neighbour_keeps_values() {
        let atlas = octant_atlas();
        let out = resample(&synthetic_head(), &atlas, Interpolation::NearestNeighbor);
        assert!(out.positive_labels().iter().all(|l| (1..=8).contains(l)));
    }

    #[test]
    fn classes_cover_positive_voxels() {
        let head = synthetic_head();
        let seg = MemoryEngine::new().segment(&head, None, 3).unwrap();
        assert_eq!(seg.labels.positive_labels(), [1, 2, 3]);
        assert_eq!(seg.probabilities.len(), 3);
        let labelled = seg.labels.count_above(0.5);
        assert_eq!(labelled, head.count_above(0.0));
    }

    #[test]
    fn octants_split_on_x() {
        let atlas = octant_atlas();
        assert_eq!(atlas.positive_labels(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(atlas.data()[[0, 5, 5]].abs() < f32::EPSILON);
        assert!((atlas.data()[[3, 3, 3]] - 1.0).abs() < f32::EPSILON);
        assert!((atlas.data()[[12, 3, 3]] - 5.0).abs() < f32::EPSILON);
    }
}
