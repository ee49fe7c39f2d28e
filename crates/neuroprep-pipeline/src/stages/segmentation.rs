//! Native-space tissue classification with a percentile fallback.
//!
//! The stage is a two-branch state machine: the engine's classifier is
//! tried first, and on any failure the image is split into intensity
//! terciles instead. The fallback only fails when there are no positive
//! voxels to classify.

use std::path::Path;

use ndarray::{Array3, Zip};
use serde::Serialize;

use crate::config::SegmentationConfig;
use crate::data::{Field, ProcessingData, WarningKind};
use crate::engine::ImageEngine;
use crate::stages::{StageName, write_artifact};
use crate::stats;
use crate::types::{PipelineError, Segmented, Volume};

/// Which branch produced the last segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationPath {
    /// The engine classifier succeeded.
    Primary,
    /// The classifier failed and percentile thresholding was used.
    Fallback,
}

/// Probability maps in class order: CSF, GM, WM.
const TISSUES: [(Field, &str); 3] = [
    (Field::CsfProbability, "csf"),
    (Field::GmProbability, "gm"),
    (Field::WmProbability, "wm"),
];

/// Segmentation stage.
#[derive(Debug)]
pub struct Segmentation {
    config: SegmentationConfig,
    last_path: Option<SegmentationPath>,
}

impl Segmentation {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &SegmentationConfig) -> Self {
        Self {
            config: config.clone(),
            last_path: None,
        }
    }

    /// Branch taken by the most recent successful run.
    #[must_use]
    pub const fn last_path(&self) -> Option<SegmentationPath> {
        self.last_path
    }

    /// Classify the native image and store labels and tissue maps.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when no method is enabled and
    /// [`PipelineError::NoBrainVoxels`] when the fallback has nothing to
    /// classify.
    pub fn run(
        &mut self,
        engine: &dyn ImageEngine,
        data: &mut ProcessingData,
        output_dir: Option<&Path>,
    ) -> Result<(), PipelineError> {
        let atropos = self.config.methods.atropos;
        if !atropos.enabled {
            return Err(PipelineError::Config(
                "no segmentation method enabled".to_owned(),
            ));
        }

        tracing::info!(
            subject = data.subject_id(),
            classes = atropos.num_classes,
            masked = data.has_brain_extraction(),
            "segmenting"
        );
        let primary = engine.segment(
            data.native().image(),
            data.native().get(Field::BrainMask),
            atropos.num_classes,
        );
        let (segmented, path) = match primary {
            Ok(segmented) => (segmented, SegmentationPath::Primary),
            Err(e) => {
                let fallback = fallback_segmentation(
                    data.native().image(),
                    data.native().get(Field::BrainMask),
                )?;
                data.warn(
                    Some(StageName::Segmentation),
                    WarningKind::SegmentationFallback,
                    format!("classifier failed ({e}); using percentile thresholds"),
                );
                (fallback, SegmentationPath::Fallback)
            }
        };

        data.set_native(Field::SegmentationLabels, segmented.labels)?;
        if segmented.probabilities.len() >= TISSUES.len() {
            for ((field, _), probability) in TISSUES.into_iter().zip(segmented.probabilities) {
                data.set_native(field, probability)?;
            }
        } else {
            tracing::debug!(
                count = segmented.probabilities.len(),
                "too few probability maps, keeping labels only"
            );
        }

        if self.config.save_intermediate
            && let Some(dir) = output_dir
        {
            save(engine, data, dir);
        }

        data.record_step(StageName::Segmentation);
        self.last_path = Some(path);
        tracing::info!(subject = data.subject_id(), ?path, "segmentation complete");
        Ok(())
    }
}

fn save(engine: &dyn ImageEngine, data: &mut ProcessingData, dir: &Path) {
    let subject = data.subject_id().to_owned();
    let mut outputs = vec![(
        Field::SegmentationLabels,
        format!("{subject}_segmentation_labels.nii.gz"),
    )];
    outputs.extend(
        TISSUES
            .iter()
            .map(|&(field, tissue)| (field, format!("{subject}_{tissue}_probability.nii.gz"))),
    );

    for (field, filename) in outputs {
        let Some(volume) = data.native().get(field) else {
            continue;
        };
        if let Err(e) = write_artifact(engine, volume, &dir.join(filename)) {
            data.warn(
                Some(StageName::Segmentation),
                WarningKind::ArtifactNotSaved,
                e.to_string(),
            );
        }
    }
}

/// Three-class intensity segmentation.
///
/// Positive voxels of the (masked) image are split at their 33rd and 66th
/// percentiles: label 1 (CSF) up to the first, 2 (GM) up to the second,
/// 3 (WM) above. Probability maps are the binary class indicators.
///
/// # Errors
///
/// Returns [`PipelineError::NoBrainVoxels`] if no voxel is positive, or
/// [`PipelineError::ShapeMismatch`] if the mask is off grid.
pub fn fallback_segmentation(
    image: &Volume,
    mask: Option<&Volume>,
) -> Result<Segmented, PipelineError> {
    let masked = match mask {
        Some(mask) => image.masked(mask)?,
        None => image.clone(),
    };

    let brain: Vec<f64> = masked
        .data()
        .iter()
        .filter(|&&v| v > 0.0)
        .map(|&v| f64::from(v))
        .collect();
    let (Some(p33), Some(p66)) = (
        stats::percentile(&brain, 33.0),
        stats::percentile(&brain, 66.0),
    ) else {
        return Err(PipelineError::NoBrainVoxels);
    };
    tracing::debug!(voxels = brain.len(), p33, p66, "fallback thresholds");

    let mut labels = Array3::<f32>::zeros(masked.data().raw_dim());
    Zip::from(&mut labels).and(masked.data()).for_each(|l, &v| {
        let v = f64::from(v);
        *l = if v > p66 {
            3.0
        } else if v > p33 {
            2.0
        } else if v > 0.0 {
            1.0
        } else {
            0.0
        };
    });

    #[allow(clippy::float_cmp)]
    let probabilities = [1.0_f32, 2.0, 3.0]
        .into_iter()
        .map(|class| masked.with_data(labels.mapv(|l| if l == class { 1.0 } else { 0.0 })))
        .collect();

    Ok(Segmented {
        labels: masked.with_data(labels),
        probabilities,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::AtroposConfig;
    use crate::testing::{MemoryEngine, synthetic_head};

    fn enabled() -> SegmentationConfig {
        SegmentationConfig {
            enabled: true,
            methods: crate::config::SegmentationMethods {
                atropos: AtroposConfig {
                    enabled: true,
                    num_classes: 3,
                },
            },
            save_intermediate: false,
        }
    }

    /// Ten voxels each at 10, 20 and 30.
    fn trimodal() -> Volume {
        let values: Vec<f32> = [10.0, 20.0, 30.0]
            .iter()
            .flat_map(|&v| std::iter::repeat_n(v, 10))
            .collect();
        Volume::from_data(Array3::from_shape_vec((3, 10, 1), values).unwrap())
    }

    fn labels_of(volume: &Volume) -> Vec<f32> {
        volume.data().iter().copied().collect()
    }

    #[test]
    fn fallback_splits_trimodal_into_terciles() {
        let seg = fallback_segmentation(&trimodal(), None).unwrap();
        let labels = labels_of(&seg.labels);
        assert!(labels[..10].iter().all(|&l| l == 1.0));
        assert!(labels[10..20].iter().all(|&l| l == 2.0));
        assert!(labels[20..].iter().all(|&l| l == 3.0));
        assert_eq!(seg.probabilities.len(), 3);
        assert_eq!(seg.probabilities[1].count_above(0.5), 10);
    }

    #[test]
    fn fallback_respects_mask() {
        let image = trimodal();
        let mut mask = Array3::<f32>::ones((3, 10, 1));
        mask[[2, 0, 0]] = 0.0;
        let seg = fallback_segmentation(&image, Some(&image.with_data(mask))).unwrap();
        assert!(seg.labels.data()[[2, 0, 0]].abs() < f32::EPSILON);
    }

    #[test]
    fn fallback_without_positive_voxels_is_fatal() {
        let image = Volume::from_data(Array3::zeros((2, 2, 2)));
        assert!(matches!(
            fallback_segmentation(&image, None),
            Err(PipelineError::NoBrainVoxels)
        ));
    }

    #[test]
    fn primary_success_skips_fallback() {
        let engine = MemoryEngine::new();
        let mut data = ProcessingData::new("s", synthetic_head());
        let mut stage = Segmentation::new(&enabled());
        stage.run(&engine, &mut data, None).unwrap();
        assert_eq!(stage.last_path(), Some(SegmentationPath::Primary));
        assert!(data.warnings().is_empty());
        assert!(data.has_segmentation());
        assert_eq!(data.processing_steps(), [StageName::Segmentation]);
    }

    #[test]
    fn primary_failure_uses_fallback() {
        let engine = MemoryEngine::new().failing_segmentation();
        let mut data = ProcessingData::new("s", trimodal());
        let mut stage = Segmentation::new(&enabled());
        stage.run(&engine, &mut data, None).unwrap();

        assert_eq!(stage.last_path(), Some(SegmentationPath::Fallback));
        assert_eq!(data.warnings().len(), 1);
        assert_eq!(data.warnings()[0].kind, WarningKind::SegmentationFallback);
        let expected = fallback_segmentation(&trimodal(), None).unwrap();
        assert_eq!(
            data.native().get(Field::SegmentationLabels),
            Some(&expected.labels)
        );
        assert_eq!(data.processing_steps(), [StageName::Segmentation]);
    }

    #[test]
    fn fallback_failure_is_fatal() {
        let engine = MemoryEngine::new().failing_segmentation();
        let mut data = ProcessingData::new("s", Volume::from_data(Array3::zeros((3, 3, 3))));
        let mut stage = Segmentation::new(&enabled());
        let err = stage.run(&engine, &mut data, None).unwrap_err();
        assert!(matches!(err, PipelineError::NoBrainVoxels));
        assert!(data.processing_steps().is_empty());
        assert_eq!(stage.last_path(), None);
    }

    #[test]
    fn too_few_probability_maps_keep_labels_only() {
        let engine = MemoryEngine::new().with_probability_outputs(2);
        let mut data = ProcessingData::new("s", synthetic_head());
        let mut stage = Segmentation::new(&enabled());
        stage.run(&engine, &mut data, None).unwrap();
        assert!(data.native().get(Field::SegmentationLabels).is_some());
        assert!(data.native().get(Field::GmProbability).is_none());
        assert!(!data.has_segmentation());
    }

    #[test]
    fn disabled_method_is_config_error() {
        let engine = MemoryEngine::new();
        let mut data = ProcessingData::new("s", synthetic_head());
        let mut config = enabled();
        config.methods.atropos.enabled = false;
        let err = Segmentation::new(&config).run(&engine, &mut data, None).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn saves_labels_and_probabilities() {
        let engine = MemoryEngine::new();
        let dir = tempfile::tempdir().unwrap();
        let mut data = ProcessingData::new("sub-02", synthetic_head());
        let mut config = enabled();
        config.save_intermediate = true;
        Segmentation::new(&config)
            .run(&engine, &mut data, Some(dir.path()))
            .unwrap();
        for name in [
            "sub-02_segmentation_labels.nii.gz",
            "sub-02_csf_probability.nii.gz",
            "sub-02_gm_probability.nii.gz",
            "sub-02_wm_probability.nii.gz",
        ] {
            assert!(engine.stored(&dir.path().join(name)).is_some(), "{name} missing");
        }
    }
}
