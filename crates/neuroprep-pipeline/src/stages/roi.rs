//! Atlas-based regional features from template-space tissue maps.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ndarray::{Array1, Array2, ArrayD, Zip};

use crate::config::{RoiConfig, Statistic};
use crate::data::{Field, ProcessingData, WarningKind};
use crate::engine::ImageEngine;
use crate::stages::{StageName, cached_resource};
use crate::stats;
use crate::types::{PipelineError, Volume};

/// Tissue maps and the feature set each one produces.
pub const FEATURE_SETS: [(Field, &str); 3] = [
    (Field::GmProbability, "gm_features"),
    (Field::WmProbability, "wm_features"),
    (Field::CsfProbability, "csf_features"),
];

/// ROI extraction stage.
#[derive(Debug)]
pub struct RoiExtraction {
    config: RoiConfig,
    atlas: Option<Volume>,
}

impl RoiExtraction {
    /// Build from configuration. The atlas is loaded on first use.
    #[must_use]
    pub fn new(config: &RoiConfig) -> Self {
        Self {
            config: config.clone(),
            atlas: None,
        }
    }

    /// Compute per-region statistics for every template-space tissue map.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Precondition`] without segmentation or
    /// registration, [`PipelineError::MissingResource`] if the atlas does
    /// not exist, and [`PipelineError::ShapeMismatch`] if the atlas grid
    /// differs from the template grid.
    pub fn run(
        &mut self,
        engine: &dyn ImageEngine,
        data: &mut ProcessingData,
        output_dir: Option<&Path>,
    ) -> Result<(), PipelineError> {
        if !data.has_segmentation() {
            return Err(PipelineError::Precondition(
                "ROI extraction requires segmentation results".to_owned(),
            ));
        }
        if !data.has_registration() {
            return Err(PipelineError::Precondition(
                "ROI extraction requires registration to template space".to_owned(),
            ));
        }

        let atlas = cached_resource(&mut self.atlas, engine, &self.config.atlas_path, "atlas")?;
        let labels = atlas.positive_labels();
        tracing::info!(
            subject = data.subject_id(),
            regions = labels.len(),
            statistics = ?self.config.statistics,
            "extracting ROI features"
        );

        let mut features = BTreeMap::new();
        for (field, name) in FEATURE_SETS {
            if let Some(map) = data.template().get(field) {
                let table = region_statistics(map, atlas, &labels, &self.config.statistics)?;
                features.insert(name.to_owned(), table);
            }
        }

        data.set_roi_results(labels, features)?;
        data.record_step(StageName::RoiExtraction);

        if let Some(dir) = output_dir {
            let failures = self.save(data, dir);
            for message in failures {
                data.warn(
                    Some(StageName::RoiExtraction),
                    WarningKind::ArtifactNotSaved,
                    message,
                );
            }
        }
        Ok(())
    }

    fn save(&self, data: &ProcessingData, dir: &Path) -> Vec<String> {
        let Some(features) = data.template().roi_features() else {
            return Vec::new();
        };
        features
            .iter()
            .filter_map(|(name, table)| {
                let path = dir.join(format!(
                    "{}_{}_{name}.npy",
                    data.subject_id(),
                    self.config.atlas
                ));
                save_features(&path, table).err().map(|e| e.to_string())
            })
            .collect()
    }
}

/// Per-region statistics of one tissue map.
///
/// Rows follow `labels`; columns follow `statistics`. With a single
/// statistic the result is flattened to one value per region. A region
/// with no voxels yields `0` for every statistic.
///
/// # Errors
///
/// Returns [`PipelineError::ShapeMismatch`] if the atlas and map grids
/// differ.
pub fn region_statistics(
    map: &Volume,
    atlas: &Volume,
    labels: &[i32],
    statistics: &[Statistic],
) -> Result<ArrayD<f64>, PipelineError> {
    map.ensure_same_grid(atlas, "atlas")?;

    let row: HashMap<i32, usize> = labels.iter().enumerate().map(|(i, &l)| (l, i)).collect();
    let mut regions: Vec<Vec<f64>> = vec![Vec::new(); labels.len()];
    Zip::from(map.data()).and(atlas.data()).for_each(|&p, &a| {
        #[allow(clippy::cast_possible_truncation)]
        let label = a.round() as i32;
        if let Some(&i) = row.get(&label) {
            regions[i].push(f64::from(p));
        }
    });

    let value = |values: &[f64], statistic: Statistic| -> f64 {
        match statistic {
            Statistic::Mean => stats::mean(values),
            Statistic::Std => stats::std_dev(values),
            Statistic::Median => stats::median(values),
            #[allow(clippy::cast_precision_loss)]
            Statistic::Volume => Some(values.len() as f64),
        }
        .unwrap_or(0.0)
    };

    if let [statistic] = statistics {
        let column: Array1<f64> = regions.iter().map(|r| value(r, *statistic)).collect();
        return Ok(column.into_dyn());
    }
    let table = Array2::from_shape_fn((labels.len(), statistics.len()), |(i, j)| {
        value(&regions[i], statistics[j])
    });
    Ok(table.into_dyn())
}

/// Write a feature array as `.npy`, creating the parent directory.
///
/// # Errors
///
/// Returns [`PipelineError::Io`] if the directory cannot be created and
/// [`PipelineError::Export`] if encoding fails.
pub fn save_features(path: &Path, features: &ArrayD<f64>) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    ndarray_npy::write_npy(path, features)
        .map_err(|e| PipelineError::Export(format!("{}: {e}", path.display())))?;
    tracing::debug!(path = %path.display(), shape = ?features.shape(), "saved features");
    Ok(())
}
