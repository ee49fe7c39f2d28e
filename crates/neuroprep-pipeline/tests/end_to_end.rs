//! Integration tests: whole-subject runs against the in-memory engine.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use neuroprep_pipeline::testing::{
    MemoryEngine, octant_atlas, pet_volume, synthetic_head, template_volume,
};
use neuroprep_pipeline::{
    Field, Pipeline, PipelineConfig, PipelineError, StageName, SubjectInput, WarningKind,
};

const MRI: &str = "/virtual/sub-01_T1.nii.gz";
const PET: &str = "/virtual/sub-01_PET.nii.gz";

const CONFIG: &str = r"
skull_stripping:
  enabled: true
  methods:
    antspynet: {enabled: true, modality: t1}
segmentation:
  enabled: true
  methods:
    atropos: {enabled: true, num_classes: 3}
registration:
  enabled: true
  template: /virtual/mni.nii.gz
  methods:
    syn: {enabled: true}
pet_processing:
  enabled: true
roi_extraction:
  enabled: true
  atlas_path: /virtual/atlas.nii.gz
  atlas: octants
  statistics: [mean, volume]
quality_control:
  enabled: true
  template: /virtual/mni.nii.gz
  generate_report: true
";

fn engine() -> MemoryEngine {
    let engine = MemoryEngine::new();
    engine.insert(MRI, synthetic_head());
    engine.insert(PET, pet_volume());
    engine.insert("/virtual/mni.nii.gz", template_volume());
    engine.insert("/virtual/atlas.nii.gz", octant_atlas());
    engine
}

fn pipeline(out: &Path, edit: impl FnOnce(&mut PipelineConfig)) -> Pipeline<MemoryEngine> {
    let mut config = PipelineConfig::from_yaml_str(CONFIG).unwrap();
    config.output.base_dir = out.to_path_buf();
    edit(&mut config);
    Pipeline::new(config, engine()).unwrap()
}

#[test]
fn mri_only_run_produces_template_outputs_and_qc() {
    let out = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(out.path(), |_| {});
    let outcome = pipeline.run(&SubjectInput::new("sub-01", MRI), None).unwrap();
    let data = &outcome.data;

    assert_eq!(
        data.processing_steps(),
        [
            StageName::SkullStripping,
            StageName::Segmentation,
            StageName::Registration,
            StageName::RoiExtraction,
            StageName::QualityControl,
        ]
    );
    assert!(data.warnings().is_empty(), "{:?}", data.warnings());

    for field in Field::ALL {
        assert!(data.template().get(field).is_some(), "{field} missing in template space");
    }
    let metrics = data.qc_metrics();
    assert!(metrics.contains_key("snr"));
    assert!(metrics.contains_key("registration_mi"));
    assert!(metrics.contains_key("csf_volume"));

    let final_dir = out.path().join("sub-01/final");
    for name in [
        "sub-01_T1_MNI.nii.gz",
        "sub-01_brain_mask_MNI.nii.gz",
        "sub-01_GM_probability_MNI.nii.gz",
        "sub-01_WM_probability_MNI.nii.gz",
        "sub-01_CSF_probability_MNI.nii.gz",
        "sub-01_segmentation_MNI.nii.gz",
    ] {
        assert!(
            pipeline.engine().stored(&final_dir.join(name)).is_some(),
            "{name} not exported"
        );
    }
    assert!(pipeline.engine().stored(&final_dir.join("sub-01_PET_MNI.nii.gz")).is_none());

    let gm: ndarray::ArrayD<f64> =
        ndarray_npy::read_npy(final_dir.join("sub-01_gm_features.npy")).unwrap();
    assert_eq!(gm.shape(), [8, 2]);
    assert!(
        out.path()
            .join("sub-01/intermediate/sub-01_octants_gm_features.npy")
            .is_file()
    );

    let report = std::fs::read_to_string(out.path().join("sub-01/qc/sub-01_qc_report.txt")).unwrap();
    assert!(report.contains("snr: "));
    assert!(report.contains("registration_mi: "));

    let summary =
        std::fs::read_to_string(out.path().join("sub-01/intermediate/sub-01_summary.txt")).unwrap();
    assert!(summary.contains(
        "Steps: skull_stripping -> segmentation -> registration -> roi_extraction -> quality_control"
    ));
    assert!(summary.contains("ROI features: Yes"));
}

#[test]
fn pet_run_logs_pet_stage_and_exports_pet() {
    let out = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(out.path(), |_| {});
    let input = SubjectInput::new("sub-01", MRI).with_pet(PET);
    let outcome = pipeline.run(&input, None).unwrap();

    let steps = outcome.data.processing_steps();
    assert_eq!(steps[3], StageName::PetProcessing);
    assert_eq!(steps.len(), 6);

    let pet = outcome.data.pet().unwrap();
    assert_eq!(pet.template().unwrap().shape(), template_volume().shape());

    let final_dir = out.path().join("sub-01/final");
    assert!(pipeline.engine().stored(&final_dir.join("sub-01_PET_MNI.nii.gz")).is_some());
    assert!(
        pipeline
            .engine()
            .stored(&final_dir.join("sub-01_PET_skull_stripped.nii.gz"))
            .is_some()
    );
    let final_summary =
        std::fs::read_to_string(final_dir.join("sub-01_final_summary.txt")).unwrap();
    assert!(final_summary.contains("PET MNI: sub-01_PET_MNI.nii.gz"));
}

#[test]
fn omitted_pet_leaves_pet_stage_out_of_log() {
    let out = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(out.path(), |_| {});
    let outcome = pipeline.run(&SubjectInput::new("sub-01", MRI), None).unwrap();
    assert!(!outcome.data.processing_steps().contains(&StageName::PetProcessing));
    assert!(outcome.data.pet().is_none());
}

#[test]
fn roi_without_registration_is_precondition_error() {
    let out = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(out.path(), |c| c.registration.enabled = false);
    let err = pipeline.run(&SubjectInput::new("sub-01", MRI), None).unwrap_err();
    assert!(
        matches!(err, PipelineError::Precondition(ref m) if m.contains("registration")),
        "unexpected error: {err}"
    );
}

#[test]
fn pet_without_registration_degrades_with_warning() {
    let out = tempfile::tempdir().unwrap();
    let mut pipeline = pipeline(out.path(), |c| {
        c.registration.enabled = false;
        c.roi_extraction.enabled = false;
    });
    let input = SubjectInput::new("sub-01", MRI).with_pet(PET);
    let outcome = pipeline.run(&input, None).unwrap();

    assert!(outcome.data.processing_steps().contains(&StageName::PetProcessing));
    assert!(outcome.data.template().is_empty());
    let kinds: Vec<_> = outcome.data.warnings().iter().map(|w| w.kind).collect();
    assert_eq!(kinds, [WarningKind::MissingTransform]);
    let pet = outcome.data.pet().unwrap();
    assert!(pet.skull_stripped().is_some());
    assert!(pet.template().is_none());
}

#[test]
fn segmentation_fallback_counts_as_success() {
    let out = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::from_yaml_str(CONFIG).unwrap();
    config.output.base_dir = out.path().to_path_buf();
    let engine = engine().failing_segmentation();
    let mut pipeline = Pipeline::new(config, engine).unwrap();

    let outcome = pipeline.run(&SubjectInput::new("sub-01", MRI), None).unwrap();
    assert!(outcome.data.processing_steps().contains(&StageName::Segmentation));
    assert_eq!(outcome.data.warnings()[0].kind, WarningKind::SegmentationFallback);
    assert!(outcome.data.template().roi_features().is_some());
}
