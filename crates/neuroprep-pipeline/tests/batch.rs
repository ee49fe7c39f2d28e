//! Integration tests: discovery on a real directory, runs in memory.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use neuroprep_pipeline::testing::{MemoryEngine, synthetic_head};
use neuroprep_pipeline::{
    DiscoveryOptions, Pipeline, PipelineConfig, discover_subjects, run_batch,
};

#[test]
fn subject_list_with_missing_subject() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let engine = MemoryEngine::new();
    for name in ["sub-01_T1.nii.gz", "sub-03_T1.nii.gz"] {
        let path = input.path().join(name);
        std::fs::write(&path, b"").unwrap();
        engine.insert(&path, synthetic_head());
    }

    let options = DiscoveryOptions {
        subject_ids: Some(vec!["sub-01".into(), "sub-02".into(), "sub-03".into()]),
        ..DiscoveryOptions::new(input.path())
    };
    let discovery = discover_subjects(&options).unwrap();

    let mut config = PipelineConfig::from_yaml_str(
        "skull_stripping: {enabled: true, methods: {ants: {enabled: true}}}",
    )
    .unwrap();
    config.output.base_dir = out.path().to_path_buf();
    let mut pipeline = Pipeline::new(config, engine).unwrap();

    let report = run_batch(&mut pipeline, &discovery, None);
    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, ["sub-01", "sub-03"]);
    assert!(report.all_succeeded());
    assert_eq!(report.missing, ["sub-02"]);
    assert!(out.path().join("sub-03/intermediate/sub-03_summary.txt").is_file());
    assert!(!out.path().join("sub-02").exists());
}

#[test]
fn failing_subject_does_not_stop_the_batch() {
    let input = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let engine = MemoryEngine::new();
    // sub-01 exists on disk but the engine cannot read it.
    std::fs::write(input.path().join("sub-01_T1.nii.gz"), b"").unwrap();
    let good = input.path().join("sub-02_T1.nii.gz");
    std::fs::write(&good, b"").unwrap();
    engine.insert(&good, synthetic_head());

    let discovery = discover_subjects(&DiscoveryOptions::new(input.path())).unwrap();
    let mut config = PipelineConfig::default();
    config.output.base_dir = out.path().to_path_buf();
    let mut pipeline = Pipeline::new(config, engine).unwrap();

    let report = run_batch(&mut pipeline, &discovery, None);
    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, ["sub-02"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "sub-01");
    assert!(report.summary().contains("Failed: 1"));
    assert_eq!(pipeline.engine().finished_subjects(), ["sub-01", "sub-02"]);
}
