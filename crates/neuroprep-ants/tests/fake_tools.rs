//! `AntsEngine` driven through shell stand-ins for the ANTs tools.
//!
//! Each stand-in parses the arguments it receives the way the real tool
//! would, rejects anything malformed, and writes the files the real tool
//! writes.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ndarray::Array3;
use neuroprep_ants::{AntsEngine, AntsTools};
use neuroprep_pipeline::{
    EngineError, ImageEngine, Interpolation, Modality, RegistrationParams, TransformType, Volume,
};

const ANTS_REGISTRATION: &str = r##"#!/bin/sh
out= fixed= moving= syn=0
while [ $# -gt 0 ]; do
    case "$1" in
        --output) out=$2; shift ;;
        --transform)
            case "$2" in SyN\[*) syn=1 ;; esac
            shift ;;
        --metric)
            case "$2" in
                MI\[*|CC\[*) ;;
                *) echo "unknown metric: $2" >&2; exit 1 ;;
            esac
            spec=${2#*\[}
            fixed=${spec%%,*}
            rest=${spec#*,}
            moving=${rest%%,*}
            shift ;;
    esac
    shift
done
if [ ! -f "$fixed" ] || [ ! -f "$moving" ]; then
    echo "metric images missing" >&2
    exit 1
fi
spec=${out#\[}
spec=${spec%\]}
prefix=${spec%%,*}
warped=${spec#*,}
cp "$moving" "$warped"
echo "#Insight Transform File V1.0" > "${prefix}0GenericAffine.mat"
if [ "$syn" = 1 ]; then
    cp "$fixed" "${prefix}1Warp.nii.gz"
    cp "$fixed" "${prefix}1InverseWarp.nii.gz"
fi
"##;

const ANTS_APPLY_TRANSFORMS: &str = r#"#!/bin/sh
ref= out=
while [ $# -gt 0 ]; do
    case "$1" in
        --reference-image) ref=$2; shift ;;
        --output) out=$2; shift ;;
        --transform)
            t=${2#\[}
            t=${t%,1\]}
            if [ ! -f "$t" ]; then
                echo "missing transform: $t" >&2
                exit 1
            fi
            shift ;;
    esac
    shift
done
cp "$ref" "$out"
"#;

const ATROPOS: &str = r#"#!/bin/sh
image= mask= n=0 labels= probs=
while [ $# -gt 0 ]; do
    case "$1" in
        --intensity-image) image=$2; shift ;;
        --mask-image) mask=$2; shift ;;
        --initialization) n=${2#KMeans\[}; n=${n%\]}; shift ;;
        --output)
            spec=${2#\[}
            spec=${spec%\]}
            labels=${spec%%,*}
            probs=${spec#*,}
            shift ;;
    esac
    shift
done
if [ ! -f "$mask" ]; then
    echo "mask missing" >&2
    exit 1
fi
cp "$image" "$labels"
i=1
while [ "$i" -le "$n" ]; do
    cp "$image" "$(printf "$probs" "$i")"
    i=$((i + 1))
done
"#;

const SYNTHSTRIP: &str = r#"#!/bin/sh
cp "$2" "$4"
"#;

/// Every spawning test resolves the tools through here first, so no
/// script is still open for writing when a process is started.
fn tools() -> &'static AntsTools {
    static TOOLS: OnceLock<AntsTools> = OnceLock::new();
    TOOLS.get_or_init(|| {
        let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("fake-ants");
        std::fs::create_dir_all(&dir).unwrap();
        for (name, script) in [
            ("antsRegistration", ANTS_REGISTRATION),
            ("antsApplyTransforms", ANTS_APPLY_TRANSFORMS),
            ("Atropos", ATROPOS),
            ("mri_synthstrip", SYNTHSTRIP),
        ] {
            let path = dir.join(name);
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        AntsTools::discover_in(&[dir]).expect("stand-in tools are discoverable")
    })
}

fn engine() -> AntsEngine {
    AntsEngine::with_tools(tools().clone()).unwrap()
}

fn fixed() -> Volume {
    Volume::from_data(Array3::from_shape_fn((6, 5, 4), |(x, y, z)| {
        (x + 2 * y + 3 * z) as f32
    }))
}

fn moving() -> Volume {
    Volume::from_data(Array3::from_shape_fn((6, 5, 4), |(x, y, z)| {
        if x > 0 && y > 0 && z > 0 { 100.0 + x as f32 } else { 0.0 }
    }))
}

fn files_under(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            if path.is_dir() { files_under(&path) } else { 1 }
        })
        .sum()
}

#[test]
fn syn_registration_returns_warped_image_and_chains() {
    let engine = engine();
    let registered = engine
        .register(&fixed(), &moving(), TransformType::SyN, &RegistrationParams::default())
        .unwrap();
    assert_eq!(registered.warped.data(), moving().data());
    assert_eq!(registered.forward.len(), 2);
    assert_eq!(registered.inverse.len(), 2);
    assert!(registered.inverse.transforms()[0].inverse);
    let paths: Vec<&PathBuf> = registered
        .forward
        .transforms()
        .iter()
        .chain(registered.inverse.transforms())
        .map(|t| &t.path)
        .collect();
    assert!(paths.iter().all(|p| p.is_file()));
}

#[test]
fn chains_resample_onto_the_reference_grid() {
    let engine = engine();
    let registered = engine
        .register(&fixed(), &moving(), TransformType::Rigid, &RegistrationParams::default())
        .unwrap();
    let forward = engine
        .apply_transforms(&fixed(), &moving(), &registered.forward, Interpolation::Linear)
        .unwrap();
    assert_eq!(forward.data(), fixed().data());
    let back = engine
        .apply_transforms(
            &moving(),
            &fixed(),
            &registered.inverse,
            Interpolation::NearestNeighbor,
        )
        .unwrap();
    assert_eq!(back.data(), moving().data());
}

#[test]
fn segmentation_reads_every_probability_map() {
    let engine = engine();
    let segmented = engine.segment(&moving(), None, 3).unwrap();
    assert_eq!(segmented.labels.data(), moving().data());
    assert_eq!(segmented.probabilities.len(), 3);
}

#[test]
fn synthstrip_mask_is_binary() {
    let engine = engine();
    let mask = engine.extract_brain_mask(&moving(), Modality::T1).unwrap();
    assert!(mask.data().iter().all(|&v| v == 0.0 || v == 1.0));
    assert_eq!(mask.data()[[0, 0, 0]], 0.0);
    assert_eq!(mask.data()[[1, 1, 1]], 1.0);
}

#[test]
fn tool_failure_carries_its_stderr() {
    let engine = engine();
    let registered = engine
        .register(&fixed(), &moving(), TransformType::Affine, &RegistrationParams::default())
        .unwrap();
    engine.finish_subject("sub-01");
    let err = engine
        .apply_transforms(&fixed(), &moving(), &registered.forward, Interpolation::Linear)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Failed { operation: "apply_transforms", ref message }
            if message.contains("missing transform")
    ));
}

#[test]
fn scratch_does_not_grow_across_subjects() {
    let engine = engine();
    for subject in ["sub-01", "sub-02", "sub-03"] {
        let registered = engine
            .register(&fixed(), &moving(), TransformType::SyN, &RegistrationParams::default())
            .unwrap();
        for _ in 0..5 {
            engine
                .apply_transforms(&fixed(), &moving(), &registered.forward, Interpolation::Linear)
                .unwrap();
        }
        engine.segment(&moving(), None, 3).unwrap();
        // Affine, warp and inverse warp.
        assert_eq!(files_under(engine.scratch_dir()), 3, "{subject}");
        engine.finish_subject(subject);
        assert_eq!(files_under(engine.scratch_dir()), 0, "{subject}");
    }
}
