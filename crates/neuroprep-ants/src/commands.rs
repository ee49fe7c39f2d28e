//! Argument lists for the ANTs tools.
//!
//! Kept free of I/O so the exact command lines can be checked in tests.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use neuroprep_pipeline::{
    Interpolation, RegistrationParams, Transform, TransformChain, TransformType,
};

/// Linear stages: MI metric, four-level pyramid.
const LINEAR_CONVERGENCE: &str = "[1000x500x250x100,1e-6,10]";
/// SyN stage: CC metric, four-level pyramid.
const SYN_CONVERGENCE: &str = "[100x70x50x20,1e-6,10]";
const SHRINK_FACTORS: &str = "8x4x2x1";
const SMOOTHING_SIGMAS: &str = "3x2x1x0vox";

/// `[a,b,...]` with each part verbatim.
fn bracketed<I, S>(parts: I) -> OsString
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut out = OsString::from("[");
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            out.push(",");
        }
        out.push(part.as_ref());
    }
    out.push("]");
    out
}

/// `NAME[a,b,...]`, the ANTs metric syntax.
fn metric<I, S>(name: &str, parts: I) -> OsString
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut out = OsString::from(name);
    out.push(bracketed(parts));
    out
}

/// `prefix` with `suffix` appended to its final component.
#[must_use]
pub fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Files written by `antsRegistration --output [prefix,...]` with collapsed
/// transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutputs {
    /// Moving image resampled onto the fixed grid.
    pub warped: PathBuf,
    /// Linear part of the transform.
    pub affine: PathBuf,
    /// Displacement field (SyN only).
    pub warp: PathBuf,
    /// Inverse displacement field (SyN only).
    pub inverse_warp: PathBuf,
}

impl RegistrationOutputs {
    /// Output names under `prefix`.
    #[must_use]
    pub fn new(prefix: &Path) -> Self {
        Self {
            warped: suffixed(prefix, "Warped.nii.gz"),
            affine: suffixed(prefix, "0GenericAffine.mat"),
            warp: suffixed(prefix, "1Warp.nii.gz"),
            inverse_warp: suffixed(prefix, "1InverseWarp.nii.gz"),
        }
    }

    /// Moving-to-fixed and fixed-to-moving chains.
    ///
    /// SyN: forward `[warp, affine]`, inverse `[affine^-1, inverse_warp]`.
    /// Linear models use the affine alone.
    #[must_use]
    pub fn chains(&self, transform: TransformType) -> (TransformChain, TransformChain) {
        match transform {
            TransformType::SyN => (
                TransformChain::new(vec![
                    Transform::forward(&self.warp),
                    Transform::forward(&self.affine),
                ]),
                TransformChain::new(vec![
                    Transform::inverted(&self.affine),
                    Transform::forward(&self.inverse_warp),
                ]),
            ),
            TransformType::Rigid | TransformType::Affine => (
                TransformChain::new(vec![Transform::forward(&self.affine)]),
                TransformChain::new(vec![Transform::inverted(&self.affine)]),
            ),
        }
    }

    /// Files that must exist after a successful run.
    #[must_use]
    pub fn expected(&self, transform: TransformType) -> Vec<&Path> {
        let mut files = vec![self.warped.as_path(), self.affine.as_path()];
        if transform == TransformType::SyN {
            files.push(&self.warp);
            files.push(&self.inverse_warp);
        }
        files
    }
}

fn linear_stage(args: &mut Vec<OsString>, model: &str, fixed: &Path, moving: &Path) {
    let stage: [OsString; 10] = [
        "--transform".into(),
        format!("{model}[0.1]").into(),
        "--metric".into(),
        metric(
            "MI",
            [
                fixed.as_os_str(),
                moving.as_os_str(),
                OsStr::new("1"),
                OsStr::new("32"),
                OsStr::new("Regular"),
                OsStr::new("0.25"),
            ],
        ),
        "--convergence".into(),
        LINEAR_CONVERGENCE.into(),
        "--shrink-factors".into(),
        SHRINK_FACTORS.into(),
        "--smoothing-sigmas".into(),
        SMOOTHING_SIGMAS.into(),
    ];
    args.extend(stage);
}

/// `antsRegistration` arguments registering `moving` onto `fixed`.
///
/// SyN runs an affine stage first.
#[must_use]
pub fn registration_args(
    fixed: &Path,
    moving: &Path,
    prefix: &Path,
    transform: TransformType,
    params: &RegistrationParams,
) -> Vec<OsString> {
    let outputs = RegistrationOutputs::new(prefix);
    let mut args: Vec<OsString> = vec![
        "--dimensionality".into(),
        "3".into(),
        "--float".into(),
        "1".into(),
        "--collapse-output-transforms".into(),
        "1".into(),
        "--output".into(),
        bracketed([prefix.as_os_str(), outputs.warped.as_os_str()]),
        "--interpolation".into(),
        "Linear".into(),
        "--winsorize-image-intensities".into(),
        "[0.005,0.995]".into(),
        "--initial-moving-transform".into(),
        bracketed([fixed.as_os_str(), moving.as_os_str(), OsStr::new("1")]),
    ];
    match transform {
        TransformType::Rigid => linear_stage(&mut args, "Rigid", fixed, moving),
        TransformType::Affine => linear_stage(&mut args, "Affine", fixed, moving),
        TransformType::SyN => {
            linear_stage(&mut args, "Affine", fixed, moving);
            let stage: [OsString; 10] = [
                "--transform".into(),
                format!(
                    "SyN[{},{},{}]",
                    params.grad_step, params.flow_sigma, params.total_sigma
                )
                .into(),
                "--metric".into(),
                metric(
                    "CC",
                    [
                        fixed.as_os_str(),
                        moving.as_os_str(),
                        OsStr::new("1"),
                        OsStr::new("4"),
                    ],
                ),
                "--convergence".into(),
                SYN_CONVERGENCE.into(),
                "--shrink-factors".into(),
                SHRINK_FACTORS.into(),
                "--smoothing-sigmas".into(),
                SMOOTHING_SIGMAS.into(),
            ];
            args.extend(stage);
        }
    }
    args
}

/// `antsApplyTransforms` arguments resampling `moving` onto `reference`.
#[must_use]
pub fn apply_transforms_args(
    reference: &Path,
    moving: &Path,
    output: &Path,
    transforms: &TransformChain,
    interpolation: Interpolation,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--dimensionality".into(),
        "3".into(),
        "--float".into(),
        "1".into(),
        "--input".into(),
        moving.into(),
        "--reference-image".into(),
        reference.into(),
        "--output".into(),
        output.into(),
        "--interpolation".into(),
        interpolation.as_str().into(),
    ];
    for transform in transforms.transforms() {
        args.push("--transform".into());
        args.push(if transform.inverse {
            bracketed([transform.path.as_os_str(), OsStr::new("1")])
        } else {
            transform.path.clone().into_os_string()
        });
    }
    args
}

/// `Atropos` k-means arguments. Probability maps are written as
/// `<prob_prefix>01.nii.gz`, `<prob_prefix>02.nii.gz`, ...
#[must_use]
pub fn atropos_args(
    image: &Path,
    mask: &Path,
    num_classes: usize,
    labels: &Path,
    prob_prefix: &Path,
) -> Vec<OsString> {
    vec![
        "--image-dimensionality".into(),
        "3".into(),
        "--intensity-image".into(),
        image.into(),
        "--mask-image".into(),
        mask.into(),
        "--initialization".into(),
        format!("KMeans[{num_classes}]").into(),
        "--convergence".into(),
        "[5,0]".into(),
        "--mrf".into(),
        "[0.2,1x1x1]".into(),
        "--output".into(),
        bracketed([
            labels.as_os_str(),
            suffixed(prob_prefix, "%02d.nii.gz").as_os_str(),
        ]),
    ]
}

/// Path of the `class`-th (1-based) Atropos probability map.
#[must_use]
pub fn atropos_probability(prob_prefix: &Path, class: usize) -> PathBuf {
    suffixed(prob_prefix, &format!("{class:02}.nii.gz"))
}

/// `mri_synthstrip` arguments writing a binary mask.
#[must_use]
pub fn synthstrip_args(image: &Path, mask: &Path) -> Vec<OsString> {
    vec!["-i".into(), image.into(), "-m".into(), mask.into()]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    fn count(args: &[String], flag: &str) -> usize {
        args.iter().filter(|a| *a == flag).count()
    }

    #[test]
    fn syn_runs_affine_then_syn_stage() {
        let args = strings(&registration_args(
            Path::new("/s/fixed.nii.gz"),
            Path::new("/s/moving.nii.gz"),
            Path::new("/s/reg_"),
            TransformType::SyN,
            &RegistrationParams::default(),
        ));
        assert_eq!(count(&args, "--transform"), 2);
        let affine = args.iter().position(|a| a == "Affine[0.1]").unwrap();
        let syn = args.iter().position(|a| a == "SyN[0.1,3,0]").unwrap();
        assert!(affine < syn);
        assert!(args.contains(&"[/s/reg_,/s/reg_Warped.nii.gz]".to_owned()));
        assert!(args.contains(&"CC[/s/fixed.nii.gz,/s/moving.nii.gz,1,4]".to_owned()));
    }

    #[test]
    fn rigid_is_a_single_mi_stage() {
        let args = strings(&registration_args(
            Path::new("f.nii.gz"),
            Path::new("m.nii.gz"),
            Path::new("p_"),
            TransformType::Rigid,
            &RegistrationParams::default(),
        ));
        assert_eq!(count(&args, "--transform"), 1);
        assert!(args.contains(&"Rigid[0.1]".to_owned()));
        assert!(args.contains(&"MI[f.nii.gz,m.nii.gz,1,32,Regular,0.25]".to_owned()));
    }

    #[test]
    fn metric_values_put_the_name_before_the_brackets() {
        let args = strings(&registration_args(
            Path::new("f.nii.gz"),
            Path::new("m.nii.gz"),
            Path::new("p_"),
            TransformType::SyN,
            &RegistrationParams::default(),
        ));
        let metrics: Vec<&str> = args
            .iter()
            .zip(&args[1..])
            .filter(|(flag, _)| *flag == "--metric")
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(
            metrics,
            [
                "MI[f.nii.gz,m.nii.gz,1,32,Regular,0.25]",
                "CC[f.nii.gz,m.nii.gz,1,4]",
            ]
        );
    }

    #[test]
    fn syn_chains_follow_ants_order() {
        let outputs = RegistrationOutputs::new(Path::new("/s/reg_"));
        let (forward, inverse) = outputs.chains(TransformType::SyN);
        assert_eq!(
            forward.transforms(),
            [
                Transform::forward("/s/reg_1Warp.nii.gz"),
                Transform::forward("/s/reg_0GenericAffine.mat"),
            ]
        );
        assert_eq!(
            inverse.transforms(),
            [
                Transform::inverted("/s/reg_0GenericAffine.mat"),
                Transform::forward("/s/reg_1InverseWarp.nii.gz"),
            ]
        );
        assert_eq!(outputs.expected(TransformType::Affine).len(), 2);
        assert_eq!(outputs.expected(TransformType::SyN).len(), 4);
    }

    #[test]
    fn inverted_transforms_use_bracket_syntax() {
        let chain = TransformChain::new(vec![
            Transform::inverted("a.mat"),
            Transform::forward("w.nii.gz"),
        ]);
        let args = strings(&apply_transforms_args(
            Path::new("ref.nii.gz"),
            Path::new("in.nii.gz"),
            Path::new("out.nii.gz"),
            &chain,
            Interpolation::NearestNeighbor,
        ));
        let tail: Vec<&str> = args[args.len() - 4..].iter().map(String::as_str).collect();
        assert_eq!(tail, ["--transform", "[a.mat,1]", "--transform", "w.nii.gz"]);
        assert!(args.contains(&"NearestNeighbor".to_owned()));
    }

    #[test]
    fn atropos_kmeans_settings() {
        let args = strings(&atropos_args(
            Path::new("img.nii.gz"),
            Path::new("mask.nii.gz"),
            3,
            Path::new("seg.nii.gz"),
            Path::new("prob"),
        ));
        assert!(args.contains(&"KMeans[3]".to_owned()));
        assert!(args.contains(&"[5,0]".to_owned()));
        assert!(args.contains(&"[0.2,1x1x1]".to_owned()));
        assert!(args.contains(&"[seg.nii.gz,prob%02d.nii.gz]".to_owned()));
        assert_eq!(
            atropos_probability(Path::new("prob"), 2),
            PathBuf::from("prob02.nii.gz")
        );
    }
}
