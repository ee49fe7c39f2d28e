//! Multi-subject discovery and sequential batch runs.
//!
//! Subjects are found either from a subject list (one id per line, MRI
//! matched by `*<id>*<pattern>`) or by globbing `pattern` directly, in
//! which case the subject id is the file stem up to its last underscore.
//! A failing subject is recorded and the batch moves on.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::engine::ImageEngine;
use crate::pipeline::{Pipeline, SubjectInput};
use crate::types::PipelineError;

/// Default MRI file pattern.
pub const DEFAULT_PATTERN: &str = "*.nii.gz";

/// How to find subjects in an input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Directory holding the images.
    pub input_dir: PathBuf,
    /// MRI file pattern.
    pub pattern: String,
    /// PET file pattern, if PET should be paired.
    pub pet_pattern: Option<String>,
    /// Explicit subject ids. `None` globs `pattern` instead.
    pub subject_ids: Option<Vec<String>>,
}

impl DiscoveryOptions {
    /// Glob every file matching [`DEFAULT_PATTERN`] in `input_dir`.
    #[must_use]
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            pattern: DEFAULT_PATTERN.to_owned(),
            pet_pattern: None,
            subject_ids: None,
        }
    }
}

/// Subjects found, plus listed ids that had no MRI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Subjects to process, in discovery order.
    pub subjects: Vec<SubjectInput>,
    /// Listed subject ids with no matching MRI.
    pub missing: Vec<String>,
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Subjects attempted.
    pub total: usize,
    /// Subjects that completed.
    pub succeeded: Vec<String>,
    /// Subjects that failed, with the error message.
    pub failed: Vec<(String, String)>,
    /// Listed ids skipped because no MRI was found.
    pub missing: Vec<String>,
}

impl BatchReport {
    /// Returns `true` if every attempted subject succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// Human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = vec![
            "Batch Processing Summary".to_owned(),
            "=".repeat(60),
            format!("Total subjects: {}", self.total),
            format!("Successful: {}", self.succeeded.len()),
            format!("Failed: {}", self.failed.len()),
        ];
        if !self.failed.is_empty() {
            lines.push(String::new());
            lines.push("Failed subjects:".to_owned());
            lines.extend(
                self.failed
                    .iter()
                    .map(|(id, error)| format!("  - {id}: {error}")),
            );
        }
        if !self.missing.is_empty() {
            lines.push(String::new());
            lines.push(format!("No MRI found for: {}", self.missing.join(", ")));
        }
        lines.join("\n")
    }
}

/// Subject id from an image file name: the stem without `.nii.gz` or
/// `.nii`, up to its last underscore.
///
/// `sub-01_T1.nii.gz` gives `sub-01`; a stem without an underscore is
/// used whole.
#[must_use]
pub fn subject_id_from_filename(filename: &str) -> &str {
    let stem = filename
        .strip_suffix(".nii.gz")
        .or_else(|| filename.strip_suffix(".nii"))
        .unwrap_or(filename);
    stem.rsplit_once('_').map_or(stem, |(id, _)| id)
}

/// Read a subject list: one id per line, blank lines ignored.
///
/// # Errors
///
/// Returns [`PipelineError::Io`] if the file cannot be read.
pub fn read_subject_list(path: &Path) -> Result<Vec<String>, PipelineError> {
    let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Find subjects according to `options`.
///
/// # Errors
///
/// Returns [`PipelineError::InputNotFound`] if the input directory does
/// not exist, or [`PipelineError::Config`] if a pattern is malformed.
pub fn discover_subjects(options: &DiscoveryOptions) -> Result<Discovery, PipelineError> {
    if !options.input_dir.is_dir() {
        return Err(PipelineError::InputNotFound(options.input_dir.clone()));
    }

    let mut discovery = Discovery::default();
    match &options.subject_ids {
        Some(ids) => {
            for id in ids {
                match first_match(&options.input_dir, &id_pattern(id, &options.pattern))? {
                    Some(mri) => discovery.subjects.push(SubjectInput {
                        subject_id: id.clone(),
                        mri,
                        pet: find_pet(options, id)?,
                    }),
                    None => {
                        tracing::warn!(subject = %id, "no MRI file found");
                        discovery.missing.push(id.clone());
                    }
                }
            }
        }
        None => {
            for mri in glob_files(&options.input_dir, &options.pattern)? {
                let Some(filename) = mri.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let id = subject_id_from_filename(filename).to_owned();
                let pet = find_pet(options, &id)?;
                discovery.subjects.push(SubjectInput {
                    subject_id: id,
                    mri,
                    pet,
                });
            }
        }
    }
    tracing::info!(
        found = discovery.subjects.len(),
        missing = discovery.missing.len(),
        "subject discovery complete"
    );
    Ok(discovery)
}

fn find_pet(options: &DiscoveryOptions, id: &str) -> Result<Option<PathBuf>, PipelineError> {
    let Some(pet_pattern) = &options.pet_pattern else {
        return Ok(None);
    };
    first_match(&options.input_dir, &id_pattern(id, pet_pattern))
}

/// `*<id>*<pattern>`, without doubling a leading wildcard.
fn id_pattern(id: &str, pattern: &str) -> String {
    format!("*{id}*{}", pattern.trim_start_matches('*'))
}

fn first_match(dir: &Path, pattern: &str) -> Result<Option<PathBuf>, PipelineError> {
    Ok(glob_files(dir, pattern)?.into_iter().next())
}

/// Files in `dir` matching `pattern`, sorted by path.
fn glob_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let full = Path::new(&escaped).join(pattern);
    let paths = glob::glob(&full.to_string_lossy())
        .map_err(|e| PipelineError::Config(format!("invalid pattern {pattern:?}: {e}")))?;
    let mut found: Vec<PathBuf> = paths.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    found.sort();
    Ok(found)
}

/// Run every subject through `pipeline`, isolating failures.
pub fn run_batch<E: ImageEngine>(
    pipeline: &mut Pipeline<E>,
    discovery: &Discovery,
    output_dir: Option<&Path>,
) -> BatchReport {
    let total = discovery.subjects.len();
    let mut report = BatchReport {
        total,
        missing: discovery.missing.clone(),
        ..BatchReport::default()
    };

    for (i, subject) in discovery.subjects.iter().enumerate() {
        tracing::info!(
            subject = %subject.subject_id,
            progress = %format!("{}/{total}", i + 1),
            pet = subject.pet.is_some(),
            "batch subject"
        );
        match pipeline.run(subject, output_dir) {
            Ok(_) => report.succeeded.push(subject.subject_id.clone()),
            Err(e) => {
                tracing::error!(subject = %subject.subject_id, error = %e, "subject failed");
                report.failed.push((subject.subject_id.clone(), e.to_string()));
            }
        }
    }
    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"").unwrap();
        }
    }

    #[test]
    fn subject_ids_from_filenames() {
        assert_eq!(subject_id_from_filename("sub-01_T1.nii.gz"), "sub-01");
        assert_eq!(subject_id_from_filename("sub_02_T1.nii"), "sub_02");
        assert_eq!(subject_id_from_filename("scan.nii.gz"), "scan");
        assert_eq!(subject_id_from_filename("raw_image"), "raw");
    }

    #[test]
    fn pattern_mode_pairs_pet() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            &[
                "sub-01_T1.nii.gz",
                "sub-01_PET.nii.gz",
                "sub-02_T1.nii.gz",
                "notes.txt",
            ],
        );
        let options = DiscoveryOptions {
            pattern: "*_T1.nii.gz".to_owned(),
            pet_pattern: Some("*_PET.nii.gz".to_owned()),
            ..DiscoveryOptions::new(dir.path())
        };
        let found = discover_subjects(&options).unwrap();
        let ids: Vec<_> = found.subjects.iter().map(|s| s.subject_id.as_str()).collect();
        assert_eq!(ids, ["sub-01", "sub-02"]);
        assert_eq!(
            found.subjects[0].pet.as_deref(),
            Some(dir.path().join("sub-01_PET.nii.gz").as_path())
        );
        assert_eq!(found.subjects[1].pet, None);
        assert!(found.missing.is_empty());
    }

    #[test]
    fn subject_list_mode_records_missing() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["sub-01_T1.nii.gz", "sub-03_T1.nii.gz"]);
        let options = DiscoveryOptions {
            subject_ids: Some(vec!["sub-01".into(), "sub-02".into(), "sub-03".into()]),
            ..DiscoveryOptions::new(dir.path())
        };
        let found = discover_subjects(&options).unwrap();
        assert_eq!(found.subjects.len(), 2);
        assert_eq!(found.missing, ["sub-02"]);
    }

    #[test]
    fn subject_list_file_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("subjects.txt");
        std::fs::write(&list, "sub-01\n\n  sub-02  \n").unwrap();
        assert_eq!(read_subject_list(&list).unwrap(), ["sub-01", "sub-02"]);
    }

    #[test]
    fn missing_input_dir() {
        let options = DiscoveryOptions::new("/definitely/not/here");
        assert!(matches!(
            discover_subjects(&options),
            Err(PipelineError::InputNotFound(_))
        ));
    }

    #[test]
    fn report_summary_lists_failures() {
        let report = BatchReport {
            total: 2,
            succeeded: vec!["a".into()],
            failed: vec![("b".into(), "boom".into())],
            missing: vec!["c".into()],
        };
        assert!(!report.all_succeeded());
        let text = report.summary();
        assert!(text.contains("Total subjects: 2"));
        assert!(text.contains("  - b: boom"));
        assert!(text.contains("No MRI found for: c"));
    }
}
