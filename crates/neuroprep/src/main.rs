use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use neuroprep_ants::AntsEngine;
use neuroprep_pipeline::batch::{DEFAULT_PATTERN, read_subject_list};
use neuroprep_pipeline::{
    DiscoveryOptions, ImageEngine, Pipeline, PipelineConfig, PipelineError, SubjectInput,
    discover_subjects, run_batch,
};

#[derive(Parser)]
#[command(name = "neuroprep")]
#[command(about = "MRI/PET preprocessing: skull stripping, segmentation, registration, ROI features and QC")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process one subject
    Run {
        /// Subject ID
        #[arg(short, long)]
        subject: String,
        /// T1 MRI (.nii or .nii.gz)
        #[arg(short, long)]
        mri: PathBuf,
        /// PET image, registered to the MRI when given
        #[arg(short, long)]
        pet: Option<PathBuf>,
        /// Configuration file (YAML, or JSON by extension)
        #[arg(short, long, default_value = "config/pipeline_config.yaml")]
        config: PathBuf,
        /// Directory for stage outputs instead of the subject's intermediate/
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Process every subject found in a directory
    Batch {
        /// Directory containing the MRI files
        #[arg(short, long)]
        input: PathBuf,
        /// MRI file pattern
        #[arg(short, long, default_value = DEFAULT_PATTERN)]
        pattern: String,
        /// PET file pattern
        #[arg(long)]
        pet_pattern: Option<String>,
        /// Text file with subject IDs, one per line
        #[arg(short = 'l', long)]
        subject_list: Option<PathBuf>,
        /// Configuration file (YAML, or JSON by extension)
        #[arg(short, long, default_value = "config/pipeline_config.yaml")]
        config: PathBuf,
        /// Directory for stage outputs instead of each subject's intermediate/
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run {
            subject,
            mri,
            pet,
            config,
            output,
        } => {
            let mut input = SubjectInput::new(subject, mri);
            input.pet = pet;
            load_config(&config).and_then(|config| {
                let engine = ants_engine()?;
                cmd_run(config, engine, &input, output.as_deref())
            })
        }
        Command::Batch {
            input,
            pattern,
            pet_pattern,
            subject_list,
            config,
            output,
        } => {
            let options = subject_list
                .as_deref()
                .map(read_subject_list)
                .transpose()
                .map(|subject_ids| DiscoveryOptions {
                    input_dir: input,
                    pattern,
                    pet_pattern,
                    subject_ids,
                });
            options.and_then(|options| {
                let config = load_config(&config)?;
                cmd_batch(config, ants_engine, &options, output.as_deref())
            })
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }
    PipelineConfig::load(path)
}

fn ants_engine() -> Result<AntsEngine, PipelineError> {
    AntsEngine::discover().map_err(|e| PipelineError::Engine(e.into()))
}

fn print_config(pipeline: &Pipeline<impl ImageEngine>) {
    let summary = pipeline.config_summary();
    let steps: Vec<&str> = summary.enabled_steps.iter().map(|s| s.as_str()).collect();
    println!();
    println!("Pipeline Configuration:");
    println!("  Version: {}", summary.version);
    println!("  Enabled steps: {}", steps.join(", "));
    println!("  Output directory: {}", summary.output_dir.display());
    println!("  Engine: {}", pipeline.engine().name());
}

fn cmd_run<E: ImageEngine>(
    config: PipelineConfig,
    engine: E,
    input: &SubjectInput,
    output: Option<&Path>,
) -> Result<ExitCode, PipelineError> {
    if !input.mri.is_file() {
        return Err(PipelineError::InputNotFound(input.mri.clone()));
    }
    let mut pipeline = Pipeline::new(config, engine)?;
    print_config(&pipeline);

    let outcome = pipeline.run(input, output)?;
    println!();
    println!("Processing Summary:");
    let summary = serde_json::to_value(outcome.data.processing_summary())
        .map_err(|e| PipelineError::Export(e.to_string()))?;
    if let serde_json::Value::Object(fields) = summary {
        for (key, value) in fields {
            match value {
                serde_json::Value::String(text) => println!("  {key}: {text}"),
                other => println!("  {key}: {other}"),
            }
        }
    }
    for path in &outcome.final_outputs {
        tracing::debug!(path = %path.display(), "final output");
    }
    Ok(ExitCode::SUCCESS)
}

/// The engine is built only once subjects have been found, so a bad input
/// directory is reported before tool discovery.
fn cmd_batch<E: ImageEngine>(
    config: PipelineConfig,
    engine: impl FnOnce() -> Result<E, PipelineError>,
    options: &DiscoveryOptions,
    output: Option<&Path>,
) -> Result<ExitCode, PipelineError> {
    let discovery = discover_subjects(options)?;
    if discovery.subjects.is_empty() {
        return Err(PipelineError::Precondition(format!(
            "no subjects found in {}",
            options.input_dir.display()
        )));
    }
    println!();
    println!("Found {} subjects to process", discovery.subjects.len());
    println!("{}", "=".repeat(60));

    let mut pipeline = Pipeline::new(config, engine()?)?;
    print_config(&pipeline);
    let report = run_batch(&mut pipeline, &discovery, output);

    println!();
    println!("{}", report.summary());
    Ok(if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use neuroprep_pipeline::testing::{MemoryEngine, synthetic_head};

    use super::*;

    #[test]
    fn run_arguments_parse_with_default_config() {
        let cli = Cli::try_parse_from([
            "neuroprep", "run", "--subject", "sub-01", "--mri", "a.nii.gz", "-p", "b.nii.gz",
        ])
        .unwrap();
        let Command::Run {
            subject,
            pet,
            config,
            output,
            ..
        } = cli.command
        else {
            unreachable!("parsed as batch");
        };
        assert_eq!(subject, "sub-01");
        assert_eq!(pet, Some(PathBuf::from("b.nii.gz")));
        assert_eq!(config, PathBuf::from("config/pipeline_config.yaml"));
        assert_eq!(output, None);
    }

    #[test]
    fn batch_pattern_defaults() {
        let cli = Cli::try_parse_from(["neuroprep", "batch", "-i", "data", "-l", "ids.txt"]).unwrap();
        let Command::Batch {
            pattern,
            subject_list,
            pet_pattern,
            ..
        } = cli.command
        else {
            unreachable!("parsed as run");
        };
        assert_eq!(pattern, "*.nii.gz");
        assert_eq!(subject_list, Some(PathBuf::from("ids.txt")));
        assert_eq!(pet_pattern, None);
    }

    #[test]
    fn run_requires_subject_and_mri() {
        assert!(Cli::try_parse_from(["neuroprep", "run", "--mri", "a.nii.gz"]).is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = load_config(Path::new("/no/such/config.yaml")).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ref m) if m.contains("not found")));
    }

    #[test]
    fn run_on_missing_mri_fails_before_processing() {
        let input = SubjectInput::new("sub-01", "/no/such/mri.nii.gz");
        let err = cmd_run(PipelineConfig::default(), MemoryEngine::new(), &input, None).unwrap_err();
        assert!(matches!(err, PipelineError::InputNotFound(_)));
    }

    #[test]
    fn batch_with_no_subjects_fails() {
        let input = tempfile::tempdir().unwrap();
        let options = DiscoveryOptions::new(input.path());
        let err = cmd_batch(
            PipelineConfig::default(),
            || Ok(MemoryEngine::new()),
            &options,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(ref m) if m.contains("no subjects")));
    }

    #[test]
    fn batch_exit_code_reflects_failures() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let good = input.path().join("sub-01_T1.nii.gz");
        std::fs::write(&good, b"").unwrap();
        engine.insert(&good, synthetic_head());
        let mut config = PipelineConfig::default();
        config.output.base_dir = out.path().to_path_buf();

        let code = cmd_batch(
            config.clone(),
            || Ok(engine),
            &DiscoveryOptions::new(input.path()),
            None,
        )
        .unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        std::fs::write(input.path().join("sub-02_T1.nii.gz"), b"").unwrap();
        let code = cmd_batch(
            config,
            || Ok(MemoryEngine::new()),
            &DiscoveryOptions::new(input.path()),
            None,
        )
        .unwrap();
        assert_eq!(code, ExitCode::FAILURE);
    }
}
