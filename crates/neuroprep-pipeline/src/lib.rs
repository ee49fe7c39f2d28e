//! neuroprep-pipeline: space-aware orchestration of MRI/PET preprocessing.
//!
//! Runs a configurable sequence of stages over one subject:
//! skull stripping -> segmentation -> registration -> PET fusion ->
//! ROI extraction -> quality control.
//!
//! The crate does no numerical image processing itself. Registration,
//! resampling, classification, brain extraction and image I/O go through
//! the [`ImageEngine`] trait; the pipeline sequences those calls and keeps
//! every result bound to the coordinate space it lives in (see
//! [`ProcessingData`]). A concrete ANTs-backed engine lives in
//! `neuroprep-ants`. With the `testing` feature, `testing::MemoryEngine`
//! runs entirely in memory.

pub mod batch;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod engine;
pub mod layout;
pub mod method;
pub mod pipeline;
pub mod report;
pub mod stages;
pub mod stats;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use batch::{BatchReport, Discovery, DiscoveryOptions, discover_subjects, run_batch};
pub use config::{ConfigSummary, PipelineConfig, Statistic};
pub use data::{Field, ProcessingData, ProcessingSummary, Propagation, Warning, WarningKind};
pub use diagnostics::RunDiagnostics;
pub use engine::{EngineError, ImageEngine};
pub use layout::OutputLayout;
pub use pipeline::{Pipeline, RunOutcome, SubjectInput};
pub use stages::{QcReport, Stage, StageName};
pub use types::{
    Geometry, Interpolation, Modality, PipelineError, Registered, RegistrationParams, Segmented,
    Transform, TransformChain, TransformType, Volume,
};
