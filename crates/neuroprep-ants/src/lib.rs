//! neuroprep-ants: an [`ImageEngine`] backed by the ANTs command-line tools.
//!
//! Images cross the process boundary as NIfTI files in a per-engine
//! scratch directory. Registration, resampling and tissue classification
//! shell out to `antsRegistration`, `antsApplyTransforms` and `Atropos`;
//! learned brain extraction uses `mri_synthstrip` when it is installed.
//!
//! [`ImageEngine`]: neuroprep_pipeline::ImageEngine

pub mod commands;
pub mod engine;
pub mod error;
pub mod nifti_io;
pub mod tools;

pub use engine::AntsEngine;
pub use error::AntsError;
pub use nifti_io::{read_volume, write_volume};
pub use tools::AntsTools;
