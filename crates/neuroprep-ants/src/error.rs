//! Error type for the ANTs engine.

use std::path::PathBuf;

use neuroprep_pipeline::EngineError;

/// Errors raised while driving the ANTs tools or moving images through
/// NIfTI files.
#[derive(Debug, thiserror::Error)]
pub enum AntsError {
    /// A required executable is not on `PATH` or `ANTSPATH`.
    #[error("{0} not found on PATH or ANTSPATH")]
    ToolNotFound(&'static str),

    /// The tool could not be started.
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        /// Executable name.
        tool: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited unsuccessfully.
    #[error("{tool} exited with status {}: {stderr}", .status.map_or_else(|| "unknown".to_owned(), |c| c.to_string()))]
    ToolFailed {
        /// Executable name.
        tool: String,
        /// Exit code, if the process was not killed by a signal.
        status: Option<i32>,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// The tool succeeded but an expected output file is missing.
    #[error("expected output {} was not produced", .0.display())]
    MissingOutput(PathBuf),

    /// NIfTI decoding or encoding failed.
    #[error("NIfTI error on {}: {source}", .path.display())]
    Nifti {
        /// File being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: nifti::NiftiError,
    },

    /// The image is not a single 3D volume.
    #[error("unsupported image shape {shape:?} in {}", .path.display())]
    UnsupportedShape {
        /// File being read.
        path: PathBuf,
        /// Shape found.
        shape: Vec<usize>,
    },

    /// Scratch directory handling failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl AntsError {
    /// Convert into the engine-level error, naming the capability that
    /// failed.
    #[must_use]
    pub fn into_engine_error(self, operation: &'static str) -> EngineError {
        match self {
            Self::ToolNotFound(_) => EngineError::Unavailable(self.to_string()),
            Self::Io { path, source } => EngineError::Io { path, source },
            other => EngineError::failed(operation, other),
        }
    }
}

impl From<AntsError> for EngineError {
    fn from(err: AntsError) -> Self {
        err.into_engine_error("ants")
    }
}
