//! Locating and running the external executables.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::AntsError;

/// Registration tool.
pub const ANTS_REGISTRATION: &str = "antsRegistration";
/// Resampling tool.
pub const ANTS_APPLY_TRANSFORMS: &str = "antsApplyTransforms";
/// Tissue classification tool.
pub const ATROPOS: &str = "Atropos";
/// Learned brain extraction tool (optional).
pub const SYNTHSTRIP: &str = "mri_synthstrip";

/// Resolved executable paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntsTools {
    /// `antsRegistration`.
    pub registration: PathBuf,
    /// `antsApplyTransforms`.
    pub apply_transforms: PathBuf,
    /// `Atropos`.
    pub atropos: PathBuf,
    /// `mri_synthstrip`, if installed.
    pub synthstrip: Option<PathBuf>,
}

impl AntsTools {
    /// Search `ANTSPATH` and then `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`AntsError::ToolNotFound`] naming the first required tool
    /// that is missing.
    pub fn discover() -> Result<Self, AntsError> {
        let mut dirs = Vec::new();
        if let Some(ants) = std::env::var_os("ANTSPATH") {
            dirs.push(PathBuf::from(ants));
        }
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }
        Self::discover_in(&dirs)
    }

    /// Search the given directories, in order.
    ///
    /// # Errors
    ///
    /// Returns [`AntsError::ToolNotFound`] naming the first required tool
    /// that is missing.
    pub fn discover_in(dirs: &[PathBuf]) -> Result<Self, AntsError> {
        let require = |name: &'static str| {
            find_executable(dirs, name).ok_or(AntsError::ToolNotFound(name))
        };
        let tools = Self {
            registration: require(ANTS_REGISTRATION)?,
            apply_transforms: require(ANTS_APPLY_TRANSFORMS)?,
            atropos: require(ATROPOS)?,
            synthstrip: find_executable(dirs, SYNTHSTRIP),
        };
        tracing::info!(
            registration = %tools.registration.display(),
            synthstrip = tools.synthstrip.is_some(),
            "found ANTs tools"
        );
        Ok(tools)
    }
}

/// First `dir/name` that is an executable file.
#[must_use]
pub fn find_executable(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(name).with_extension(std::env::consts::EXE_EXTENSION))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Run `program` to completion, capturing its output.
///
/// # Errors
///
/// Returns [`AntsError::Spawn`] if the process cannot start, or
/// [`AntsError::ToolFailed`] with its stderr if it exits unsuccessfully.
pub fn run(program: &Path, args: &[OsString]) -> Result<(), AntsError> {
    let tool = program
        .file_name()
        .map_or_else(|| program.display().to_string(), |n| n.to_string_lossy().into_owned());
    tracing::debug!(tool = %tool, ?args, "running");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| AntsError::Spawn {
            tool: tool.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(AntsError::ToolFailed {
            tool,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn install(dir: &Path, name: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn discovers_required_tools_and_optional_synthstrip() {
        let dir = tempfile::tempdir().unwrap();
        for name in [ANTS_REGISTRATION, ANTS_APPLY_TRANSFORMS, ATROPOS] {
            install(dir.path(), name, "#!/bin/sh\n");
        }
        let tools = AntsTools::discover_in(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(tools.atropos, dir.path().join(ATROPOS));
        assert_eq!(tools.synthstrip, None);
    }

    #[cfg(unix)]
    #[test]
    fn missing_atropos_is_reported_by_name() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), ANTS_REGISTRATION, "#!/bin/sh\n");
        install(dir.path(), ANTS_APPLY_TRANSFORMS, "#!/bin/sh\n");
        let err = AntsTools::discover_in(&[dir.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, AntsError::ToolNotFound(ATROPOS)));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ATROPOS), "").unwrap();
        assert_eq!(find_executable(&[dir.path().to_path_buf()], ATROPOS), None);
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_reports_stderr() {
        let args: Vec<OsString> = vec!["-c".into(), "echo 'no such metric' >&2; exit 3".into()];
        let err = run(Path::new("/bin/sh"), &args).unwrap_err();
        assert!(matches!(err, AntsError::ToolFailed { status: Some(3), .. }));
        assert_eq!(err.to_string(), "sh exited with status 3: no such metric");
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = run(Path::new("/no/such/antsRegistration"), &[]).unwrap_err();
        assert!(matches!(err, AntsError::Spawn { .. }));
    }
}
