//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Apply helper contract and restart hook."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
//! Contract between the coordinator and the step that replaces the running
//! build. The coordinator only launches the step; replacing files and
//! relaunching belong to the external helper.

use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use async_trait::async_trait;
use tracing::info;

use crate::{Result, UpdateError};

/// Everything the apply step needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    /// Executable or bundle being replaced.
    pub target: PathBuf,
    /// Verified artifact in the staging directory.
    pub artifact: PathBuf,
    /// Log file the helper appends to; read back after the restart.
    pub log_path: PathBuf,
}

/// Launches the replacement of the running build.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Start the apply step and return once it is running.
    async fn apply(&self, request: &ApplyRequest) -> Result<()>;
}

/// Ends the current process so the new build can take over.
pub trait Restarter: Send + Sync {
    /// Exit the process. Test doubles record the call instead.
    fn restart(&self);
}

/// Runs `<helper> <target> <artifact> <log_path>` detached from the updater.
#[derive(Debug, Clone)]
pub struct HelperCommandApplier {
    helper: PathBuf,
}

impl HelperCommandApplier {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
        }
    }
}

#[async_trait]
impl Applier for HelperCommandApplier {
    async fn apply(&self, request: &ApplyRequest) -> Result<()> {
        let mut command = Command::new(&self.helper);
        command
            .arg(&request.target)
            .arg(&request.artifact)
            .arg(&request.log_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = request.artifact.parent() {
            command.current_dir(dir);
        }
        let child = command.spawn().map_err(|err| {
            UpdateError::Apply(format!(
                "couldn't start apply helper {}: {err}",
                self.helper.display()
            ))
        })?;
        info!(helper = %self.helper.display(), pid = child.id(), "apply helper started");
        Ok(())
    }
}

/// Applier used when no helper is configured; every apply fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct MissingHelperApplier;

#[async_trait]
impl Applier for MissingHelperApplier {
    async fn apply(&self, request: &ApplyRequest) -> Result<()> {
        Err(UpdateError::Apply(format!(
            "no apply helper configured; cannot apply {}",
            request.artifact.display()
        )))
    }
}

/// Exits the process with status 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl Restarter for ProcessExit {
    fn restart(&self) {
        info!("exiting for update");
        std::process::exit(0);
    }
}

/// Path the apply helper replaces: the executable itself, or on macOS the
/// enclosing `.app` bundle.
pub fn resolve_update_target(executable: &Path, platform: &str) -> PathBuf {
    if platform.eq_ignore_ascii_case("darwin") {
        if let Some(bundle) = app_bundle_root(executable) {
            return bundle;
        }
    }
    executable.to_path_buf()
}

fn app_bundle_root(path: &Path) -> Option<PathBuf> {
    let components: Vec<Component<'_>> = path.components().collect();
    let index = components.iter().rposition(|component| {
        matches!(component, Component::Normal(name) if name.to_string_lossy().ends_with(".app"))
    })?;
    Some(components[..=index].iter().collect())
}

/// Mark the staged artifact executable for its owner and group.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o750);
    std::fs::set_permissions(path, permissions)
}

/// Mark the staged artifact executable for its owner and group.
#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn darwin_targets_the_bundle_root() {
        let exe = Path::new("/Applications/Hatch.app/Contents/MacOS/hatch");
        assert_eq!(
            resolve_update_target(exe, "darwin"),
            PathBuf::from("/Applications/Hatch.app")
        );
        assert_eq!(resolve_update_target(exe, "linux"), exe.to_path_buf());
        let plain = Path::new("/usr/local/bin/hatch");
        assert_eq!(resolve_update_target(plain, "darwin"), plain.to_path_buf());
    }

    #[tokio::test]
    async fn missing_helper_refuses_to_apply() {
        let request = ApplyRequest {
            target: PathBuf::from("/usr/local/bin/hatch"),
            artifact: PathBuf::from("/tmp/staging/hatch"),
            log_path: PathBuf::from("/tmp/update.log"),
        };
        assert!(matches!(
            MissingHelperApplier.apply(&request).await,
            Err(UpdateError::Apply(_))
        ));
        let absent = HelperCommandApplier::new("/definitely/not/a/helper");
        assert!(matches!(absent.apply(&request).await, Err(UpdateError::Apply(_))));
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_is_set() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hatch");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        make_executable(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o100, 0o100);
    }
}
