// src/exec/scratch.rs

//! Host directory bound to the unit's scratch area on the local backend.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, anyhow};
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::{GangwayError, Result};

/// Either a caller-provided directory (left alone after the run) or an
/// ephemeral one created for this unit (removed after the run).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchDir {
    path: PathBuf,
    ephemeral: bool,
}

impl ScratchDir {
    pub fn pre_bound(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ephemeral: false,
        }
    }

    /// Use `pre_bound` when given, otherwise create `<work_dir>/<unit>`
    /// world-writable and apply `label` to it.
    pub async fn resolve(
        unit: &str,
        pre_bound: Option<&Path>,
        work_dir: &Path,
        label: Option<&str>,
    ) -> Result<Self> {
        if let Some(dir) = pre_bound {
            if !tokio::fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
                return Err(GangwayError::ConfigError(format!(
                    "pre-bound scratch directory {dir:?} does not exist"
                )));
            }
            info!(unit, dir = ?dir, "using host directory for scratch area");
            return Ok(Self::pre_bound(dir));
        }

        let path = work_dir.join(unit);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("creating ephemeral scratch dir {path:?}"))?;

        let dir = Self {
            path,
            ephemeral: true,
        };
        if let Err(e) = prepare(&dir.path, label).await {
            dir.discard().await;
            return Err(e);
        }

        info!(unit, dir = ?dir.path, "created ephemeral scratch area");
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Remove the host directory entry of an ephemeral dir. Errors are
    /// logged; a directory that is already gone is fine.
    pub async fn discard(&self) {
        if !self.ephemeral {
            return;
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => info!(dir = ?self.path, "removed ephemeral scratch dir"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = ?self.path, error = %e, "failed to remove ephemeral scratch dir"),
        }
    }
}

/// Open up permissions on a fresh ephemeral dir and label it.
async fn prepare(dir: &Path, label: Option<&str>) -> Result<()> {
    // create_dir_all honours the umask; the unit's users need rwx.
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
        .await
        .with_context(|| format!("setting permissions on {dir:?}"))?;

    match label {
        Some(label) => apply_label(dir, label).await,
        None => Ok(()),
    }
}

/// `chcon -R <label> <dir>`
pub fn label_command(dir: &Path, label: &str) -> Command {
    let mut cmd = Command::new("chcon");
    cmd.arg("-R").arg(label).arg(dir);
    cmd.stdout(Stdio::null()).stderr(Stdio::piped());
    cmd
}

async fn apply_label(dir: &Path, label: &str) -> Result<()> {
    let output = label_command(dir, label)
        .output()
        .await
        .with_context(|| format!("running chcon on {dir:?}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "failed to set security label {label} on {dir:?}: {}",
            stderr.trim()
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_command_is_recursive_chcon() {
        let cmd = label_command(Path::new("/srv/u"), "system_u:object_r:container_file_t:s0");
        let inner = cmd.as_std();
        assert_eq!(inner.get_program(), std::ffi::OsStr::new("chcon"));
        let args: Vec<_> = inner.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["-R", "system_u:object_r:container_file_t:s0", "/srv/u"]);
    }

    #[tokio::test]
    async fn ephemeral_dir_is_created_world_writable_and_discarded() {
        let work = tempfile::tempdir().unwrap();
        let dir = ScratchDir::resolve("unit-0", None, work.path(), None).await.unwrap();

        assert!(dir.is_ephemeral());
        assert_eq!(dir.path(), work.path().join("unit-0"));
        let mode = std::fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        dir.discard().await;
        assert!(!dir.path().exists());
        // Idempotent.
        dir.discard().await;
    }

    #[tokio::test]
    async fn failed_preparation_removes_the_fresh_dir() {
        let work = tempfile::tempdir().unwrap();
        // Rejected whether or not chcon exists or SELinux is enabled.
        let result = ScratchDir::resolve("unit-0", None, work.path(), Some("not-a-context")).await;

        assert!(result.is_err());
        assert!(!work.path().join("unit-0").exists());
    }

    #[tokio::test]
    async fn pre_bound_dir_is_kept() {
        let host = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let dir = ScratchDir::resolve("unit-0", Some(host.path()), work.path(), Some("ignored"))
            .await
            .unwrap();

        assert!(!dir.is_ephemeral());
        dir.discard().await;
        assert!(host.path().exists());
        assert!(!work.path().join("unit-0").exists());
    }

    #[tokio::test]
    async fn missing_pre_bound_dir_is_an_error() {
        let work = tempfile::tempdir().unwrap();
        let missing = work.path().join("nope");
        assert!(ScratchDir::resolve("u", Some(&missing), work.path(), None).await.is_err());
    }
}
