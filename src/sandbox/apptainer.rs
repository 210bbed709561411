//! Namespace runtime backend using Apptainer named instances.
//!
//! A unit is an instance named after the unit; the entry script runs through
//! `apptainer exec` against that instance so its output can be streamed and
//! its exit code observed, while `instance stop` tears it down by name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use super::process::{child_lines, run_checked, spawn_piped, wait_child};
use super::{BackendKind, LaunchSpec, SandboxBackend, SandboxHandle};
use crate::error::SandboxError;

/// Apptainer launch options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApptainerOptions {
    /// Runtime executable (`apptainer` or `singularity`).
    pub binary: String,
    /// Writable overlay image attached to every instance.
    pub overlay: Option<PathBuf>,
    /// Size used when the overlay has to be created.
    pub overlay_size_mb: u64,
}

impl Default for ApptainerOptions {
    fn default() -> Self {
        Self {
            binary: "apptainer".to_string(),
            overlay: None,
            overlay_size_mb: 4096,
        }
    }
}

impl ApptainerOptions {
    pub fn with_overlay(mut self, path: impl Into<PathBuf>, size_mb: u64) -> Self {
        self.overlay = Some(path.into());
        self.overlay_size_mb = size_mb;
        self
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

/// True on shared clusters: scratch file systems or a SLURM allocation.
pub fn is_hpc(work_dir: &Path) -> bool {
    work_dir.to_string_lossy().contains("/scratch") || std::env::var_os("SLURM_JOBID").is_some()
}

/// Privilege flags for `instance start`.
///
/// Clusters only get `--fakeroot` together with an overlay and fall back to
/// `--cleanenv` otherwise; workstations always use `--fakeroot`.
pub fn privilege_flags(hpc: bool, overlay: Option<&Path>) -> Vec<String> {
    let mut flags = Vec::new();
    match (hpc, overlay) {
        (true, Some(overlay)) => {
            flags.push("--fakeroot".to_string());
            flags.push("--overlay".to_string());
            flags.push(overlay.display().to_string());
        }
        (true, None) => flags.push("--cleanenv".to_string()),
        (false, overlay) => {
            flags.push("--fakeroot".to_string());
            if let Some(overlay) = overlay {
                flags.push("--overlay".to_string());
                flags.push(overlay.display().to_string());
            }
        }
    }
    flags
}

/// Creates an ext3 overlay image of `size_mb` at `path` unless it exists.
/// Returns whether a new image was created.
pub async fn ensure_overlay(path: &Path, size_mb: u64) -> Result<bool, SandboxError> {
    if path.exists() {
        debug!(overlay = %path.display(), "Using existing overlay");
        return Ok(false);
    }

    info!(overlay = %path.display(), size_mb, "Creating overlay");
    run_checked(
        "dd",
        &[
            "if=/dev/zero".to_string(),
            format!("of={}", path.display()),
            "bs=1M".to_string(),
            format!("count={}", size_mb),
        ],
    )
    .await?;
    run_checked("mkfs.ext3", &["-F".to_string(), path.display().to_string()]).await?;
    Ok(true)
}

/// Runs units as Apptainer instances.
pub struct ApptainerBackend {
    options: ApptainerOptions,
}

impl ApptainerBackend {
    pub fn new(options: ApptainerOptions) -> Self {
        Self { options }
    }

    /// Arguments of `instance start` for `spec`.
    pub fn instance_start_args(&self, spec: &LaunchSpec, hpc: bool) -> Vec<String> {
        let mut args = vec![
            "instance".to_string(),
            "start".to_string(),
            "--bind".to_string(),
            format!("{}:{}", spec.host_workdir.display(), spec.container_workdir),
        ];
        args.extend(privilege_flags(hpc, self.options.overlay.as_deref()));
        args.push(spec.image.clone());
        args.push(spec.unit_name.clone());
        args
    }

    /// Arguments of the `exec` that runs the entry script inside the instance.
    pub fn exec_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--pwd".to_string(),
            spec.container_workdir.clone(),
        ];
        for pair in spec.env_pairs() {
            args.push("--env".to_string());
            args.push(pair);
        }
        args.push(format!("instance://{}", spec.unit_name));
        args.push(spec.command.clone());
        args
    }
}

#[async_trait]
impl SandboxBackend for ApptainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Apptainer
    }

    async fn prepare(&self, spec: &LaunchSpec) -> Result<(), SandboxError> {
        self.teardown(&spec.unit_name).await?;
        if let Some(overlay) = &self.options.overlay {
            ensure_overlay(overlay, self.options.overlay_size_mb).await?;
        }
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<SandboxHandle, SandboxError> {
        let hpc = is_hpc(&spec.host_workdir);
        if hpc {
            info!(unit = %spec.unit_name, "HPC environment detected");
        }

        run_checked(&self.options.binary, &self.instance_start_args(spec, hpc)).await?;

        let mut command = Command::new(&self.options.binary);
        command.args(self.exec_args(spec));
        let child = spawn_piped(command)?;

        info!(unit = %spec.unit_name, image = %spec.image, "Apptainer instance started");
        Ok(SandboxHandle::new(&spec.unit_name, format!("instance://{}", spec.unit_name))
            .with_child(child))
    }

    fn stream_logs(
        &self,
        handle: &mut SandboxHandle,
    ) -> BoxStream<'static, Result<String, SandboxError>> {
        child_lines(handle)
    }

    async fn wait(&self, handle: &mut SandboxHandle) -> Result<i64, SandboxError> {
        wait_child(handle).await
    }

    async fn teardown(&self, unit_name: &str) -> Result<(), SandboxError> {
        let args = vec!["instance".to_string(), "stop".to_string(), unit_name.to_string()];
        match run_checked(&self.options.binary, &args).await {
            Ok(_) => {
                debug!(unit = unit_name, "Instance stopped");
                Ok(())
            }
            // No such instance.
            Err(SandboxError::LaunchFailed(reason)) => {
                debug!(unit = unit_name, %reason, "No instance to stop");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn spec() -> LaunchSpec {
        let mut env = BTreeMap::new();
        env.insert("SUBJECT".to_string(), "1".to_string());
        env.insert("INPUT_DOCUMENT_PATH".to_string(), "/workdir/inputs.json".to_string());
        LaunchSpec::new("tgv_sub-1", "docker://vnmd/qsmxt:1", "/home/u/runs/tgv_sub-1").with_env(env)
    }

    #[test]
    fn test_privilege_flags() {
        let overlay = Path::new("/scratch/overlay.img");
        assert_eq!(
            privilege_flags(true, Some(overlay)),
            vec!["--fakeroot", "--overlay", "/scratch/overlay.img"]
        );
        assert_eq!(privilege_flags(true, None), vec!["--cleanenv"]);
        assert_eq!(privilege_flags(false, None), vec!["--fakeroot"]);
        assert_eq!(
            privilege_flags(false, Some(overlay)),
            vec!["--fakeroot", "--overlay", "/scratch/overlay.img"]
        );
    }

    #[test]
    fn test_is_hpc_scratch() {
        assert!(is_hpc(Path::new("/scratch/user/work")));
    }

    #[test]
    fn test_instance_start_args() {
        let backend = ApptainerBackend::new(ApptainerOptions::default());
        let args = backend.instance_start_args(&spec(), false);
        assert_eq!(
            args,
            vec![
                "instance",
                "start",
                "--bind",
                "/home/u/runs/tgv_sub-1:/workdir",
                "--fakeroot",
                "docker://vnmd/qsmxt:1",
                "tgv_sub-1",
            ]
        );
    }

    #[test]
    fn test_exec_args() {
        let backend = ApptainerBackend::new(ApptainerOptions::default());
        let args = backend.exec_args(&spec());
        assert_eq!(
            args,
            vec![
                "exec",
                "--pwd",
                "/workdir",
                "--env",
                "INPUT_DOCUMENT_PATH=/workdir/inputs.json",
                "--env",
                "SUBJECT=1",
                "instance://tgv_sub-1",
                "./main.sh",
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_overlay_keeps_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("overlay.img");
        std::fs::write(&path, b"existing").unwrap();

        assert!(!ensure_overlay(&path, 16).await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"existing");
    }
}
