//! Sandbox backends for running one algorithm invocation in isolation.
//!
//! Every backend implements [`SandboxBackend`]; the orchestrator drives the
//! lifecycle (`prepare` -> `launch` -> `stream_logs` -> `wait` -> `teardown`)
//! without knowing which runtime sits behind it.

pub mod apptainer;
pub mod docker;
pub mod docker_client;
pub mod process;
pub mod tinyrange;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::algorithm::VmResources;
use crate::error::SandboxError;

pub use apptainer::{ApptainerBackend, ApptainerOptions};
pub use docker::{DockerBackend, DockerOptions};
pub use process::{merged_lines, ProcessRegistry};
pub use tinyrange::{TinyRangeBackend, TinyRangeOptions};

/// Working directory of the unit inside every sandbox.
pub const CONTAINER_WORKDIR: &str = "/workdir";

/// Which runtime executes the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Docker,
    Apptainer,
    TinyRange,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::Apptainer => write!(f, "apptainer"),
            BackendKind::TinyRange => write!(f, "tinyrange"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "apptainer" | "singularity" => Ok(BackendKind::Apptainer),
            "tinyrange" => Ok(BackendKind::TinyRange),
            other => Err(format!(
                "unknown container engine '{}' (expected docker, apptainer or tinyrange)",
                other
            )),
        }
    }
}

/// Everything a backend needs to start one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Deterministic unit name, also the container/instance/VM name.
    pub unit_name: String,
    pub image: String,
    /// Host directory mounted at `container_workdir`.
    pub host_workdir: PathBuf,
    pub container_workdir: String,
    /// Command run inside `container_workdir`, e.g. `./main.sh`.
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub resources: VmResources,
}

impl LaunchSpec {
    pub fn new(
        unit_name: impl Into<String>,
        image: impl Into<String>,
        host_workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            unit_name: unit_name.into(),
            image: image.into(),
            host_workdir: host_workdir.into(),
            container_workdir: CONTAINER_WORKDIR.to_string(),
            command: "./main.sh".to_string(),
            env: BTreeMap::new(),
            resources: VmResources::default(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_container_workdir(mut self, dir: impl Into<String>) -> Self {
        self.container_workdir = dir.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_resources(mut self, resources: VmResources) -> Self {
        self.resources = resources;
        self
    }

    /// Environment as `KEY=VALUE` strings in key order.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Handle to a launched unit.
///
/// Process-based backends park the child here; the Docker backend only needs
/// the container id.
#[derive(Debug)]
pub struct SandboxHandle {
    pub unit_name: String,
    pub id: String,
    pub child: Option<tokio::process::Child>,
}

impl SandboxHandle {
    pub fn new(unit_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            unit_name: unit_name.into(),
            id: id.into(),
            child: None,
        }
    }

    pub fn with_child(mut self, child: tokio::process::Child) -> Self {
        self.child = Some(child);
        self
    }
}

/// One isolation runtime.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Removes any stale unit with the same name and makes the image available.
    async fn prepare(&self, spec: &LaunchSpec) -> Result<(), SandboxError>;

    async fn launch(&self, spec: &LaunchSpec) -> Result<SandboxHandle, SandboxError>;

    /// Combined output of the unit, one line per item, as it is produced.
    ///
    /// The stream ends when the unit closes its output.
    fn stream_logs(&self, handle: &mut SandboxHandle)
        -> BoxStream<'static, Result<String, SandboxError>>;

    /// Waits for the unit to exit and returns its exit code.
    async fn wait(&self, handle: &mut SandboxHandle) -> Result<i64, SandboxError>;

    /// Stops and removes the unit. Removing a unit that does not exist is not an error.
    async fn teardown(&self, unit_name: &str) -> Result<(), SandboxError>;
}

/// Builds the deterministic unit name
/// `<algorithm>[_acq-<acq>]_sub-<subject>[_ses-<ses>][_run-<run>]`,
/// restricted to `[A-Za-z0-9_.-]`.
pub fn unit_name(
    algorithm: &str,
    subject: &str,
    session: Option<&str>,
    acquisition: Option<&str>,
    run: Option<&str>,
) -> String {
    let mut name = algorithm.to_string();
    if let Some(acq) = acquisition.filter(|s| !s.is_empty()) {
        name.push_str(&format!("_acq-{}", acq));
    }
    name.push_str(&format!("_sub-{}", subject));
    if let Some(ses) = session.filter(|s| !s.is_empty()) {
        name.push_str(&format!("_ses-{}", ses));
    }
    if let Some(run) = run.filter(|s| !s.is_empty()) {
        name.push_str(&format!("_run-{}", run));
    }
    sanitize(&name)
}

/// Replaces every character outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_name_order() {
        assert_eq!(
            unit_name("tgv", "1", Some("pre"), Some("A"), Some("2")),
            "tgv_acq-A_sub-1_ses-pre_run-2"
        );
        assert_eq!(unit_name("tgv", "1", None, None, None), "tgv_sub-1");
        assert_eq!(unit_name("tgv", "1", Some(""), None, None), "tgv_sub-1");
    }

    #[test]
    fn test_unit_name_sanitized() {
        assert_eq!(
            unit_name("my algo", "1/2", None, Some("a:b"), None),
            "my_algo_acq-a_b_sub-1_2"
        );
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert_eq!("Apptainer".parse::<BackendKind>().unwrap(), BackendKind::Apptainer);
        assert_eq!("singularity".parse::<BackendKind>().unwrap(), BackendKind::Apptainer);
        assert_eq!("tinyrange".parse::<BackendKind>().unwrap(), BackendKind::TinyRange);
        assert!("podman".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::TinyRange.to_string(), "tinyrange");
    }

    #[test]
    fn test_launch_spec_env_pairs() {
        let mut env = BTreeMap::new();
        env.insert("SUBJECT".to_string(), "1".to_string());
        env.insert("RUN".to_string(), String::new());
        let spec = LaunchSpec::new("u", "ubuntu:latest", "/tmp/u").with_env(env);

        assert_eq!(spec.container_workdir, "/workdir");
        assert_eq!(spec.command, "./main.sh");
        assert_eq!(spec.env_pairs(), vec!["RUN=", "SUBJECT=1"]);
    }
}
