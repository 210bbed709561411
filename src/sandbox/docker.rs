//! Container runtime backend backed by the Docker daemon.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::docker_client::{ContainerConfig, DockerClient};
use super::{BackendKind, LaunchSpec, SandboxBackend, SandboxHandle};
use crate::error::SandboxError;

/// Docker-specific launch options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerOptions {
    /// `UID:GID` to run the container as.
    pub user: Option<String>,
    /// Network mode; the daemon default when unset.
    pub network_mode: Option<String>,
}

impl DockerOptions {
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Runs units as Docker containers.
pub struct DockerBackend {
    client: DockerClient,
    options: DockerOptions,
}

impl DockerBackend {
    /// Connects to the local daemon.
    pub fn connect(options: DockerOptions) -> Result<Self, SandboxError> {
        Ok(Self {
            client: DockerClient::new()?,
            options,
        })
    }

    pub fn from_client(client: DockerClient, options: DockerOptions) -> Self {
        Self { client, options }
    }

    /// Container configuration for `spec`: the host working directory is
    /// bind-mounted at the container working directory.
    pub fn container_config(&self, spec: &LaunchSpec) -> ContainerConfig {
        let mut config = ContainerConfig::new(&spec.unit_name, &spec.image)
            .with_cmd(vec![spec.command.clone()])
            .with_env(spec.env_pairs())
            .with_working_dir(&spec.container_workdir)
            .with_volumes(vec![format!(
                "{}:{}",
                spec.host_workdir.display(),
                spec.container_workdir
            )]);

        if let Some(user) = &self.options.user {
            config = config.with_user(user);
        }
        if let Some(mode) = &self.options.network_mode {
            config = config.with_network_mode(mode);
        }
        config
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn prepare(&self, spec: &LaunchSpec) -> Result<(), SandboxError> {
        self.teardown(&spec.unit_name).await?;

        if self.client.image_exists(&spec.image).await {
            debug!(image = %spec.image, "Docker image found locally");
        } else {
            info!(image = %spec.image, "Pulling Docker image");
            self.client.pull_image(&spec.image).await?;
        }
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<SandboxHandle, SandboxError> {
        let id = self
            .client
            .create_container(self.container_config(spec))
            .await?;
        self.client.start_container(&id).await?;

        info!(unit = %spec.unit_name, container = %id, "Container started");
        Ok(SandboxHandle::new(&spec.unit_name, id))
    }

    fn stream_logs(
        &self,
        handle: &mut SandboxHandle,
    ) -> BoxStream<'static, Result<String, SandboxError>> {
        self.client.follow_logs(&handle.id)
    }

    async fn wait(&self, handle: &mut SandboxHandle) -> Result<i64, SandboxError> {
        self.client.wait_container(&handle.id).await
    }

    async fn teardown(&self, unit_name: &str) -> Result<(), SandboxError> {
        if !self.client.container_exists(unit_name).await? {
            return Ok(());
        }

        debug!(unit = unit_name, "Removing existing container");
        if let Err(e) = self.client.stop_container(unit_name).await {
            // Already stopped containers refuse the stop; force removal below covers them.
            warn!(unit = unit_name, error = %e, "Stop failed");
        }
        self.client.remove_container(unit_name, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn backend(options: DockerOptions) -> DockerBackend {
        // The client is lazy: no daemon connection is made until a call.
        let docker = bollard::Docker::connect_with_local_defaults().unwrap();
        DockerBackend::from_client(DockerClient::from_docker(docker), options)
    }

    #[tokio::test]
    async fn test_container_config_from_spec() {
        let mut env = BTreeMap::new();
        env.insert("SUBJECT".to_string(), "1".to_string());
        let spec = LaunchSpec::new("tgv_sub-1", "vnmd/qsmxt:1", "/work/runs/tgv_sub-1").with_env(env);

        let config = backend(DockerOptions::default().with_user("1000:1000")).container_config(&spec);

        assert_eq!(config.name, "tgv_sub-1");
        assert_eq!(config.cmd.as_deref(), Some(&["./main.sh".to_string()][..]));
        assert_eq!(config.working_dir.as_deref(), Some("/workdir"));
        assert_eq!(config.volumes, vec!["/work/runs/tgv_sub-1:/workdir"]);
        assert_eq!(config.env, vec!["SUBJECT=1"]);
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
    }

    #[tokio::test]
    async fn test_kind() {
        assert_eq!(backend(DockerOptions::default()).kind(), BackendKind::Docker);
    }
}
