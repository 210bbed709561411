//! Docker API wrapper using the bollard crate.
//!
//! This module provides a high-level interface to the Docker operations a
//! unit needs: image availability, container lifecycle and followed logs.

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::SandboxError;

/// Configuration for creating a new container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique name for the container.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Command to run in the container.
    pub cmd: Option<Vec<String>>,
    /// Environment variables as `KEY=VALUE`.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Bind mounts (host:container format).
    pub volumes: Vec<String>,
    /// User to run as (e.g., "1000:1000").
    pub user: Option<String>,
    /// Network mode (e.g., "none", "bridge", "host").
    pub network_mode: Option<String>,
}

impl ContainerConfig {
    /// Creates a new container configuration with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: None,
            env: Vec::new(),
            working_dir: None,
            volumes: Vec::new(),
            user: None,
            network_mode: Some("bridge".to_string()),
        }
    }

    /// Sets the command to run in the container.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Sets environment variables.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets bind mounts.
    pub fn with_volumes(mut self, volumes: Vec<String>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Sets the user to run as.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the network mode.
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }
}

/// Status of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatusInfo {
    Created,
    Running,
    Paused,
    Restarting,
    Exited { exit_code: i64 },
    Removing,
    Dead,
    Unknown(String),
}

/// Docker client wrapper for container operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::RuntimeUnavailable` if the daemon is not accessible.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::RuntimeUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Creates a new container with the given configuration.
    ///
    /// # Returns
    ///
    /// The container ID on success.
    pub async fn create_container(&self, config: ContainerConfig) -> Result<String, SandboxError> {
        let host_config = HostConfig {
            network_mode: config.network_mode.clone(),
            binds: if config.volumes.is_empty() {
                None
            } else {
                Some(config.volumes.clone())
            },
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            env: if config.env.is_empty() {
                None
            } else {
                Some(config.env.clone())
            },
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::LaunchFailed(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    /// Starts a container by ID.
    pub async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::LaunchFailed(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    /// Stops a container by ID or name.
    ///
    /// Sends SIGTERM and waits up to 10 seconds before sending SIGKILL.
    pub async fn stop_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = StopContainerOptions { t: 10 };

        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| SandboxError::Teardown(format!("Failed to stop container: {e}")))?;

        Ok(())
    }

    /// Removes a container by ID or name.
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| SandboxError::Teardown(format!("Failed to remove container: {e}")))?;

        Ok(())
    }

    /// Returns true when a container with this ID or name exists.
    pub async fn container_exists(&self, id: &str) -> Result<bool, SandboxError> {
        match self.container_status(id).await {
            Ok(_) => Ok(true),
            Err(SandboxError::UnitNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Follows the combined stdout and stderr of a container, one line per item.
    ///
    /// Log frames are not line aligned, so partial lines are buffered until
    /// their newline arrives. A trailing line without newline is flushed when
    /// the container closes its output.
    pub fn follow_logs(&self, id: &str) -> BoxStream<'static, Result<String, SandboxError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };
        let mut logs = self.docker.logs(id, Some(options));

        Box::pin(async_stream::stream! {
            let mut pending = String::new();

            while let Some(chunk) = logs.next().await {
                let message = match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => message,
                    Ok(LogOutput::StdIn { .. }) => continue,
                    Err(e) => {
                        yield Err(SandboxError::Logs(format!("Error reading logs: {e}")));
                        break;
                    }
                };

                pending.push_str(&String::from_utf8_lossy(&message));
                while let Some(pos) = pending.find('\n') {
                    let line: String = pending.drain(..=pos).collect();
                    yield Ok(line.trim_end_matches(['\n', '\r']).to_string());
                }
            }

            if !pending.is_empty() {
                yield Ok(pending);
            }
        })
    }

    /// Gets the status of a container.
    pub async fn container_status(&self, id: &str) -> Result<ContainerStatusInfo, SandboxError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if e.to_string().contains("No such container") {
                    SandboxError::UnitNotFound(id.to_string())
                } else {
                    SandboxError::RuntimeUnavailable(format!("Failed to inspect container: {e}"))
                }
            })?;

        let state = info
            .state
            .ok_or_else(|| SandboxError::Wait("Container has no state".to_string()))?;

        let status = state.status.map(|s| s.to_string()).unwrap_or_default();

        match status.as_str() {
            "created" => Ok(ContainerStatusInfo::Created),
            "running" => Ok(ContainerStatusInfo::Running),
            "paused" => Ok(ContainerStatusInfo::Paused),
            "restarting" => Ok(ContainerStatusInfo::Restarting),
            "removing" => Ok(ContainerStatusInfo::Removing),
            "exited" => Ok(ContainerStatusInfo::Exited {
                exit_code: state.exit_code.unwrap_or(-1),
            }),
            "dead" => Ok(ContainerStatusInfo::Dead),
            other => Ok(ContainerStatusInfo::Unknown(other.to_string())),
        }
    }

    /// Pulls a Docker image from a registry.
    ///
    /// # Arguments
    ///
    /// * `image` - Image name with optional tag (e.g., "vnmd/qsmxt_6.4.1:20240307")
    pub async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::ImageUnavailable {
                image: image.to_string(),
                reason: format!("Failed to pull image: {e}"),
            })?;
        }

        Ok(())
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Waits for a container to finish executing.
    ///
    /// # Returns
    ///
    /// The exit code of the container.
    pub async fn wait_container(&self, id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        if let Some(result) = stream.next().await {
            match result {
                Ok(response) => return Ok(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code.
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    return Ok(code)
                }
                Err(e) => {
                    return Err(SandboxError::Wait(format!(
                        "Error waiting for container: {e}"
                    )))
                }
            }
        }

        // If stream is empty, check container state
        match self.container_status(id).await? {
            ContainerStatusInfo::Exited { exit_code } => Ok(exit_code),
            _ => Err(SandboxError::Wait(
                "Container did not exit normally".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_builder() {
        let config = ContainerConfig::new("tgv_sub-1", "vnmd/qsmxt:1")
            .with_cmd(vec!["./main.sh".to_string()])
            .with_env(vec!["SUBJECT=1".to_string()])
            .with_working_dir("/workdir")
            .with_volumes(vec!["/tmp/run:/workdir".to_string()])
            .with_user("1000:1000")
            .with_network_mode("none");

        assert_eq!(config.name, "tgv_sub-1");
        assert_eq!(config.image, "vnmd/qsmxt:1");
        assert_eq!(config.cmd.unwrap(), vec!["./main.sh"]);
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.working_dir.unwrap(), "/workdir");
        assert_eq!(config.volumes, vec!["/tmp/run:/workdir"]);
        assert_eq!(config.user.unwrap(), "1000:1000");
        assert_eq!(config.network_mode.unwrap(), "none");
    }

    #[test]
    fn test_container_config_defaults() {
        let config = ContainerConfig::new("u", "ubuntu:latest");
        assert!(config.cmd.is_none());
        assert!(config.user.is_none());
        assert_eq!(config.network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn test_container_status_info() {
        let exited = ContainerStatusInfo::Exited { exit_code: 3 };
        let unknown = ContainerStatusInfo::Unknown("custom".to_string());

        assert!(matches!(
            exited,
            ContainerStatusInfo::Exited { exit_code: 3 }
        ));
        assert!(matches!(unknown, ContainerStatusInfo::Unknown(_)));
    }
}
