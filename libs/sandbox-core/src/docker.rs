/// Docker-backed container runtime using Bollard
///
/// **Responsibility:**
/// Translate the orchestrator's runtime operations into Docker Engine API
/// calls over the local control socket.
///
/// **Notes:**
/// - One `Docker` client per process; it is cheap to clone and safe to share
///   between concurrent executions
/// - Exec output is re-framed into the multiplexed wire format so the
///   orchestrator decodes every runtime's output the same way
/// - Stop/remove swallow "not modified", "not found" and "removal in progress"

use crate::demux::{encode_frame, StreamKind};
use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, ExecSpec};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using DOCKER_HOST or the platform's default socket
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Status codes meaning the container is already in the requested state
fn is_benign(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if matches!(*status_code, 304 | 404 | 409)
    )
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Pin untagged references to `latest`; the pull endpoint fetches every tag otherwise
fn qualified_image(image: &str) -> Cow<'_, str> {
    let name = image.rsplit('/').next().unwrap_or(image);
    if image.contains('@') || name.contains(':') {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(format!("{}:latest", image))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let reference = qualified_image(image);
        if self.docker.inspect_image(&reference).await.is_ok() {
            debug!(image = %reference, "Image cache hit");
            return Ok(());
        }

        warn!(image = %reference, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: &*reference,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::NotFound(image.to_string())
                } else {
                    RuntimeError::Docker(e)
                }
            })?;
        }

        info!(image = %reference, "Image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let exposed_ports = spec.published_port.map(|port| {
            let mut ports = HashMap::new();
            ports.insert(format!("{}/tcp", port), HashMap::new());
            ports
        });

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: Some(env),
            working_dir: Some(spec.working_dir.clone()),
            tty: Some(false),
            network_disabled: Some(spec.network_disabled),
            exposed_ports,
            host_config: Some(bollard::models::HostConfig {
                memory: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                auto_remove: Some(spec.auto_remove),
                publish_all_ports: Some(spec.published_port.is_some()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::NotFound(spec.image.clone())
                } else {
                    RuntimeError::Docker(e)
                }
            })?;
        for warning in &response.warnings {
            warn!(container = %spec.name, warning = %warning, "Docker warning on create");
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), archive)
            .await?;
        Ok(())
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecOutput, RuntimeError> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), spec.script.clone()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            working_dir: Some(spec.working_dir.clone()),
            ..Default::default()
        };

        let exec = self.docker.create_exec(id, exec_config).await?;

        let start_config = StartExecOptions {
            detach: false,
            tty: false,
            ..Default::default()
        };

        let mut output = ExecOutput::default();
        let mut kept = 0usize;

        match self.docker.start_exec(&exec.id, Some(start_config)).await? {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(msg) = stream.next().await {
                    let (stream_kind, message) = match msg? {
                        LogOutput::StdOut { message } => (Some(StreamKind::Stdout), message),
                        LogOutput::StdErr { message } => (Some(StreamKind::Stderr), message),
                        LogOutput::Console { message } => (None, message),
                        LogOutput::StdIn { .. } => continue,
                    };

                    let room = spec.max_output_bytes.saturating_sub(kept);
                    if message.len() > room {
                        output.truncated = true;
                    }
                    let take = message.len().min(room);
                    if take == 0 {
                        continue;
                    }
                    kept += take;

                    match stream_kind {
                        Some(kind) => encode_frame(&mut output.raw, kind, &message[..take]),
                        None => output.raw.extend_from_slice(&message[..take]),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Other(
                    "exec started detached, no output attached".to_string(),
                ));
            }
        }

        output.exit_code = self.docker.inspect_exec(&exec.id).await?.exit_code;
        Ok(output)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign(&e) => {
                debug!(container_id = %id, error = %e, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign(&e) => {
                debug!(container_id = %id, error = %e, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn host_port(&self, id: &str, port: u16) -> Result<u16, RuntimeError> {
        let inspected = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let key = format!("{}/tcp", port);
        let bound = inspected
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&key).flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .ok_or_else(|| RuntimeError::Other(format!("port {} is not published", key)))?;

        bound
            .parse()
            .map_err(|_| RuntimeError::Other(format!("invalid host port '{}'", bound)))
    }
}
