// Container runtime seam.
// The orchestrator only talks to a runtime through this trait, so tests can
// substitute an in-memory fake for the Docker daemon.

use crate::error::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;

/// Everything needed to create one sandbox container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Foreground command keeping the container alive between execs.
    /// Empty keeps the image's own command.
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub network_disabled: bool,
    /// Container TCP port published on an ephemeral host port
    pub published_port: Option<u16>,
    pub auto_remove: bool,
}

/// A non-interactive command run inside a live container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    /// Passed to `sh -c`
    pub script: String,
    pub working_dir: String,
    /// Payload bytes kept; the rest of the stream is drained and dropped
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Multiplexed stream exactly as framed by the runtime (see `demux`)
    pub raw: Vec<u8>,
    pub exit_code: Option<i64>,
    pub truncated: bool,
}

/// Operations the orchestrator consumes from a container runtime.
///
/// `stop_container` and `remove_container` must be idempotent: a container
/// that is already stopped, being removed, or gone is not an error.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make `image` available locally, pulling it on a cache miss
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Returns the container id. A missing image is `RuntimeError::NotFound`.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Extract a tar archive into the container filesystem at `path`
    async fn upload_archive(&self, id: &str, path: &str, archive: Bytes)
        -> Result<(), RuntimeError>;

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecOutput, RuntimeError>;

    /// `grace` of zero kills immediately
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Host port bound to the container's published `port`
    async fn host_port(&self, id: &str, port: u16) -> Result<u16, RuntimeError>;
}
