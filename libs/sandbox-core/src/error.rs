//! Error taxonomy of the orchestrator.
//!
//! Everything here is an operational failure: the infrastructure could not
//! run the tests. A test whose output does not match is data, not an error.

use sandbox_common::types::FailureKind;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`ContainerRuntime`](crate::runtime::ContainerRuntime) call
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("No such container or image: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

/// Lifecycle stage a container error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStage {
    Create,
    Start,
    Inject,
    Setup,
    Publish,
}

impl std::fmt::Display for ContainerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            ContainerStage::Create => "create",
            ContainerStage::Start => "start",
            ContainerStage::Inject => "inject workspace into",
            ContainerStage::Setup => "run setup command in",
            ContainerStage::Publish => "read the published port of",
        };
        write!(f, "{}", stage)
    }
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),

    #[error("Failed to provision workspace at {}: {source}", path.display())]
    Provision {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to make image '{image}' available: {source}")]
    Image {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to {stage} container: {source}")]
    Container {
        stage: ContainerStage,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to execute command in container: {source}")]
    Exec {
        #[source]
        source: RuntimeError,
    },

    #[error("Execution timed out")]
    Timeout { after: Duration },
}

impl SandboxError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SandboxError::Timeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Operational,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout { .. })
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
