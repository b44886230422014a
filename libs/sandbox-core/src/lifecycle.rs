/// Container Lifecycle Manager
///
/// **Contract:**
/// - `start` creates a long-lived container (`sleep infinity`), copies the
///   workspace into it, and runs the optional `beforeAll` command once
/// - Any failure after creation stops and removes the container before the
///   error is returned
/// - `ContainerHandle::stop` is idempotent and never fails; errors are logged
/// - A handle dropped without `stop` schedules a forced removal (the caller
///   may cancel the execution future at any await point); the removal task
///   is registered with a [`Reaper`] so callers can wait for it

use crate::demux::demultiplex_to_string;
use crate::error::{ContainerStage, Result, RuntimeError, SandboxError};
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, ExecSpec};
use crate::workspace::Workspace;
use sandbox_common::config::SandboxConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const KEEP_ALIVE_CMD: [&str; 2] = ["sleep", "infinity"];

/// Removal tasks spawned by drop guards
#[derive(Clone, Default)]
pub struct Reaper {
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Reaper {
    fn track(&self, task: JoinHandle<()>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|t| !t.is_finished());
        pending.push(task);
    }

    /// Wait until every removal scheduled so far has finished
    pub async fn drain(&self) {
        loop {
            let tasks = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *pending)
            };
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Container removal task failed");
                }
            }
        }
    }
}

pub struct ContainerHandle {
    runtime: Arc<dyn ContainerRuntime>,
    reaper: Reaper,
    id: String,
    working_dir: String,
    max_output_bytes: usize,
    stopped: AtomicBool,
}

impl ContainerHandle {
    pub(crate) fn new(
        runtime: Arc<dyn ContainerRuntime>,
        reaper: Reaper,
        id: String,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            reaper,
            id,
            working_dir: config.workspace_dir.clone(),
            max_output_bytes: config.max_output_bytes,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run `script` through `sh -c` in the workspace directory, no TTY
    pub async fn exec(&self, script: &str) -> std::result::Result<ExecOutput, RuntimeError> {
        let spec = ExecSpec {
            script: script.to_string(),
            working_dir: self.working_dir.clone(),
            max_output_bytes: self.max_output_bytes,
        };
        self.runtime.exec(&self.id, &spec).await
    }

    /// Stop and remove the container. Safe to call any number of times.
    pub async fn stop(&self, grace: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.runtime.stop_container(&self.id, grace).await {
            warn!(container_id = %self.id, error = %e, "Failed to stop container");
        }

        match self.runtime.remove_container(&self.id).await {
            Ok(()) => debug!(container_id = %self.id, "Container removed"),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!(
                container_id = %self.id,
                error = %e,
                "Failed to remove container (may require manual cleanup)"
            ),
        }
    }

    /// Stop without grace period, used when the deadline fires
    pub async fn kill(&self) {
        self.stop(Duration::ZERO).await;
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.is_stopped() {
            return;
        }

        // Cannot await in Drop: hand the removal to the runtime if one is running
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.id, "Container leaked: no async runtime to remove it");
            return;
        };

        let runtime = Arc::clone(&self.runtime);
        let id = std::mem::take(&mut self.id);
        let task = rt.spawn(async move {
            if let Err(e) = runtime.remove_container(&id).await {
                warn!(container_id = %id, error = %e, "Failed to clean up abandoned container");
            }
        });
        self.reaper.track(task);
    }
}

/// A started container plus the captured output of its setup command
pub struct StartedContainer {
    pub handle: ContainerHandle,
    pub before_all_output: Option<String>,
}

/// Create and start a container for `workspace`, then run `before_all`.
///
/// A setup command that exits non-zero is not an error: its output is
/// returned and the tests run anyway. Only runtime failures abort.
pub async fn start(
    runtime: Arc<dyn ContainerRuntime>,
    reaper: &Reaper,
    config: &SandboxConfig,
    request_id: Uuid,
    image: &str,
    workspace: &Workspace,
    before_all: Option<&str>,
) -> Result<StartedContainer> {
    // The request id may be reused across executions, the workspace id never is
    let spec = ContainerSpec {
        name: format!("sandbox-{}-{}", request_id, workspace.id().simple()),
        image: image.to_string(),
        cmd: KEEP_ALIVE_CMD.iter().map(|s| s.to_string()).collect(),
        working_dir: config.workspace_dir.clone(),
        env: config.env.clone(),
        memory_bytes: config.memory_limit_bytes(),
        nano_cpus: config.nano_cpus(),
        network_disabled: config.network_disabled,
        published_port: None,
        auto_remove: true,
    };

    let id = runtime
        .create_container(&spec)
        .await
        .map_err(|source| SandboxError::Container {
            stage: ContainerStage::Create,
            source,
        })?;

    // From here on the handle owns the container
    let handle = ContainerHandle::new(Arc::clone(&runtime), reaper.clone(), id, config);
    let grace = Duration::from_secs(config.stop_grace_secs);

    match provision(&handle, config, workspace, before_all).await {
        Ok(before_all_output) => {
            info!(
                request_id = %request_id,
                container_id = %handle.id(),
                image = %image,
                "Container ready"
            );
            Ok(StartedContainer {
                handle,
                before_all_output,
            })
        }
        Err(e) if e.is_timeout() => {
            handle.kill().await;
            Err(e)
        }
        Err(e) => {
            handle.stop(grace).await;
            Err(e)
        }
    }
}

async fn provision(
    handle: &ContainerHandle,
    config: &SandboxConfig,
    workspace: &Workspace,
    before_all: Option<&str>,
) -> Result<Option<String>> {
    handle
        .runtime
        .start_container(handle.id())
        .await
        .map_err(|source| SandboxError::Container {
            stage: ContainerStage::Start,
            source,
        })?;

    let archive = workspace.archive(&config.workspace_dir).await?;
    handle
        .runtime
        .upload_archive(handle.id(), "/", archive)
        .await
        .map_err(|source| SandboxError::Container {
            stage: ContainerStage::Inject,
            source,
        })?;

    let Some(command) = before_all.filter(|c| !c.trim().is_empty()) else {
        return Ok(None);
    };

    debug!(container_id = %handle.id(), command = %command, "Running beforeAll");

    let script = format!("{} 2>&1", command);
    let setup_timeout = config.setup_timeout();
    let output = match tokio::time::timeout(setup_timeout, handle.exec(&script)).await {
        Ok(result) => result.map_err(|source| SandboxError::Container {
            stage: ContainerStage::Setup,
            source,
        })?,
        Err(_) => {
            warn!(
                container_id = %handle.id(),
                timeout_ms = setup_timeout.as_millis() as u64,
                "beforeAll timed out"
            );
            return Err(SandboxError::Timeout {
                after: setup_timeout,
            });
        }
    };

    if output.exit_code.is_some_and(|code| code != 0) {
        warn!(
            container_id = %handle.id(),
            exit_code = ?output.exit_code,
            "beforeAll exited non-zero; tests will still run"
        );
    }

    Ok(Some(demultiplex_to_string(&output.raw)))
}
