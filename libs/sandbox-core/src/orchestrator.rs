/// Execution Orchestrator - High-Level Coordination
///
/// **Responsibility:**
/// Drive one request through validate → provision workspace → ensure image →
/// start container → run tests under the deadline → stop container →
/// assemble result → reclaim workspace.
///
/// **Guarantees:**
/// - The workspace is reclaimed on every exit path, success or failure
/// - The container is stopped and removed on every exit path once created
/// - Concurrent `execute` calls share nothing but the runtime client
///
/// This module is the glue layer. It knows nothing about:
/// - How commands execute (runtime's job)
/// - How results are judged (assembler's job)

use crate::assemble;
use crate::docker::DockerRuntime;
use crate::error::{Result, RuntimeError, SandboxError};
use crate::governor::{self, Governed};
use crate::lifecycle::{self, Reaper, StartedContainer};
use crate::runner::{self, Step};
use crate::runtime::ContainerRuntime;
use crate::validate::validate_request;
use crate::workspace::Workspace;
use sandbox_common::config::SandboxConfig;
use sandbox_common::types::{
    ExecutionReport, ExecutionRequest, ExecutionResult, Mode, TestReport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

#[derive(Clone)]
pub struct Sandbox {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<SandboxConfig>,
    reaper: Reaper,
}

impl Sandbox {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config: Arc::new(config),
            reaper: Reaper::default(),
        }
    }

    /// Sandbox backed by the local Docker daemon
    pub fn connect_docker(config: SandboxConfig) -> Result<Self, RuntimeError> {
        let runtime = DockerRuntime::connect()?;
        Ok(Self::new(Arc::new(runtime), config))
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub(crate) fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Wait for container removals left behind by cancelled executions
    pub async fn reap(&self) {
        self.reaper.drain().await;
    }

    /// Run `request` to completion.
    ///
    /// Functional failures (wrong output, non-zero exits, failing `beforeAll`)
    /// are reported inside `Ok`. `Err` means the tests could not be run, or a
    /// RUN mode execution hit its deadline.
    #[instrument(
        skip(self, request),
        fields(
            request_id = %request.id,
            image = %request.image,
            tests = request.tests.len(),
            files = request.files.len()
        )
    )]
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport> {
        validate_request(request, &self.config)?;
        let steps = runner::plan(request, &self.config)?;
        let mode = request.effective_mode();

        info!(mode = ?mode, steps = steps.len(), "Starting execution");

        let mut workspace =
            Workspace::provision(&self.config.runs_root, &request.files, &request.tests).await?;

        let result = self.execute_in(request, mode, &steps, &workspace).await;

        workspace.reclaim().await;

        match &result {
            Ok(report) => info!(
                failure_kind = ?report.failure_kind(),
                "Execution finished"
            ),
            Err(e) => error!(error = %e, kind = ?e.kind(), "Execution failed"),
        }

        result
    }

    async fn execute_in(
        &self,
        request: &ExecutionRequest,
        mode: Mode,
        steps: &[Step],
        workspace: &Workspace,
    ) -> Result<ExecutionReport> {
        self.runtime
            .ensure_image(&request.image)
            .await
            .map_err(|source| SandboxError::Image {
                image: request.image.clone(),
                source,
            })?;

        let started = lifecycle::start(
            Arc::clone(&self.runtime),
            &self.reaper,
            &self.config,
            request.id,
            &request.image,
            workspace,
            request.before_all.as_deref(),
        )
        .await;

        let StartedContainer {
            handle,
            before_all_output,
        } = match started {
            Ok(started) => started,
            Err(SandboxError::Timeout { after }) if mode == Mode::Test => {
                warn!(
                    after_ms = after.as_millis() as u64,
                    "Setup hit its deadline, no tests ran"
                );
                return Ok(ExecutionReport {
                    id: request.id,
                    before_all_output: None,
                    result: ExecutionResult::Test(TestReport {
                        outcomes: Vec::new(),
                        timed_out: true,
                    }),
                });
            }
            Err(e) => return Err(e),
        };

        let mut outcomes = Vec::with_capacity(steps.len());
        let governed = governor::govern(
            self.config.execution_timeout(),
            &handle,
            runner::run(&handle, steps, &mut outcomes),
        )
        .await;

        let grace = Duration::from_secs(self.config.stop_grace_secs);
        let timed_out = match governed {
            Governed::Completed(Ok(())) => None,
            Governed::Completed(Err(e)) => {
                handle.stop(grace).await;
                return Err(e);
            }
            Governed::Expired { after } => Some(after),
        };

        handle.stop(grace).await;

        let result = assemble::assemble(mode, outcomes, timed_out)?;

        Ok(ExecutionReport {
            id: request.id,
            before_all_output,
            result,
        })
    }
}
