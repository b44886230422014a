/// Test Execution Runner
///
/// **Responsibility:**
/// Turn a request into an ordered list of exec steps and run them one at a
/// time against the live container, recording one outcome per step.
///
/// **Rules:**
/// - Steps run strictly in declared order; the next exec starts only after the
///   previous output has been demultiplexed
/// - Each test's stdin is redirected from its fixture file
/// - Non-zero exit is data (kept in `exit_code`), never an error
/// - A failing runtime call aborts the batch; no retries

use crate::demux::demultiplex_to_string;
use crate::error::{Result, SandboxError};
use crate::lifecycle::ContainerHandle;
use sandbox_common::config::SandboxConfig;
use sandbox_common::language::Language;
use sandbox_common::types::{ExecutionRequest, Mode, TestCase, TestOutcome};
use std::time::Instant;
use tracing::debug;

/// One exec against the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub test: TestCase,
    /// In-container path redirected to the command's stdin
    pub stdin: String,
}

impl Step {
    /// The whole command (pipelines and `&&` chains included) reads from the fixture
    pub fn script(&self) -> String {
        format!("{{ {}\n}} < {}", self.test.exec, self.stdin)
    }
}

/// Build the exec steps for `request`.
///
/// Declared tests become one step each. RUN mode without tests runs a single
/// default command: `runCommand` if given, otherwise the language's command
/// for the entry file.
pub fn plan(request: &ExecutionRequest, config: &SandboxConfig) -> Result<Vec<Step>> {
    if !request.tests.is_empty() {
        return Ok(request
            .tests
            .iter()
            .enumerate()
            .map(|(index, test)| Step {
                test: test.clone(),
                stdin: config.fixture_path(index),
            })
            .collect());
    }

    if request.effective_mode() == Mode::Test {
        return Ok(Vec::new());
    }

    let command = default_command(request).ok_or_else(|| {
        SandboxError::InvalidRequest(
            "RUN mode without tests needs runCommand or a language with a matching entry file"
                .to_string(),
        )
    })?;

    Ok(vec![Step {
        test: TestCase::new(command, "", ""),
        stdin: "/dev/null".to_string(),
    }])
}

fn default_command(request: &ExecutionRequest) -> Option<String> {
    if let Some(command) = request.run_command.as_ref().filter(|c| !c.trim().is_empty()) {
        return Some(command.clone());
    }

    let language = request
        .language
        .or_else(|| request.files.first().and_then(|f| Language::from_path(&f.path)))?;

    let entry = request
        .files
        .iter()
        .find(|f| Language::from_path(&f.path) == Some(language))?;

    Some(language.exec_command(&entry.path))
}

/// Execute `steps` in order, appending to `outcomes` as each one finishes.
///
/// Outcomes are pushed incrementally so that a caller racing this future
/// against a deadline keeps whatever completed before the deadline.
pub async fn run(
    handle: &ContainerHandle,
    steps: &[Step],
    outcomes: &mut Vec<TestOutcome>,
) -> Result<()> {
    for (index, step) in steps.iter().enumerate() {
        let started = Instant::now();

        let output = handle
            .exec(&step.script())
            .await
            .map_err(|source| SandboxError::Exec { source })?;

        let mut outcome = TestOutcome::record(&step.test, demultiplex_to_string(&output.raw));
        outcome.exit_code = output.exit_code;
        outcome.execution_time_ms = started.elapsed().as_millis() as u64;
        outcome.truncated = output.truncated;

        debug!(
            container_id = %handle.id(),
            test_index = index,
            exit_code = ?outcome.exit_code,
            execution_time_ms = outcome.execution_time_ms,
            passed = outcome.passed,
            truncated = outcome.truncated,
            "Test executed"
        );

        outcomes.push(outcome);
    }

    Ok(())
}
