/// Result Assembler
///
/// **Responsibility:**
/// Turn the recorded test outcomes into the mode-specific result.
///
/// **Properties:**
/// - Knows nothing about Docker or workspaces
/// - Pure function: (mode, outcomes, deadline state) → result
///
/// **Rules:**
/// - RUN: outputs concatenated in declared order; an expired deadline is an error
/// - TEST: one outcome per completed test; an expired deadline is reported as
///   `timedOut` with the outcomes recorded before it fired
/// - Pass/fail was already decided by exact string equality when the outcome
///   was recorded. Nothing is trimmed or normalized here.

use crate::error::{Result, SandboxError};
use sandbox_common::types::{ExecutionResult, Mode, TestOutcome, TestReport};
use std::time::Duration;
use tracing::{debug, info};

/// Assemble the final result for `mode`.
///
/// `timed_out` carries the deadline that expired, if any.
pub fn assemble(
    mode: Mode,
    outcomes: Vec<TestOutcome>,
    timed_out: Option<Duration>,
) -> Result<ExecutionResult> {
    match mode {
        Mode::Run => {
            if let Some(after) = timed_out {
                return Err(SandboxError::Timeout { after });
            }
            let output: String = outcomes.iter().map(|o| o.output.as_str()).collect();
            debug!(bytes = output.len(), "RUN output assembled");
            Ok(ExecutionResult::Run { output })
        }
        Mode::Test => {
            let report = TestReport {
                outcomes,
                timed_out: timed_out.is_some(),
            };

            for (index, outcome) in report.outcomes.iter().enumerate() {
                if !outcome.passed {
                    debug!(
                        test_index = index,
                        expected = %outcome.expected_output,
                        actual = %outcome.output,
                        "Output mismatch"
                    );
                }
            }

            info!(
                passed = report.passed_count(),
                completed = report.outcomes.len(),
                timed_out = report.timed_out,
                success = report.success(),
                "Evaluation complete"
            );

            Ok(ExecutionResult::Test(report))
        }
    }
}
