use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::language::Language;

/// How the caller wants the execution reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Raw concatenated output, no comparison
    Run,
    /// Per-test comparison against the expected output
    Test,
}

/// A file materialized into the workspace before the container starts.
/// `path` is relative to the workspace root and may be nested (`src/a.js`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    /// Shell command; its stdin is redirected from the test's input fixture
    pub exec: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub expected_output: String,
}

impl TestCase {
    pub fn new(
        exec: impl Into<String>,
        input: impl Into<String>,
        expected_output: impl Into<String>,
    ) -> Self {
        Self {
            exec: exec.into(),
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// Input of one sandboxed execution.
///
/// The JSON shape matches the `{image, files, beforeAll, tests}` objects the
/// exam application builds for code questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub image: String,
    #[serde(default)]
    pub files: Vec<SourceFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_all: Option<String>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    /// Defaults to TEST when tests are declared, RUN otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    /// Used in RUN mode without tests to derive the default command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    /// Explicit command for RUN mode without tests; wins over `language`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_command: Option<String>,
}

impl ExecutionRequest {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            image: image.into(),
            files: Vec::new(),
            before_all: None,
            tests: Vec::new(),
            mode: None,
            language: None,
            run_command: None,
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(SourceFile::new(path, content));
        self
    }

    pub fn with_test(mut self, test: TestCase) -> Self {
        self.tests.push(test);
        self
    }

    pub fn with_before_all(mut self, command: impl Into<String>) -> Self {
        self.before_all = Some(command.into());
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    pub fn with_run_command(mut self, command: impl Into<String>) -> Self {
        self.run_command = Some(command.into());
        self
    }

    pub fn effective_mode(&self) -> Mode {
        match self.mode {
            Some(mode) => mode,
            None if self.tests.is_empty() => Mode::Run,
            None => Mode::Test,
        }
    }
}

/// Recorded result of one test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub exec: String,
    pub input: String,
    pub output: String,
    pub expected_output: String,
    pub passed: bool,
    /// Informational only, never part of `passed`
    pub exit_code: Option<i64>,
    pub execution_time_ms: u64,
    /// Output hit the per-exec size cap
    #[serde(default)]
    pub truncated: bool,
}

impl TestOutcome {
    /// `passed` is exact string equality. No trimming, no newline folding.
    pub fn record(test: &TestCase, output: String) -> Self {
        let passed = output == test.expected_output;
        Self {
            exec: test.exec.clone(),
            input: test.input.clone(),
            output,
            expected_output: test.expected_output.clone(),
            passed,
            exit_code: None,
            execution_time_ms: 0,
            truncated: false,
        }
    }
}

/// Aggregate `{success, expected, result}` view of a test batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub success: bool,
    pub expected: String,
    pub result: String,
}

pub const TIMEOUT_RESULT: &str = "Timeout";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    /// In declared test order. When `timed_out` is set this holds only the
    /// tests that finished before the deadline.
    pub outcomes: Vec<TestOutcome>,
    pub timed_out: bool,
}

impl TestReport {
    pub fn success(&self) -> bool {
        !self.timed_out && self.outcomes.iter().all(|o| o.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }

    pub fn summary(&self) -> TestSummary {
        let expected = self
            .outcomes
            .iter()
            .map(|o| o.expected_output.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let result = if self.timed_out {
            TIMEOUT_RESULT.to_string()
        } else {
            self.outcomes
                .iter()
                .map(|o| o.output.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        };

        TestSummary {
            success: self.success(),
            expected,
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "UPPERCASE")]
pub enum ExecutionResult {
    Run { output: String },
    Test(TestReport),
}

/// What the boundary tells apart when presenting a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Tests ran and at least one did not produce the expected output
    Functional,
    /// The deadline expired before the batch completed
    Timeout,
    /// Infrastructure could not run the tests at all
    Operational,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_all_output: Option<String>,
    pub result: ExecutionResult,
}

impl ExecutionReport {
    /// `None` for RUN results and fully passing batches
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.result {
            ExecutionResult::Run { .. } => None,
            ExecutionResult::Test(report) if report.timed_out => Some(FailureKind::Timeout),
            ExecutionResult::Test(report) if !report.success() => Some(FailureKind::Functional),
            ExecutionResult::Test(_) => None,
        }
    }
}
