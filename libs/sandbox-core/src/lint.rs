// SQL linting on top of the sandbox.
//
// Runs `sqlfluff lint` inside the lint image with the caller's rules file and
// the query on stdin, then groups the JSON violations by rule code.

use crate::error::SandboxError;
use crate::orchestrator::Sandbox;
use sandbox_common::types::{ExecutionRequest, ExecutionResult, Mode, TestCase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

pub const RULES_FILE: &str = ".sqlfluff";
pub const LINT_COMMAND: &str = "sqlfluff lint - --dialect postgres --format json";

#[derive(Error, Debug)]
pub enum LintError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("Linting timed out")]
    TimedOut,
    #[error("Linter produced no output")]
    NoOutput,
    #[error("Failed to parse linter output: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinePosition {
    pub line: u32,
    pub pos: u32,
}

/// All occurrences of one rule violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedViolation {
    pub code: String,
    pub name: String,
    pub description: String,
    pub lines: Vec<LinePosition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
    /// In order of first occurrence
    pub violations: Vec<GroupedViolation>,
}

/// One entry of sqlfluff's JSON output
#[derive(Debug, Deserialize)]
struct FileResult {
    #[serde(default)]
    filepath: Option<String>,
    #[serde(default)]
    violations: Vec<Violation>,
}

#[derive(Debug, Deserialize)]
struct Violation {
    // sqlfluff 3 renamed these to start_line_no / start_line_pos
    #[serde(alias = "start_line_no")]
    line_no: u32,
    #[serde(alias = "start_line_pos")]
    line_pos: u32,
    code: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    name: String,
}

/// Lint `sql` against the sqlfluff configuration in `rules`
pub async fn lint_sql(sandbox: &Sandbox, sql: &str, rules: &str) -> Result<LintReport, LintError> {
    let request = ExecutionRequest::new(sandbox.config().lint_image.clone())
        .with_file(RULES_FILE, rules)
        .with_test(TestCase::new(LINT_COMMAND, sql, ""))
        .with_mode(Mode::Test);

    let report = sandbox.execute(&request).await?;

    let ExecutionResult::Test(report) = report.result else {
        return Err(LintError::NoOutput);
    };
    if report.timed_out {
        return Err(LintError::TimedOut);
    }

    let output = report
        .outcomes
        .first()
        .map(|o| o.output.as_str())
        .ok_or(LintError::NoOutput)?;

    parse_lint_output(output)
}

/// Parse sqlfluff's JSON report and group violations by rule code.
///
/// Anything printed before the JSON array (stderr warnings share the stream)
/// is skipped.
pub fn parse_lint_output(output: &str) -> Result<LintReport, LintError> {
    let json = match output.find('[') {
        Some(start) => &output[start..],
        None if output.trim().is_empty() => return Err(LintError::NoOutput),
        None => output,
    };

    let results: Vec<FileResult> = serde_json::from_str(json.trim_end())?;

    let Some(first) = results.into_iter().next() else {
        return Ok(LintReport::default());
    };

    debug!(violations = first.violations.len(), "Lint output parsed");

    Ok(LintReport {
        filepath: first.filepath,
        violations: group_by_code(first.violations),
    })
}

fn group_by_code(violations: Vec<Violation>) -> Vec<GroupedViolation> {
    let mut grouped: Vec<GroupedViolation> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for v in violations {
        let position = LinePosition {
            line: v.line_no,
            pos: v.line_pos,
        };

        match index.get(&v.code) {
            Some(&i) => grouped[i].lines.push(position),
            None => {
                index.insert(v.code.clone(), grouped.len());
                grouped.push(GroupedViolation {
                    code: v.code,
                    name: v.name,
                    description: v.description,
                    lines: vec![position],
                });
            }
        }
    }

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_violations_by_code_in_first_seen_order() {
        let output = r#"[{"filepath": "stdin", "violations": [
            {"line_no": 1, "line_pos": 1, "code": "CP01", "description": "Keywords must be consistently upper case.", "name": "capitalisation.keywords"},
            {"line_no": 1, "line_pos": 9, "code": "LT01", "description": "Expected single whitespace.", "name": "layout.spacing"},
            {"line_no": 2, "line_pos": 1, "code": "CP01", "description": "Keywords must be consistently upper case.", "name": "capitalisation.keywords"}
        ]}]"#;

        let report = parse_lint_output(output).unwrap();

        assert_eq!(report.filepath.as_deref(), Some("stdin"));
        assert_eq!(report.violations.len(), 2);
        assert_eq!(report.violations[0].code, "CP01");
        assert_eq!(
            report.violations[0].lines,
            vec![LinePosition { line: 1, pos: 1 }, LinePosition { line: 2, pos: 1 }]
        );
        assert_eq!(report.violations[1].code, "LT01");
        assert_eq!(report.violations[1].name, "layout.spacing");
    }

    #[test]
    fn test_accepts_start_line_fields() {
        let output = r#"[{"filepath": "stdin", "violations": [
            {"start_line_no": 3, "start_line_pos": 7, "code": "AL01", "description": "Implicit aliasing."}
        ]}]"#;

        let report = parse_lint_output(output).unwrap();

        assert_eq!(report.violations[0].lines, vec![LinePosition { line: 3, pos: 7 }]);
        assert_eq!(report.violations[0].name, "");
    }

    #[test]
    fn test_empty_result_array() {
        let report = parse_lint_output("[]\n").unwrap();
        assert!(report.violations.is_empty());
        assert_eq!(report.filepath, None);
    }

    #[test]
    fn test_skips_leading_noise() {
        let output = "WARNING: dialect is deprecated\n[{\"filepath\": \"stdin\", \"violations\": []}]\n";
        let report = parse_lint_output(output).unwrap();
        assert!(report.violations.is_empty());
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(matches!(parse_lint_output("Traceback"), Err(LintError::Parse(_))));
        assert!(matches!(parse_lint_output(""), Err(LintError::NoOutput)));
    }
}
