// Request validation, run before anything touches the host filesystem or Docker.

use crate::error::{Result, SandboxError};
use crate::workspace::checked_relative_path;
use sandbox_common::config::{fixture_relative_path, SandboxConfig};
use sandbox_common::types::ExecutionRequest;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const FIXTURE_DIR: &str = "tests";

pub fn validate_request(request: &ExecutionRequest, config: &SandboxConfig) -> Result<()> {
    if request.image.trim().is_empty() {
        return invalid("image must not be empty".to_string());
    }

    let fixtures: HashSet<PathBuf> = (0..request.tests.len())
        .map(|index| PathBuf::from(fixture_relative_path(index)))
        .collect();

    let mut seen = HashSet::new();
    for file in &request.files {
        let relative = checked_relative_path(&file.path)?;

        if !seen.insert(relative.clone()) {
            return invalid(format!("duplicate file path '{}'", file.path));
        }

        // A fixture can be neither replaced nor turned into a directory
        if !request.tests.is_empty()
            && (relative == Path::new(FIXTURE_DIR)
                || fixtures.iter().any(|fixture| relative.starts_with(fixture)))
        {
            return invalid(format!(
                "file path '{}' collides with a test input fixture",
                file.path
            ));
        }

        if file.content.len() > config.max_file_bytes {
            return invalid(format!(
                "file '{}' is {} bytes, limit is {}",
                file.path,
                file.content.len(),
                config.max_file_bytes
            ));
        }
    }

    for (index, test) in request.tests.iter().enumerate() {
        if test.exec.trim().is_empty() {
            return invalid(format!("test {} has an empty exec command", index));
        }
        if test.input.len() > config.max_input_bytes {
            return invalid(format!(
                "test {} input is {} bytes, limit is {}",
                index,
                test.input.len(),
                config.max_input_bytes
            ));
        }
    }

    Ok(())
}

fn invalid(reason: String) -> Result<()> {
    Err(SandboxError::InvalidRequest(reason))
}
