// Sandbox configuration
// Loaded from config/sandbox.json (optional), then overridden by environment variables

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/sandbox.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    /// Host directory under which per-execution workspaces are created
    pub runs_root: PathBuf,
    /// Single deadline spanning the whole test batch
    pub execution_timeout_ms: u64,
    /// Deadline for the `beforeAll` setup command
    pub setup_timeout_ms: u64,
    /// In-container path the workspace is copied to; also the working directory
    pub workspace_dir: String,
    /// Per-exec cap on captured payload bytes
    pub max_output_bytes: usize,
    pub max_file_bytes: usize,
    pub max_input_bytes: usize,
    pub memory_limit_mb: u32,
    pub cpu_limit: f64,
    pub network_disabled: bool,
    pub stop_grace_secs: u64,
    pub env: BTreeMap<String, String>,
    /// Image carrying sqlfluff, used by SQL linting
    pub lint_image: String,
    pub query: QueryConfig,
}

/// Throwaway PostgreSQL instance used to run query sequences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryConfig {
    pub image: String,
    /// Host the published database port is reachable on
    pub host: String,
    pub database: String,
    pub user: String,
    pub password: String,
    /// How long the database may take to accept connections
    pub ready_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            image: "postgres:latest".to_string(),
            host: "localhost".to_string(),
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            ready_timeout_ms: 30_000,
        }
    }
}

impl QueryConfig {
    pub const PORT: u16 = 5432;

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Variables the postgres image reads to initialize its cluster
    pub fn container_env(&self) -> BTreeMap<String, String> {
        [
            ("POSTGRES_DB", &self.database),
            ("POSTGRES_USER", &self.user),
            ("POSTGRES_PASSWORD", &self.password),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("NODE_NO_WARNINGS".to_string(), "1".to_string());

        Self {
            runs_root: PathBuf::from("sandbox/runs/tc"),
            execution_timeout_ms: 30_000,
            setup_timeout_ms: 60_000,
            workspace_dir: "/workspace".to_string(),
            max_output_bytes: 256 * 1024,
            max_file_bytes: 1024 * 1024,
            max_input_bytes: 10 * 1024 * 1024,
            memory_limit_mb: 256,
            cpu_limit: 0.3,
            network_disabled: false,
            stop_grace_secs: 0,
            env,
            lint_image: "custom-sqlfluff".to_string(),
            query: QueryConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Load from a JSON file. Fields missing from the file keep their defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Sandbox config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: SandboxConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load config/sandbox.json when present, defaults otherwise, then apply env overrides
    pub fn load_default() -> Result<Self> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        let config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SANDBOX_*` overrides. `lookup` is injected so tests don't touch the process env.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("SANDBOX_RUNS_ROOT") {
            self.runs_root = PathBuf::from(root);
        }
        if let Some(ms) = lookup("SANDBOX_TIMEOUT_MS") {
            self.execution_timeout_ms = ms
                .parse()
                .with_context(|| format!("Invalid SANDBOX_TIMEOUT_MS: {}", ms))?;
        }
        if let Some(ms) = lookup("SANDBOX_SETUP_TIMEOUT_MS") {
            self.setup_timeout_ms = ms
                .parse()
                .with_context(|| format!("Invalid SANDBOX_SETUP_TIMEOUT_MS: {}", ms))?;
        }
        if let Some(image) = lookup("SANDBOX_LINT_IMAGE") {
            self.lint_image = image;
        }
        if let Some(image) = lookup("SANDBOX_DB_IMAGE") {
            self.query.image = image;
        }
        if let Some(host) = lookup("SANDBOX_DB_HOST") {
            self.query.host = host;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.execution_timeout_ms == 0 {
            bail!("executionTimeoutMs must be greater than zero");
        }
        if self.setup_timeout_ms == 0 {
            bail!("setupTimeoutMs must be greater than zero");
        }
        if !self.workspace_dir.starts_with('/') {
            bail!("workspaceDir must be an absolute path: {}", self.workspace_dir);
        }
        if self.max_output_bytes == 0 {
            bail!("maxOutputBytes must be greater than zero");
        }
        if self.query.ready_timeout_ms == 0 {
            bail!("query.readyTimeoutMs must be greater than zero");
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0).round() as i64
    }

    /// In-container path of the input fixture for test `index`
    pub fn fixture_path(&self, index: usize) -> String {
        format!("{}/{}", self.workspace_dir.trim_end_matches('/'), fixture_relative_path(index))
    }
}

/// Workspace-relative path of the input fixture for test `index`
pub fn fixture_relative_path(index: usize) -> String {
    format!("tests/test{}.txt", index)
}
