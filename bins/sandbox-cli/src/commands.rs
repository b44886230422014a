// CLI commands driving the sandbox in-process
use anyhow::{bail, Context, Result};
use sandbox_common::config::{SandboxConfig, DEFAULT_CONFIG_PATH};
use sandbox_common::language::Language;
use sandbox_common::types::{ExecutionReport, ExecutionRequest, ExecutionResult, Mode, TestCase};
use sandbox_core::lint::lint_sql;
use sandbox_core::query::{run_queries, QueryStatus};
use sandbox_core::Sandbox;
use std::fs;
use std::future::Future;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};

/// Read `path`, or stdin when it is `-`
fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut content = String::new();
        io::stdin()
            .read_to_string(&mut content)
            .context("Failed to read stdin")?;
        return Ok(content);
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))
}

fn connect() -> Result<Sandbox> {
    let config = SandboxConfig::load_default()?;
    info!(
        runs_root = %config.runs_root.display(),
        timeout_ms = config.execution_timeout_ms,
        "Configuration loaded"
    );
    Sandbox::connect_docker(config).context("Failed to connect to Docker")
}

/// Await `work` unless Ctrl+C arrives first.
/// On interrupt `work` is dropped and its container removal awaited.
async fn interruptible<F, T>(sandbox: &Sandbox, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let finished = tokio::select! {
        result = work => Some(result),
        interrupted = signal::ctrl_c() => {
            interrupted.context("Failed to listen for Ctrl+C")?;
            None
        }
    };

    match finished {
        Some(result) => result,
        None => {
            warn!("Interrupted, cleaning up");
            sandbox.reap().await;
            bail!("Interrupted");
        }
    }
}

fn print_report(report: &ExecutionReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);

    match &report.result {
        ExecutionResult::Run { output } => {
            eprintln!("✅ Run completed ({} bytes of output)", output.len());
        }
        ExecutionResult::Test(tests) if tests.timed_out => {
            eprintln!(
                "⏱️  Timed out: {} / {} completed test(s) passed",
                tests.passed_count(),
                tests.outcomes.len()
            );
        }
        ExecutionResult::Test(tests) if tests.success() => {
            eprintln!("✅ All {} test(s) passed", tests.outcomes.len());
        }
        ExecutionResult::Test(tests) => {
            eprintln!(
                "❌ {} / {} test(s) passed",
                tests.passed_count(),
                tests.outcomes.len()
            );
        }
    }

    Ok(())
}

async fn execute(request: ExecutionRequest) -> Result<()> {
    let sandbox = connect()?;
    let report = interruptible(&sandbox, async {
        sandbox.execute(&request).await.map_err(anyhow::Error::from)
    })
    .await?;
    print_report(&report)
}

/// Execute a JSON request file
pub async fn run_request(path: &str) -> Result<()> {
    let content = read_input(path)?;
    let request: ExecutionRequest =
        serde_json::from_str(&content).with_context(|| format!("Invalid request in {}", path))?;

    eprintln!("🚀 Running request {} on {}", request.id, request.image);
    execute(request).await
}

/// Build a request from local source files
pub fn build_exec_request(
    files: &[(String, String)],
    language: Language,
    input: Option<String>,
    expected: Option<String>,
    image: Option<&str>,
) -> Result<ExecutionRequest> {
    let Some((entry, _)) = files.first() else {
        bail!("At least one source file is required");
    };

    let mut request = ExecutionRequest::new(image.unwrap_or(language.default_image()))
        .with_language(language);
    for (name, content) in files {
        request = request.with_file(name.as_str(), content.as_str());
    }

    if input.is_none() && expected.is_none() {
        return Ok(request.with_mode(Mode::Run));
    }

    // Compile once in beforeAll, then only run in the test itself
    let exec = match language.compile_command(entry) {
        Some(compile) => {
            request = request.with_before_all(compile);
            language.run_command(entry)
        }
        None => language.exec_command(entry),
    };

    let mode = if expected.is_some() { Mode::Test } else { Mode::Run };
    let test = TestCase::new(exec, input.unwrap_or_default(), expected.unwrap_or_default());

    Ok(request.with_test(test).with_mode(mode))
}

/// Run local source files
pub async fn exec_files(
    paths: &[PathBuf],
    lang: Option<&str>,
    input: Option<String>,
    expected: Option<String>,
    image: Option<&str>,
) -> Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("Not a file: {}", path.display()))?;
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        files.push((name, content));
    }

    let language = match lang {
        Some(name) => name.parse::<Language>()?,
        None => files
            .first()
            .and_then(|(name, _)| Language::from_path(name))
            .context("Cannot infer the language from the file extension, pass --lang")?,
    };

    let request = build_exec_request(&files, language, input, expected, image)?;

    eprintln!("🚀 Running {} ({}) on {}", files[0].0, language, request.image);
    execute(request).await
}

/// Lint a SQL query
pub async fn lint(file: &str, rules: Option<&Path>) -> Result<()> {
    let sql = read_input(file)?;
    let rules = match rules {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => String::new(),
    };

    let sandbox = connect()?;
    eprintln!("🔍 Linting with {}", sandbox.config().lint_image);

    let report = interruptible(&sandbox, async {
        lint_sql(&sandbox, &sql, &rules)
            .await
            .map_err(anyhow::Error::from)
    })
    .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.violations.is_empty() {
        eprintln!("✅ No violations");
    } else {
        eprintln!("⚠️  {} rule(s) violated", report.violations.len());
    }

    Ok(())
}

/// Run SQL files in order against a throwaway database
pub async fn query(files: &[PathBuf]) -> Result<()> {
    let mut queries = Vec::with_capacity(files.len());
    for path in files {
        let sql = read_input(&path.to_string_lossy())?;
        queries.push(sql);
    }

    let sandbox = connect()?;
    eprintln!("🐘 Running {} query(ies) on {}", queries.len(), sandbox.config().query.image);

    let outputs = interruptible(&sandbox, async {
        run_queries(&sandbox, &queries)
            .await
            .map_err(anyhow::Error::from)
    })
    .await?;

    println!("{}", serde_json::to_string_pretty(&outputs)?);

    match outputs.iter().find(|o| o.status == QueryStatus::Error) {
        Some(failed) => eprintln!("❌ Query {} failed: {}", failed.order, failed.feedback),
        None => eprintln!("✅ All {} query(ies) succeeded", outputs.len()),
    }

    Ok(())
}

pub fn list_languages() {
    println!("📋 Supported Languages:\n");
    println!("{:<12} {:<6} {:<16} {}", "Name", "Ext", "Image", "Command");
    println!("{}", "─".repeat(72));

    for language in Language::ALL {
        let entry = format!("main.{}", language.extension());
        let entry = if language == Language::Java {
            "Main.java".to_string()
        } else {
            entry
        };
        println!(
            "{:<12} {:<6} {:<16} {}",
            language.to_string(),
            language.extension(),
            language.default_image(),
            language.exec_command(&entry)
        );
    }

    println!("\n✅ Total: {} language(s)", Language::ALL.len());
}

/// Write the default configuration and create the runs root under `path`
pub fn init_project(path: &str) -> Result<()> {
    println!("🚀 Initializing sandbox project at: {}", path);

    let project_path = Path::new(path);
    let config = SandboxConfig::default();

    let config_path = project_path.join(DEFAULT_CONFIG_PATH);
    if config_path.exists() {
        println!("  ⏭️  Kept existing: {}", DEFAULT_CONFIG_PATH);
    } else {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json_content = serde_json::to_string_pretty(&config)?;
        fs::write(&config_path, json_content)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("  ✅ Created: {}", DEFAULT_CONFIG_PATH);
    }

    let runs_root: PathBuf = project_path.join(&config.runs_root);
    fs::create_dir_all(&runs_root)
        .with_context(|| format!("Failed to create directory: {}", runs_root.display()))?;
    println!("  ✅ Created: {}", config.runs_root.display());

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Adjust limits in {}", DEFAULT_CONFIG_PATH);
    println!("  2. Try it: sandbox-cli exec --file main.js");

    Ok(())
}
