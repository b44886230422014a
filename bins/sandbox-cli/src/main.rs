mod commands;

use clap::{Parser, Subcommand};
use sandbox_common::types::FailureKind;
use sandbox_core::lint::LintError;
use sandbox_core::query::QueryError;
use sandbox_core::SandboxError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// The sandbox could not run the program
const EXIT_OPERATIONAL: i32 = 2;
/// The program ran past its deadline
const EXIT_TIMEOUT: i32 = 3;

#[derive(Parser)]
#[command(name = "sandbox-cli")]
#[command(about = "Sandbox CLI - Run untrusted code and SQL linting in throwaway containers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a JSON execution request
    Run {
        /// Request file, or `-` for stdin
        #[arg(short, long)]
        request: String,
    },

    /// Run local source files with an inferred or given language
    Exec {
        /// Source file(s); the first one is the entry point
        #[arg(short, long, required = true)]
        file: Vec<PathBuf>,

        /// Language (javascript, python, java, cpp)
        #[arg(short, long)]
        lang: Option<String>,

        /// Text fed to the program's stdin
        #[arg(short, long)]
        input: Option<String>,

        /// Expected output; switches to TEST mode
        #[arg(short, long)]
        expected: Option<String>,

        /// Docker image (defaults to the language's image)
        #[arg(long)]
        image: Option<String>,
    },

    /// Lint a SQL query with sqlfluff
    LintSql {
        /// SQL file, or `-` for stdin
        #[arg(short, long)]
        file: String,

        /// sqlfluff configuration file
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },

    /// Run SQL queries in order against a throwaway PostgreSQL
    Query {
        /// SQL file(s), one query each, run in the given order
        #[arg(short, long, required = true)]
        file: Vec<PathBuf>,
    },

    /// List supported languages
    Languages,

    /// Write a default config/sandbox.json
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,
    },
}

/// Process exit status for a failed command
fn exit_code(err: &anyhow::Error) -> i32 {
    let kind = err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<SandboxError>() {
            return Some(e.kind());
        }
        if let Some(e) = cause.downcast_ref::<QueryError>() {
            return Some(e.kind());
        }
        match cause.downcast_ref::<LintError>() {
            Some(LintError::TimedOut) => Some(FailureKind::Timeout),
            Some(LintError::Sandbox(e)) => Some(e.kind()),
            _ => None,
        }
    });

    match kind {
        Some(FailureKind::Timeout) => EXIT_TIMEOUT,
        _ => EXIT_OPERATIONAL,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("SANDBOX_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { request } => commands::run_request(&request).await,
        Commands::Exec {
            file,
            lang,
            input,
            expected,
            image,
        } => {
            commands::exec_files(&file, lang.as_deref(), input, expected, image.as_deref()).await
        }
        Commands::LintSql { file, rules } => commands::lint(&file, rules.as_deref()).await,
        Commands::Query { file } => commands::query(&file).await,
        Commands::Languages => {
            commands::list_languages();
            Ok(())
        }
        Commands::Init { path } => commands::init_project(&path),
    };

    if let Err(e) = result {
        eprintln!("❌ {:#}", e);
        std::process::exit(exit_code(&e));
    }
}
