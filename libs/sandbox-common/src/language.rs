// Supported runtimes and their command templates.
// The set is closed: adding a runtime means adding a variant here.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "js", alias = "node")]
    JavaScript,
    #[serde(alias = "py")]
    Python,
    Java,
    #[serde(alias = "c++")]
    Cpp,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::JavaScript,
        Language::Python,
        Language::Java,
        Language::Cpp,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            Language::JavaScript => "js",
            Language::Python => "py",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|lang| lang.extension().eq_ignore_ascii_case(ext.trim_start_matches('.')))
    }

    /// Resolve from the extension of `path`
    pub fn from_path(path: &str) -> Option<Self> {
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub fn default_image(&self) -> &'static str {
        match self {
            Language::JavaScript => "node:latest",
            Language::Python => "python:latest",
            Language::Java => "openjdk:latest",
            Language::Cpp => "gcc:latest",
        }
    }

    /// Compile step for `entry`, if the runtime has one
    pub fn compile_command(&self, entry: &str) -> Option<String> {
        let target = EntryPoint::new(entry);
        match self {
            Language::JavaScript | Language::Python => None,
            Language::Java => Some(format!("javac {}", shell_quote(entry))),
            Language::Cpp => Some(format!(
                "g++ {} -o {}",
                shell_quote(entry),
                shell_quote(&target.binary())
            )),
        }
    }

    /// Runs an already compiled `entry`
    pub fn run_command(&self, entry: &str) -> String {
        let target = EntryPoint::new(entry);
        match self {
            Language::JavaScript => format!("node {}", shell_quote(entry)),
            Language::Python => format!("python3 {}", shell_quote(entry)),
            Language::Java => format!(
                "java -cp {} {}",
                shell_quote(&target.dir),
                shell_quote(&target.stem)
            ),
            Language::Cpp => shell_quote(&target.binary()),
        }
    }

    /// Compile (when needed) then run `entry` as a single shell command
    pub fn exec_command(&self, entry: &str) -> String {
        match self.compile_command(entry) {
            Some(compile) => format!("{} && {}", compile, self.run_command(entry)),
            None => self.run_command(entry),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "python" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            _ => bail!(
                "Unknown language '{}'. Supported: {}",
                s,
                Language::ALL.map(|l| l.to_string()).join(", ")
            ),
        }
    }
}

struct EntryPoint {
    dir: String,
    stem: String,
}

impl EntryPoint {
    fn new(entry: &str) -> Self {
        let path = Path::new(entry);
        let dir = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { dir, stem }
    }

    fn binary(&self) -> String {
        format!("{}/{}", self.dir, self.stem)
    }
}

/// Single-quote `s` for `sh -c`, leaving plain words untouched
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
