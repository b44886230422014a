// In-memory container runtime for tests.
//
// Uploaded archives are unpacked into a per-container file map, and every exec
// is answered by a scripted handler that sees the script and those files.

use crate::demux::{encode_frame, StreamKind};
use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, ExecSpec};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

/// Scripted answer to one exec
#[derive(Debug, Clone, Default)]
pub struct FakeExec {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub delay: Duration,
    pub fail: Option<String>,
}

impl FakeExec {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            ..Self::default()
        }
    }

    pub fn stderr(text: impl Into<String>, exit_code: i64) -> Self {
        Self {
            stderr: text.into(),
            exit_code,
            ..Self::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail: Some(reason.into()),
            ..Self::default()
        }
    }
}

type Handler = dyn Fn(&str, &HashMap<String, String>) -> FakeExec + Send + Sync;

#[derive(Default)]
struct FakeState {
    next_id: usize,
    created: Vec<ContainerSpec>,
    /// Files per live container, keyed by absolute in-container path
    live: HashMap<String, HashMap<String, String>>,
    removed: Vec<String>,
    stopped: Vec<(String, Duration)>,
    scripts: Vec<String>,
    pulled: Vec<String>,
    published: HashMap<String, u16>,
}

pub struct FakeRuntime {
    handler: Box<Handler>,
    state: Mutex<FakeState>,
    pub missing_images: Vec<String>,
    /// Images that only become creatable once `ensure_image` pulled them
    pub unpulled_images: Vec<String>,
    pub fail_create: bool,
    pub fail_start: bool,
}

impl FakeRuntime {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &HashMap<String, String>) -> FakeExec + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            state: Mutex::new(FakeState::default()),
            missing_images: Vec::new(),
            unpulled_images: Vec::new(),
            fail_create: false,
            fail_start: false,
        }
    }

    /// Every test command behaves like `cat`: stdout is the fixture content
    pub fn echo() -> Self {
        Self::new(|script, files| {
            let stdin = parse_script(script).1;
            FakeExec::stdout(files.get(stdin).cloned().unwrap_or_default())
        })
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn live_containers(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn stopped(&self) -> Vec<(String, Duration)> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.state.lock().unwrap().scripts.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state.lock().unwrap().pulled.clone()
    }
}

/// Split a test script `{ exec\n} < path` into `(exec, path)`.
/// Scripts without a redirect come back with an empty path.
pub fn parse_script(script: &str) -> (&str, &str) {
    match script.rsplit_once("\n} < ") {
        Some((head, path)) => (head.trim_start_matches("{ "), path),
        None => (script, ""),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.missing_images.iter().any(|m| m == image) {
            return Err(RuntimeError::NotFound(image.to_string()));
        }
        self.state.lock().unwrap().pulled.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if self.fail_create {
            return Err(RuntimeError::Other("no space left on device".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let unpulled = self.unpulled_images.contains(&spec.image);
        if unpulled && !state.pulled.contains(&spec.image) {
            return Err(RuntimeError::NotFound(spec.image.clone()));
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        if spec.published_port.is_some() {
            let host_port = 40_000 + state.next_id as u16;
            state.published.insert(id.clone(), host_port);
        }
        state.created.push(spec.clone());
        state.live.insert(id.clone(), HashMap::new());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        if self.fail_start {
            return Err(RuntimeError::Other("OCI runtime create failed".to_string()));
        }
        if !self.state.lock().unwrap().live.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeError> {
        let mut unpacked = HashMap::new();
        let mut tar = tar::Archive::new(&archive[..]);
        let entries = tar
            .entries()
            .map_err(|e| RuntimeError::Other(e.to_string()))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| RuntimeError::Other(e.to_string()))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .map_err(|e| RuntimeError::Other(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| RuntimeError::Other(e.to_string()))?;
            unpacked.insert(format!("{}/{}", path.trim_end_matches('/'), name), content);
        }

        let mut state = self.state.lock().unwrap();
        let files = state
            .live
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        files.extend(unpacked);
        Ok(())
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecOutput, RuntimeError> {
        let answer = {
            let mut state = self.state.lock().unwrap();
            state.scripts.push(spec.script.clone());
            let files = state
                .live
                .get(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            (self.handler)(&spec.script, files)
        };

        if !answer.delay.is_zero() {
            tokio::time::sleep(answer.delay).await;
        }

        if let Some(reason) = answer.fail {
            return Err(RuntimeError::Other(reason));
        }

        let mut output = ExecOutput {
            exit_code: Some(answer.exit_code),
            ..ExecOutput::default()
        };
        let mut kept = 0usize;
        for (kind, text) in [
            (StreamKind::Stdout, answer.stdout),
            (StreamKind::Stderr, answer.stderr),
        ] {
            let room = spec.max_output_bytes.saturating_sub(kept);
            if text.len() > room {
                output.truncated = true;
            }
            let take = text.len().min(room);
            if take > 0 {
                encode_frame(&mut output.raw, kind, &text.as_bytes()[..take]);
                kept += take;
            }
        }

        Ok(output)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .stopped
            .push((id.to_string(), grace));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.live.remove(id).is_some() {
            state.removed.push(id.to_string());
        }
        Ok(())
    }

    async fn host_port(&self, id: &str, port: u16) -> Result<u16, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .published
            .get(id)
            .copied()
            .ok_or_else(|| RuntimeError::Other(format!("port {} is not published", port)))
    }
}
