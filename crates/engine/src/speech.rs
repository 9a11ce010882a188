//! Speech through an external text-to-speech command that reads the utterance on stdin.

use std::ffi::OsString;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::native::{QueueMode, SpeechEngine, SpeechFactory};
use crate::{EngineError, Result};

/// Starts a [`CommandSpeech`] for `command`: program first, then fixed arguments.
#[derive(Debug, Clone)]
pub struct CommandSpeechFactory {
    command: Vec<String>,
}

impl CommandSpeechFactory {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl SpeechFactory for CommandSpeechFactory {
    fn start(&self) -> Result<Arc<dyn SpeechEngine>> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| EngineError::Speech("empty speech command".to_string()))?;
        let resolved = locate_program(program, std::env::var_os("PATH"))
            .ok_or_else(|| EngineError::Speech(format!("`{program}` not found on PATH")))?;
        debug!(program = %resolved.display(), "speech engine ready");
        Ok(Arc::new(CommandSpeech {
            program: resolved,
            args: args.to_vec(),
            state: Mutex::new(SpeechState::default()),
        }))
    }
}

#[derive(Default)]
struct SpeechState {
    current: Option<Child>,
    closed: bool,
}

/// One child process per utterance. Flushing kills the one playing; queueing waits for it.
pub struct CommandSpeech {
    program: PathBuf,
    args: Vec<String>,
    state: Mutex<SpeechState>,
}

impl CommandSpeech {
    fn spawn(&self, text: &str) -> Result<Child> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| EngineError::Speech(format!("spawn {}: {err}", self.program.display())))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
        }
        Ok(child)
    }
}

fn halt(child: &mut Child) {
    if matches!(child.try_wait(), Ok(None)) {
        if let Err(err) = child.kill() {
            warn!(error = %err, "cannot stop speech process");
        }
    }
    let _ = child.wait();
}

impl SpeechEngine for CommandSpeech {
    fn speak(&self, text: &str, mode: QueueMode, utterance_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Speech("engine shut down".to_string()));
        }
        if let Some(mut previous) = state.current.take() {
            match mode {
                QueueMode::Flush => halt(&mut previous),
                QueueMode::Add => {
                    previous.wait()?;
                }
            }
        }
        trace!(utterance = utterance_id, chars = text.len(), "utterance queued");
        state.current = Some(self.spawn(text)?);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if let Some(mut child) = self.state.lock().current.take() {
            halt(&mut child);
        }
        Ok(())
    }

    fn wait(&self) -> Result<()> {
        let current = self.state.lock().current.take();
        if let Some(mut child) = current {
            child.wait()?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(mut child) = state.current.take() {
            halt(&mut child);
        }
    }
}

impl Drop for CommandSpeech {
    fn drop(&mut self) {
        if let Some(mut child) = self.state.get_mut().current.take() {
            halt(&mut child);
        }
    }
}

/// An explicit path is taken as is; a bare name is searched on `path_var`.
fn locate_program(program: &str, path_var: Option<OsString>) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return is_probably_executable(direct).then(|| direct.to_path_buf());
    }
    let paths = path_var?;
    std::env::split_paths(&paths)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(program))
        .find(|candidate| is_probably_executable(candidate))
}

fn is_probably_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        true
    }
}
