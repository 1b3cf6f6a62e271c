use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{step}: failed to spawn {program}: {source}")]
    Spawn {
        step: String,
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{step} timed out after {}s", timeout.as_secs())]
    TimedOut { step: String, timeout: Duration },
    #[error("{step}: {source}")]
    Io {
        step: String,
        #[source]
        source: io::Error,
    },
}

/// A program plus arguments, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn to_command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(cwd);
        cmd
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct BoundedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl BoundedOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Trimmed stderr, falling back to stdout, then to the exit status.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("command exited non-zero ({})", self.status)
    }
}

fn spawn_drain<R: Read + Send + 'static>(source: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    let mut source = source?;
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        buf
    }))
}

fn collect_drain(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

pub(crate) fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Runs `cmd` to completion or until `timeout` elapses, in which case the
/// child is killed and `ProcessError::TimedOut` is returned. A non-zero exit
/// is not an error here; callers inspect `BoundedOutput::success`.
pub fn run_bounded(
    mut cmd: Command,
    step: &str,
    timeout: Duration,
) -> Result<BoundedOutput, ProcessError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        step: step.to_string(),
        program,
        source,
    })?;
    let stdout = spawn_drain(child.stdout.take());
    let stderr = spawn_drain(child.stderr.take());

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                kill_and_reap(&mut child);
                return Err(ProcessError::Io {
                    step: step.to_string(),
                    source,
                });
            }
        }
        if start.elapsed() > timeout {
            // Drain threads are left detached: a grandchild may still hold
            // the pipes open.
            kill_and_reap(&mut child);
            return Err(ProcessError::TimedOut {
                step: step.to_string(),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(BoundedOutput {
        status,
        stdout: collect_drain(stdout),
        stderr: collect_drain(stderr),
        elapsed: start.elapsed(),
    })
}
