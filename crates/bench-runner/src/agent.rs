use crate::cancel::CancellationToken;
use crate::config::AgentConfig;
use crate::process::{kill_and_reap, POLL_INTERVAL};
use anyhow::{anyhow, Context, Result};
use bench_core::{ensure_dir, ProgressEvent};
use bench_parser::ProgressDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long to keep reading after the agent exits, for output still held
/// by its descendants.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub benchmark_id: String,
    pub target: String,
    pub timeout: Duration,
    pub transcript_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct AgentRun {
    pub output_lines: Vec<String>,
    pub timed_out: bool,
    /// Stopped through the cancellation token rather than by exiting.
    pub cancelled: bool,
}

/// Non-blocking producer side of the per-invocation progress queue. Events
/// that do not fit are dropped and counted.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: SyncSender<ProgressEvent>,
    dropped: Arc<AtomicUsize>,
}

impl ProgressSink {
    pub fn new(tx: SyncSender<ProgressEvent>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn emit(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The external agent under test. Implementations run on a background
/// thread and must return promptly once `stop` is cancelled.
pub trait AgentInvoker: Send + Sync {
    fn invoke(
        &self,
        request: &AgentRequest,
        progress: &ProgressSink,
        stop: &CancellationToken,
    ) -> Result<AgentRun>;
}

/// Runs a configured command template as the agent, teeing its output into
/// the transcript file.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: AgentConfig,
}

impl CommandAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Substitutes placeholders. Without a model, any argument mentioning
    /// `{model}` is dropped along with the flag right before it.
    pub fn render_command(&self, request: &AgentRequest) -> Vec<String> {
        let model = self.config.resolved_model();
        let timeout = request.timeout.as_secs().to_string();
        let transcript = request.transcript_path.display().to_string();
        let mut argv: Vec<String> = Vec::with_capacity(self.config.command.len());
        for arg in &self.config.command {
            if arg.contains("{model}") && model.is_none() {
                if argv.len() > 1 && argv.last().map(|p| p.starts_with('-')).unwrap_or(false) {
                    argv.pop();
                }
                continue;
            }
            argv.push(
                arg.replace("{target}", &request.target)
                    .replace("{benchmark_id}", &request.benchmark_id)
                    .replace("{timeout}", &timeout)
                    .replace("{transcript}", &transcript)
                    .replace("{model}", model.as_deref().unwrap_or_default()),
            );
        }
        argv
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Kills the agent on early return so no child outlives its invocation.
struct AgentProcessGuard {
    child: Child,
    reaped: bool,
}

impl AgentProcessGuard {
    fn terminate(&mut self) {
        if !self.reaped {
            kill_and_reap(&mut self.child);
            self.reaped = true;
        }
    }
}

impl Drop for AgentProcessGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    source: Option<R>,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) {
    let Some(source) = source else {
        return;
    };
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

impl AgentInvoker for CommandAgent {
    fn invoke(
        &self,
        request: &AgentRequest,
        progress: &ProgressSink,
        stop: &CancellationToken,
    ) -> Result<AgentRun> {
        let argv = self.render_command(request);
        let program = argv
            .first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        if let Some(parent) = request.transcript_path.parent() {
            ensure_dir(parent)?;
        }
        let file = File::create(&request.transcript_path).with_context(|| {
            format!(
                "failed to create transcript {}",
                request.transcript_path.display()
            )
        })?;
        let mut transcript = BufWriter::new(file);
        let decoder = ProgressDecoder::new()?;

        let mut cmd = Command::new(program);
        cmd.args(&argv[1..])
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent {}", program))?;
        let mut guard = AgentProcessGuard {
            child,
            reaped: false,
        };
        info!(benchmark_id = %request.benchmark_id, target = %request.target, "agent started");

        let (line_tx, line_rx) = mpsc::channel();
        spawn_line_reader(guard.child.stdout.take(), Stream::Stdout, line_tx.clone());
        spawn_line_reader(guard.child.stderr.take(), Stream::Stderr, line_tx);

        let start = Instant::now();
        let mut run = AgentRun::default();
        let mut pipes_open = true;
        let mut exited_at: Option<Instant> = None;
        loop {
            if pipes_open {
                match line_rx.recv_timeout(POLL_INTERVAL) {
                    Ok((stream, line)) => {
                        writeln!(transcript, "{}", line)?;
                        if stream == Stream::Stdout {
                            if let Some(event) = decoder.decode(&line) {
                                progress.emit(event);
                            }
                        }
                        run.output_lines.push(line);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => pipes_open = false,
                }
            } else {
                thread::sleep(POLL_INTERVAL);
            }

            match exited_at {
                None => {
                    if let Some(status) = guard.child.try_wait()? {
                        guard.reaped = true;
                        debug!(benchmark_id = %request.benchmark_id, %status, "agent exited");
                        exited_at = Some(Instant::now());
                    } else if start.elapsed() > request.timeout {
                        warn!(
                            benchmark_id = %request.benchmark_id,
                            timeout_secs = request.timeout.as_secs(),
                            "agent exceeded deadline; killing"
                        );
                        run.timed_out = true;
                        guard.terminate();
                        exited_at = Some(Instant::now());
                    } else if stop.is_cancelled() {
                        info!(benchmark_id = %request.benchmark_id, "agent stop requested");
                        run.cancelled = true;
                        guard.terminate();
                        exited_at = Some(Instant::now());
                    }
                }
                Some(at) => {
                    if !pipes_open || at.elapsed() > DRAIN_GRACE {
                        break;
                    }
                }
            }
        }
        while let Ok((_, line)) = line_rx.try_recv() {
            writeln!(transcript, "{}", line)?;
            run.output_lines.push(line);
        }
        transcript.flush()?;

        if progress.dropped() > 0 {
            warn!(
                benchmark_id = %request.benchmark_id,
                dropped = progress.dropped(),
                "progress queue full; events dropped"
            );
        }
        Ok(run)
    }
}
