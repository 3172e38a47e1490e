//! Process runner -- launches one script as an external process and streams
//! its output line by line.
//!
//! Each script runs in its own process group so that a stop request can
//! signal the whole tree. Termination is SIGTERM first, SIGKILL after the
//! configured grace period.

pub mod decode;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::controller::queue::ScriptEntry;

use self::decode::{Decoder, DecoderChain};

/// Upper bound on draining pipes after the process has been terminated.
/// Orphaned grandchildren can keep a pipe open indefinitely.
const DRAIN_LIMIT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to launch {}: {source}", .path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to capture {stream} of {}", .path.display())]
    MissingPipe { path: PathBuf, stream: &'static str },
    #[error("i/o error while monitoring {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What a finished (or terminated) script left behind.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    /// `None` when the process died from a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    /// The process was terminated by a stop request.
    pub terminated: bool,
    /// Every decoded line, newline-joined.
    pub output: String,
    /// Non-empty lines forwarded to the caller.
    pub line_count: usize,
    /// Lines that needed a decoder other than the primary one.
    pub fallback_decodes: usize,
    /// Reading an output pipe failed. The process group was terminated and
    /// `output` holds what was read before the failure.
    pub stream_error: Option<String>,
}

/// Launches one script and feeds its non-empty output lines to `on_line`.
///
/// Cancelling `cancel` terminates the in-flight process; the outcome is
/// still returned with whatever output was captured.
#[async_trait::async_trait]
pub trait ScriptLauncher: Send + Sync {
    async fn run(
        &self,
        script: &ScriptEntry,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, RunnerError>;
}

/// Fixed execution environment shared by every script of a run.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub interpreter: Option<String>,
    pub interpreter_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub decoders: DecoderChain,
    pub terminate_grace: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        Ok(Self {
            interpreter: config.interpreter.clone(),
            interpreter_args: config.interpreter_args.clone(),
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            decoders: DecoderChain::from_names(&config.encodings)?,
            terminate_grace: Duration::from_millis(config.terminate_grace_ms),
        })
    }
}

/// [`ScriptLauncher`] backed by real child processes.
pub struct ProcessRunner {
    settings: RunnerSettings,
}

impl ProcessRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    fn command(&self, script: &ScriptEntry) -> Command {
        let mut cmd = match &self.settings.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.args(&self.settings.interpreter_args).arg(&script.path);
                cmd
            }
            None => Command::new(&script.path),
        };
        if let Some(dir) = &self.settings.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.settings.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Accumulates decoded output and forwards visible lines.
struct LineSink<'a, 'f> {
    decoders: &'a DecoderChain,
    on_line: &'a mut (dyn for<'l> FnMut(&'l str) + Send + 'f),
    outcome: ProcessOutcome,
}

impl LineSink<'_, '_> {
    fn push(&mut self, raw: &[u8]) {
        let decoded = self.decoders.decode_line(raw);
        if decoded.decoder != Decoder::Utf8 {
            self.outcome.fallback_decodes += 1;
            debug!(decoder = ?decoded.decoder, "line decoded with fallback");
        }
        self.outcome.output.push_str(&decoded.text);
        self.outcome.output.push('\n');
        if !decoded.text.trim().is_empty() {
            self.outcome.line_count += 1;
            (self.on_line)(&decoded.text);
        }
    }
}

#[async_trait::async_trait]
impl ScriptLauncher for ProcessRunner {
    async fn run(
        &self,
        script: &ScriptEntry,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, RunnerError> {
        let path = script.path.clone();
        if cancel.is_cancelled() {
            debug!(script = %path.display(), "stop already requested, not launching");
            return Ok(ProcessOutcome {
                terminated: true,
                ..ProcessOutcome::default()
            });
        }
        // An interpreter would start fine and only complain on stderr.
        let on_disk = match &self.settings.working_dir {
            Some(dir) if path.is_relative() => dir.join(&path),
            _ => path.clone(),
        };
        if !on_disk.is_file() {
            return Err(RunnerError::Launch {
                path,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "script not found"),
            });
        }
        let mut child = self
            .command(script)
            .spawn()
            .map_err(|source| RunnerError::Launch {
                path: path.clone(),
                source,
            })?;
        info!(script = %path.display(), pid = child.id(), "script started");

        let stdout = child.stdout.take().ok_or_else(|| RunnerError::MissingPipe {
            path: path.clone(),
            stream: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or_else(|| RunnerError::MissingPipe {
            path: path.clone(),
            stream: "stderr",
        })?;
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);

        let mut sink = LineSink {
            decoders: &self.settings.decoders,
            on_line,
            outcome: ProcessOutcome::default(),
        };
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut out_open = true;
        let mut err_open = true;
        let mut drain_deadline: Option<tokio::time::Instant> = None;
        let mut stream_error: Option<std::io::Error> = None;

        // read_until keeps partial data in the buffer when another branch
        // wins, so the buffers persist across iterations.
        while out_open || err_open {
            tokio::select! {
                biased;

                _ = cancel.cancelled(), if drain_deadline.is_none() => {
                    warn!(script = %path.display(), "stop requested, terminating script");
                    terminate_child(&mut child, self.settings.terminate_grace).await;
                    sink.outcome.terminated = true;
                    drain_deadline = Some(tokio::time::Instant::now() + DRAIN_LIMIT);
                }

                _ = sleep_until_opt(drain_deadline), if drain_deadline.is_some() => {
                    debug!(script = %path.display(), "pipes still open after termination, giving up on drain");
                    break;
                }

                read = stdout.read_until(b'\n', &mut out_buf), if out_open => {
                    match read {
                        Ok(0) => out_open = false,
                        Ok(_) => {
                            sink.push(&out_buf);
                            out_buf.clear();
                        }
                        Err(source) => {
                            stream_error = Some(source);
                            break;
                        }
                    }
                }

                read = stderr.read_until(b'\n', &mut err_buf), if err_open => {
                    match read {
                        Ok(0) => err_open = false,
                        Ok(_) => {
                            sink.push(&err_buf);
                            err_buf.clear();
                        }
                        Err(source) => {
                            stream_error = Some(source);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(source) = stream_error {
            let err = RunnerError::Io {
                path: path.clone(),
                source,
            };
            warn!(script = %path.display(), error = %err, "lost output stream, terminating script");
            terminate_child(&mut child, self.settings.terminate_grace).await;
            sink.outcome.stream_error = Some(err.to_string());
        }

        // Output cut off without a trailing newline by termination.
        if !out_buf.is_empty() {
            sink.push(&out_buf);
        }
        if !err_buf.is_empty() {
            sink.push(&err_buf);
        }

        let status = child
            .wait()
            .await
            .map_err(|source| RunnerError::Io {
                path: path.clone(),
                source,
            })?;

        let mut outcome = sink.outcome;
        outcome.exit_code = status.code();
        outcome.success = status.success();
        info!(
            script = %path.display(),
            exit_code = ?outcome.exit_code,
            lines = outcome.line_count,
            terminated = outcome.terminated,
            "script exited"
        );
        Ok(outcome)
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Gracefully terminate a child process and its process group.
///
/// Sends SIGTERM first, waits up to `grace`, then sends SIGKILL if the
/// process is still running.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    let pgid = child.id().map(|pid| pid as i32);

    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "failed to signal child");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
        }
        Err(_) => {
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            #[cfg(unix)]
            {
                if let Some(pgid) = pgid {
                    unsafe {
                        libc::kill(-pgid, libc::SIGKILL);
                    }
                }
            }
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
        }
    }

    // Children that ignored SIGTERM but whose leader exited still share the group.
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}
