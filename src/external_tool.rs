//
// external_tool.rs
// MedImg-Pipeline
//
// Abstraction over the external segmentation program: a one-off availability probe and
// invocation with a hard wall-clock timeout that kills and reaps the child.
//
// Thales Matheus Mendonça Santos - November 2025

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};

/// What a finished (not timed-out) invocation reported.
#[derive(Debug, Clone)]
pub struct ExitResult {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("cannot start {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("timed out after {after:?}")]
    TimedOut { after: Duration },
    #[error("lost contact with child process: {0}")]
    Io(#[from] io::Error),
}

/// A program the orchestrator can run. `available` must not change over the tool's lifetime.
pub trait ExternalTool: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn invoke(
        &self,
        args: &[OsString],
        timeout: Duration,
    ) -> impl Future<Output = Result<ExitResult, InvokeError>> + Send;
}

/// Runs a real executable found on `PATH` (or given by path).
#[derive(Debug, Clone)]
pub struct SubprocessTool {
    program: String,
    available: bool,
}

impl SubprocessTool {
    /// Run `<program> --help` once; the tool counts as available only on a zero exit within
    /// `probe_timeout`.
    pub async fn probe(program: impl Into<String>, probe_timeout: Duration) -> Self {
        let program = program.into();
        let status = tokio::time::timeout(
            probe_timeout,
            Command::new(&program)
                .arg("--help")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;

        let available = matches!(status, Ok(Ok(s)) if s.success());
        if available {
            info!(%program, "segmentation program available");
        } else {
            warn!(%program, "segmentation program not available; mock segmentation will be used");
        }
        Self { program, available }
    }

    /// Construct without probing, for callers that already know the answer.
    pub fn with_availability(program: impl Into<String>, available: bool) -> Self {
        Self {
            program: program.into(),
            available,
        }
    }
}

impl ExternalTool for SubprocessTool {
    fn name(&self) -> &str {
        &self.program
    }

    fn available(&self) -> bool {
        self.available
    }

    async fn invoke(&self, args: &[OsString], timeout: Duration) -> Result<ExitResult, InvokeError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        info!(program = %self.program, ?args, "running external program");

        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so workers the program forks can be signalled together.
        #[cfg(unix)]
        {
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| InvokeError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();

        // Drain both pipes concurrently so a chatty child never blocks on a full pipe.
        let mut stdout = child.stdout.take().map(drain);
        let mut stderr = child.stderr.take().map(drain);

        // One deadline covers the exit and the end of both streams: a forked worker can keep
        // the pipes open after the program itself has exited.
        let finished = tokio::time::timeout_at(deadline, async {
            let status = child.wait().await?;
            let (out, err) = tokio::join!(collect(&mut stdout), collect(&mut stderr));
            Ok::<_, io::Error>((status, out, err))
        })
        .await;

        match finished {
            Ok(Ok((status, stdout, stderr))) => {
                let elapsed = started.elapsed();
                debug!(program = %self.program, ?status, ?elapsed, "external program exited");
                Ok(ExitResult {
                    exit_code: status.code(),
                    success: status.success(),
                    stdout,
                    stderr,
                    elapsed,
                })
            }
            Ok(Err(e)) => Err(InvokeError::Io(e)),
            Err(_) => {
                self.terminate(&mut child, pid).await;
                for handle in [stdout, stderr].into_iter().flatten() {
                    handle.abort();
                }
                warn!(program = %self.program, ?timeout, "external program timed out and was killed");
                Err(InvokeError::TimedOut {
                    after: started.elapsed(),
                })
            }
        }
    }
}

impl SubprocessTool {
    /// Kill the whole process group, then reap the direct child if it is still around.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        #[cfg(unix)]
        {
            if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
                match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => {
                        warn!(program = %self.program, error = %e, "failed to kill process group")
                    }
                }
            }
        }
        #[cfg(not(unix))]
        let _ = pid;

        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        // kill() also waits, so the child is reaped before we return.
        if let Err(e) = child.kill().await {
            warn!(program = %self.program, error = %e, "failed to kill timed-out program");
        }
    }
}

fn drain<R>(mut pipe: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(handle: &mut Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}
