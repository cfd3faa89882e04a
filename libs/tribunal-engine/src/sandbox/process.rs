/// Local-process backend: one interpreter per run, confined by rlimits.
use super::protocol::{Envelope, ExitKind, RunnerExit, TailBuffer, RUNNER_SCRIPT, STDERR_CAP, STDOUT_CAP};
use super::{ResourceLimits, RunnerBackend};
use crate::error::SandboxError;
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;
use tribunal_common::config::LanguageConfig;

const MAX_OPEN_FILES: u64 = 64;

#[derive(Debug, Clone, Copy)]
struct RunLimits {
    cpu_secs: u64,
    mem_bytes: u64,
}

impl RunLimits {
    fn new(limits: &ResourceLimits, deadline: Duration) -> Self {
        // Whole seconds, rounded up, plus one so the wall clock normally fires first
        let cpu_secs = (deadline.as_millis() as u64).saturating_add(999) / 1000 + 1;
        Self {
            cpu_secs,
            mem_bytes: limits.memory_bytes,
        }
    }
}

/// Runs in the forked child before exec, so it must stay async-signal-safe
fn apply_rlimits(limits: &RunLimits) -> std::io::Result<()> {
    let set = |resource, soft: u64, hard: u64| {
        let limit = libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        };
        // SAFETY: setrlimit only reads the struct we pass
        if unsafe { libc::setrlimit(resource, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    };

    // SIGXCPU at the soft limit, SIGKILL one second later
    set(libc::RLIMIT_CPU, limits.cpu_secs, limits.cpu_secs + 1)?;
    set(libc::RLIMIT_AS, limits.mem_bytes, limits.mem_bytes)?;
    set(libc::RLIMIT_FSIZE, 0, 0)?;
    set(libc::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
    set(libc::RLIMIT_NPROC, 0, 0)?;
    set(libc::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

fn exit_kind(status: ExitStatus) -> ExitKind {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitKind::Exited(i64::from(code)),
        (None, Some(signal)) => ExitKind::Signaled(signal),
        (None, None) => ExitKind::Exited(-1),
    }
}

/// Read a pipe to EOF, keeping only its last `cap` bytes
async fn drain<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<TailBuffer> {
    let mut tail = TailBuffer::new(cap);
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(tail);
        }
        tail.push(&chunk[..read]);
    }
}

pub struct ProcessBackend {
    interpreter: String,
}

impl ProcessBackend {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    pub fn from_config(config: &LanguageConfig) -> Self {
        Self::new(config.interpreter.clone())
    }
}

#[async_trait]
impl RunnerBackend for ProcessBackend {
    async fn execute(
        &self,
        envelope: &Envelope,
        limits: &ResourceLimits,
        deadline: Duration,
    ) -> Result<RunnerExit, SandboxError> {
        let payload = envelope.to_bytes()?;
        // Throwaway working directory, removed when this run ends
        let workdir = tempfile::tempdir()?;
        let path_env = std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());
        let run_limits = RunLimits::new(limits, deadline);

        let mut cmd = Command::new(&self.interpreter);
        cmd.args(["-I", "-S", "-B", "-c", RUNNER_SCRIPT])
            .current_dir(workdir.path())
            .env_clear()
            .env("PATH", &path_env)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // SAFETY: apply_rlimits only calls setrlimit, which is async-signal-safe
        unsafe {
            cmd.pre_exec(move || apply_rlimits(&run_limits));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {}", self.interpreter, e)))?;
        let (Some(mut stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SandboxError::Spawn("runner pipes unavailable".to_string()));
        };

        let run = async move {
            let feed = async move {
                // A runner that dies before reading everything is classified by its exit status
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "Runner closed stdin early");
                }
            };
            let (_, stdout, stderr, status) =
                tokio::join!(feed, drain(stdout, STDOUT_CAP), drain(stderr, STDERR_CAP), child.wait());
            Ok::<_, std::io::Error>(RunnerExit::from_streams(stdout?, stderr?, exit_kind(status?)))
        };

        // On timeout the future is dropped and kill_on_drop sends SIGKILL
        match tokio::time::timeout(deadline, run).await {
            Ok(Ok(exit)) => {
                if exit.stdout_truncated {
                    debug!("Runner stdout exceeded its cap, kept the tail");
                }
                Ok(exit)
            }
            Ok(Err(e)) => Err(SandboxError::Io(e)),
            Err(_) => {
                debug!(deadline_ms = deadline.as_millis() as u64, "Runner exceeded deadline");
                Ok(RunnerExit::deadline_elapsed())
            }
        }
    }
}
