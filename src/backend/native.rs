//! Native backend - jobs run as direct child processes of the supervisor.
//!
//! The child is spawned with piped stdout/stderr in its own process group; a
//! waiter task owns the `Child` and publishes its exit through the handle's
//! watch channel. Termination signals the whole group with SIGTERM (or
//! `taskkill` on Windows) and escalates to a forced kill once the grace
//! period runs out.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;

use super::{
    entry_file_name, BackendError, ExecutionBackend, Exit, Handle, HandleRef, LogSource,
    OutputStream,
};
use crate::config::{BackendConfig, BackendKind};
use crate::process_monitor;

/// Upper bound on waiting for the waiter task after a forced kill.
const KILL_SETTLE: Duration = Duration::from_secs(5);

pub struct NativeBackend {
    interpreter: String,
    interpreter_args: Vec<String>,
    liveness_poll: Duration,
}

impl NativeBackend {
    pub fn new(cfg: &BackendConfig) -> Self {
        Self {
            interpreter: cfg.interpreter.clone(),
            interpreter_args: cfg.interpreter_args.clone(),
            liveness_poll: Duration::from_millis(cfg.liveness_poll_ms.max(10)),
        }
    }

    fn pid_of(handle_ref: &HandleRef) -> Result<u32, BackendError> {
        match handle_ref {
            HandleRef::Native { pid } => Ok(*pid),
            other => Err(BackendError::ForeignHandle(other.to_string())),
        }
    }
}

#[async_trait]
impl ExecutionBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn spawn(&self, working_dir: &Path, entry_file: &Path) -> Result<Handle, BackendError> {
        let file_name = entry_file_name(entry_file)?;
        if !entry_file.is_file() {
            return Err(BackendError::SpawnFailed(format!(
                "entry file not found: {}",
                entry_file.display()
            )));
        }

        let mut cmd = TokioCommand::new(&self.interpreter);
        cmd.args(&self.interpreter_args)
            .arg(file_name)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        // Own process group so termination also reaches grandchildren
        #[cfg(unix)]
        cmd.process_group(0);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::SpawnFailed(format!("failed to spawn '{}': {}", self.interpreter, e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| BackendError::SpawnFailed("failed to get PID of spawned process".into()))?;

        let mut streams = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            streams.push(OutputStream::new(LogSource::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.push(OutputStream::new(LogSource::Stderr, stderr));
        }

        // ── process waiter ───────────────────────────────────
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => Exit::from(status),
                Err(e) => {
                    tracing::warn!("Failed to wait for PID {}: {}", pid, e);
                    Exit::UNKNOWN
                }
            };
            tracing::debug!("PID {} exited with {}", pid, exit);
            let _ = exit_tx.send(Some(exit));
        });

        tracing::info!(
            "Spawned '{} {}' in {} (PID {})",
            self.interpreter,
            Path::new(file_name).display(),
            working_dir.display(),
            pid
        );
        Ok(Handle::new(HandleRef::Native { pid }, streams, exit_rx))
    }

    async fn terminate(&self, handle: &Handle, grace: Duration) -> Result<(), BackendError> {
        let pid = Self::pid_of(handle.reference())?;
        if handle.exit_status().is_some() {
            return Ok(());
        }

        tracing::info!("Sending TERM to PID {}", pid);
        send_signal(pid, false)?;
        if tokio::time::timeout(grace, handle.exited()).await.is_ok() {
            return Ok(());
        }

        tracing::warn!("PID {} still alive after {:?}, sending KILL", pid, grace);
        send_signal(pid, true)?;
        if tokio::time::timeout(KILL_SETTLE, handle.exited()).await.is_err() {
            return Err(BackendError::TerminationFailed {
                reference: handle.reference().to_string(),
                reason: "process did not exit after KILL".into(),
            });
        }
        Ok(())
    }

    async fn is_alive(&self, handle_ref: &HandleRef) -> bool {
        match handle_ref {
            HandleRef::Native { pid } => process_monitor::is_running_async(*pid).await,
            HandleRef::Container { .. } => false,
        }
    }

    async fn attach(&self, handle_ref: &HandleRef) -> Option<Handle> {
        let pid = Self::pid_of(handle_ref).ok()?;
        if !process_monitor::is_running_async(pid).await {
            return None;
        }

        // Not our child anymore: stdio is gone and the exit code is unobservable,
        // so liveness is polled until the process disappears.
        let (exit_tx, exit_rx) = watch::channel(None);
        let poll = self.liveness_poll;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                if exit_tx.is_closed() || !process_monitor::is_running_async(pid).await {
                    break;
                }
            }
            let _ = exit_tx.send(Some(Exit::UNKNOWN));
        });

        tracing::info!("Re-attached to PID {}", pid);
        Some(Handle::new(handle_ref.clone(), Vec::new(), exit_rx))
    }

    async fn kill_orphan(&self, handle_ref: &HandleRef) -> Result<(), BackendError> {
        let pid = Self::pid_of(handle_ref)?;
        if process_monitor::is_running_async(pid).await {
            tracing::warn!("Killing orphaned PID {}", pid);
            send_signal(pid, true)?;
        }
        Ok(())
    }
}

/// Signal the process group led by `pid`, falling back to the single process
/// when no such group exists. A process that is already gone is not an error.
#[cfg(not(target_os = "windows"))]
fn send_signal(pid: u32, force: bool) -> Result<(), BackendError> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let target = Pid::from_raw(pid as i32);
    let result = match signal::killpg(target, sig) {
        Err(Errno::ESRCH) => signal::kill(target, sig),
        other => other,
    };
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(BackendError::TerminationFailed {
            reference: HandleRef::Native { pid }.to_string(),
            reason: format!("failed to send {}: {}", sig, e),
        }),
    }
}

#[cfg(target_os = "windows")]
fn send_signal(pid: u32, force: bool) -> Result<(), BackendError> {
    let mut cmd = std::process::Command::new("taskkill");
    if force {
        cmd.arg("/F");
    }
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd.args(["/T", "/PID", &pid.to_string()])
        .output()
        .map_err(|e| BackendError::TerminationFailed {
            reference: HandleRef::Native { pid }.to_string(),
            reason: e.to_string(),
        })?;
    Ok(())
}
