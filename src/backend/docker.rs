//! Docker backend - each run is one detached container.
//!
//! The job workspace is bind-mounted at `/workspace` and the entry file is run
//! by the configured interpreter inside the configured image. Output comes from
//! a `docker logs -f` follower process (container stdout/stderr stay
//! separated), the exit code from `docker wait`. Finished containers are
//! removed by the watcher task.

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

const CONTAINER_WORKDIR: &str = "/workspace";
const MANAGED_LABEL: &str = "codehost.managed=true";

/// How long the log follower may keep flushing after the container exits.
const FOLLOWER_DRAIN: Duration = Duration::from_secs(5);

pub struct DockerBackend {
    binary: String,
    image: String,
    interpreter: String,
    interpreter_args: Vec<String>,
}

impl DockerBackend {
    pub fn new(cfg: &BackendConfig) -> Self {
        Self {
            binary: cfg.docker_binary.clone(),
            image: cfg.docker_image.clone(),
            interpreter: cfg.interpreter.clone(),
            interpreter_args: cfg.interpreter_args.clone(),
        }
    }

    fn container_of(handle_ref: &HandleRef) -> Result<&str, BackendError> {
        match handle_ref {
            HandleRef::Container { id } => Ok(id),
            other => Err(BackendError::ForeignHandle(other.to_string())),
        }
    }

    /// Arguments for `docker run` of `file_name` from `host_dir`.
    fn run_args(&self, host_dir: &Path, file_name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--label".to_string(),
            MANAGED_LABEL.to_string(),
            "-v".to_string(),
            format!("{}:{}", host_dir.display(), CONTAINER_WORKDIR),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
            self.image.clone(),
            self.interpreter.clone(),
        ];
        args.extend(self.interpreter_args.iter().cloned());
        args.push(file_name.to_string());
        args
    }

    /// Start `docker logs -f` for a container and the watcher that reports its exit.
    fn follow(&self, id: &str, tail: Option<&str>) -> Result<Handle, BackendError> {
        let mut cmd = docker_command(&self.binary);
        cmd.arg("logs").arg("-f");
        if let Some(tail) = tail {
            cmd.arg("--tail").arg(tail);
        }
        cmd.arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut follower = cmd
            .spawn()
            .map_err(|e| BackendError::Command(format!("failed to follow logs of {}: {}", id, e)))?;

        let mut streams = Vec::with_capacity(2);
        if let Some(stdout) = follower.stdout.take() {
            streams.push(OutputStream::new(LogSource::Stdout, stdout));
        }
        if let Some(stderr) = follower.stderr.take() {
            streams.push(OutputStream::new(LogSource::Stderr, stderr));
        }

        // ── container waiter ──
        let (exit_tx, exit_rx) = watch::channel(None);
        let binary = self.binary.clone();
        let container = id.to_string();
        tokio::spawn(async move {
            let exit = wait_container(&binary, &container).await;
            if tokio::time::timeout(FOLLOWER_DRAIN, follower.wait()).await.is_err() {
                let _ = follower.kill().await;
            }
            if let Err(e) = run_docker(&binary, &["rm", "-f", &container]).await {
                tracing::warn!("Failed to remove container {}: {}", container, e);
            }
            tracing::debug!("Container {} exited with {}", container, exit);
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Handle::new(
            HandleRef::Container { id: id.to_string() },
            streams,
            exit_rx,
        ))
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn spawn(&self, working_dir: &Path, entry_file: &Path) -> Result<Handle, BackendError> {
        let file_name = entry_file_name(entry_file)?.to_string_lossy().to_string();
        if !entry_file.is_file() {
            return Err(BackendError::SpawnFailed(format!(
                "entry file not found: {}",
                entry_file.display()
            )));
        }
        // bind mount는 절대 경로가 필요
        let host_dir = std::fs::canonicalize(working_dir).map_err(|e| {
            BackendError::SpawnFailed(format!("invalid working dir {}: {}", working_dir.display(), e))
        })?;

        let args = self.run_args(&host_dir, &file_name);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = run_docker(&self.binary, &arg_refs)
            .await
            .map_err(|e| BackendError::SpawnFailed(e.to_string()))?;
        if id.is_empty() {
            return Err(BackendError::SpawnFailed("docker run returned no container id".into()));
        }

        tracing::info!("Started container {} for {} ({})", id, file_name, host_dir.display());
        match self.follow(&id, None) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let _ = run_docker(&self.binary, &["rm", "-f", &id]).await;
                Err(BackendError::SpawnFailed(e.to_string()))
            }
        }
    }

    async fn terminate(&self, handle: &Handle, grace: Duration) -> Result<(), BackendError> {
        let id = Self::container_of(handle.reference())?;
        if handle.exit_status().is_some() {
            return Ok(());
        }

        // docker stop: SIGTERM, then SIGKILL after -t seconds
        let secs = grace.as_secs().to_string();
        tracing::info!("Stopping container {} (grace {}s)", id, secs);
        run_docker(&self.binary, &["stop", "-t", &secs, id])
            .await
            .map_err(|e| BackendError::TerminationFailed {
                reference: handle.reference().to_string(),
                reason: e.to_string(),
            })?;

        if tokio::time::timeout(grace + FOLLOWER_DRAIN * 2, handle.exited()).await.is_err() {
            return Err(BackendError::TerminationFailed {
                reference: handle.reference().to_string(),
                reason: "container watcher did not report exit".into(),
            });
        }
        Ok(())
    }

    async fn is_alive(&self, handle_ref: &HandleRef) -> bool {
        let Ok(id) = Self::container_of(handle_ref) else {
            return false;
        };
        match run_docker(&self.binary, &["inspect", "-f", "{{.State.Running}}", id]).await {
            Ok(state) => state == "true",
            Err(_) => false,
        }
    }

    async fn attach(&self, handle_ref: &HandleRef) -> Option<Handle> {
        let id = Self::container_of(handle_ref).ok()?;
        if !self.is_alive(handle_ref).await {
            return None;
        }
        // Only new output; earlier lines are already in the job log.
        match self.follow(id, Some("0")) {
            Ok(handle) => {
                tracing::info!("Re-attached to container {}", id);
                Some(handle)
            }
            Err(e) => {
                tracing::warn!("Failed to re-attach to container {}: {}", id, e);
                None
            }
        }
    }

    async fn kill_orphan(&self, handle_ref: &HandleRef) -> Result<(), BackendError> {
        let id = Self::container_of(handle_ref)?;
        tracing::warn!("Removing orphaned container {}", id);
        run_docker(&self.binary, &["rm", "-f", id]).await.map(|_| ())
    }
}

fn docker_command(binary: &str) -> TokioCommand {
    let mut cmd = TokioCommand::new(binary);
    crate::utils::apply_creation_flags(&mut cmd);
    cmd
}

/// Run a docker CLI command to completion; trimmed stdout on success.
async fn run_docker(binary: &str, args: &[&str]) -> Result<String, BackendError> {
    let output = docker_command(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BackendError::Command(format!("{} {}: {}", binary, args.join(" "), e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(BackendError::Command(format!(
            "{} {} failed: {}",
            binary,
            args.first().copied().unwrap_or_default(),
            if stderr.is_empty() { stdout } else { stderr }
        )))
    }
}

async fn wait_container(binary: &str, id: &str) -> Exit {
    match run_docker(binary, &["wait", id]).await {
        Ok(code) => code.parse::<i32>().map(Exit::with_code).unwrap_or(Exit::UNKNOWN),
        Err(e) => {
            tracing::warn!("docker wait {} failed: {}", id, e);
            Exit::UNKNOWN
        }
    }
}
