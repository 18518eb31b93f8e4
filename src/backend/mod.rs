//! Execution backends: where job processes actually run.
//!
//! A backend starts a script inside a working directory and hands back a
//! [`Handle`] that carries:
//! - the persistable [`HandleRef`] (native PID or container id)
//! - the stdout/stderr [`OutputStream`]s, which can be taken exactly once
//! - an exit watch that resolves when the execution ends
//!
//! Two realizations exist: [`native::NativeBackend`] (plain child processes)
//! and [`docker::DockerBackend`] (one container per run). The supervisor picks
//! one at configuration time and never mixes them within a job's lifetime.

pub mod docker;
pub mod native;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;

use crate::config::{BackendConfig, BackendKind};

// ─── Errors ──────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("failed to terminate {reference}: {reason}")]
    TerminationFailed { reference: String, reason: String },

    #[error("handle {0} does not belong to this backend")]
    ForeignHandle(String),

    #[error("backend command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─── Handle reference ────────────────────────────────────────

/// Persistable reference to a live execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandleRef {
    Native { pid: u32 },
    Container { id: String },
}

impl fmt::Display for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native { pid } => write!(f, "native:{}", pid),
            Self::Container { id } => write!(f, "container:{}", id),
        }
    }
}

impl FromStr for HandleRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("native", pid)) => pid
                .parse()
                .map(|pid| Self::Native { pid })
                .map_err(|e| format!("invalid pid in '{}': {}", s, e)),
            Some(("container", id)) if !id.is_empty() => Ok(Self::Container { id: id.to_string() }),
            _ => Err(format!("unrecognized handle reference '{}'", s)),
        }
    }
}

impl Serialize for HandleRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ─── Exit status ─────────────────────────────────────────────

/// How an execution ended. `code` is negative for signal deaths and `None`
/// when it could not be observed (e.g. a re-attached process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Exit {
    pub code: Option<i32>,
}

impl Exit {
    pub const UNKNOWN: Exit = Exit { code: None };

    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for Exit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::with_code(-signal);
            }
        }
        Self { code: status.code() }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code {}", code),
            None => write!(f, "unknown code"),
        }
    }
}

// ─── Output streams ──────────────────────────────────────────

/// Where a log line came from.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages from the supervisor itself
    System,
}

impl LogSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::System => "SYSTEM",
        }
    }
}

/// One output stream of an execution, read line by line.
///
/// Invalid UTF-8 is replaced rather than treated as a read error.
pub struct OutputStream {
    source: LogSource,
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    buf: Vec<u8>,
}

impl OutputStream {
    pub fn new<R>(source: LogSource, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            source,
            reader: BufReader::new(Box::new(reader)),
            buf: Vec::with_capacity(256),
        }
    }

    pub fn source(&self) -> LogSource {
        self.source
    }

    /// Next line without its terminator; `None` once the stream is closed.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }
}

// ─── Handle ──────────────────────────────────────────────────

/// A live execution. Cheap to clone; all clones observe the same exit.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    reference: HandleRef,
    streams: Mutex<Vec<OutputStream>>,
    exit_rx: watch::Receiver<Option<Exit>>,
}

impl Handle {
    pub fn new(
        reference: HandleRef,
        streams: Vec<OutputStream>,
        exit_rx: watch::Receiver<Option<Exit>>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                reference,
                streams: Mutex::new(streams),
                exit_rx,
            }),
        }
    }

    pub fn reference(&self) -> &HandleRef {
        &self.inner.reference
    }

    /// Take the output streams. Later calls get nothing.
    pub fn take_streams(&self) -> Vec<OutputStream> {
        let mut streams = self
            .inner
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *streams)
    }

    /// Exit status if the execution already ended.
    pub fn exit_status(&self) -> Option<Exit> {
        *self.inner.exit_rx.borrow()
    }

    /// Wait until the execution ends.
    pub async fn exited(&self) -> Exit {
        let mut rx = self.inner.exit_rx.clone();
        let observed = rx.wait_for(Option::is_some).await.map(|v| *v);
        match observed {
            Ok(Some(exit)) => exit,
            // Sender dropped without reporting: the watcher task is gone.
            _ => (*rx.borrow()).unwrap_or(Exit::UNKNOWN),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("reference", &self.inner.reference)
            .field("exit", &self.exit_status())
            .finish()
    }
}

// ─── Backend contract ────────────────────────────────────────

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start `entry_file` inside `working_dir`.
    async fn spawn(&self, working_dir: &Path, entry_file: &Path) -> Result<Handle, BackendError>;

    /// Output streams of a handle (stdout, stderr). Not restartable.
    fn stream_output(&self, handle: &Handle) -> Vec<OutputStream> {
        handle.take_streams()
    }

    /// Suspend until the execution exits.
    async fn wait(&self, handle: &Handle) -> Exit {
        handle.exited().await
    }

    /// Graceful stop, escalating to a forced kill after `grace`.
    async fn terminate(&self, handle: &Handle, grace: Duration) -> Result<(), BackendError>;

    /// Whether a persisted reference still names a live execution.
    async fn is_alive(&self, handle_ref: &HandleRef) -> bool;

    /// Resume monitoring an execution started by a previous supervisor run.
    async fn attach(&self, handle_ref: &HandleRef) -> Option<Handle>;

    /// Forcefully dispose of an execution nobody monitors anymore.
    async fn kill_orphan(&self, handle_ref: &HandleRef) -> Result<(), BackendError>;
}

/// Build the configured backend.
pub fn from_config(cfg: &BackendConfig) -> Arc<dyn ExecutionBackend> {
    match cfg.kind {
        BackendKind::Native => Arc::new(native::NativeBackend::new(cfg)),
        BackendKind::Docker => Arc::new(docker::DockerBackend::new(cfg)),
    }
}

/// File name of an entry path, as passed to the interpreter.
pub(crate) fn entry_file_name(entry_file: &Path) -> Result<&std::ffi::OsStr, BackendError> {
    entry_file
        .file_name()
        .ok_or_else(|| BackendError::SpawnFailed(format!("invalid entry path {}", entry_file.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ref_display_parse() {
        let native = HandleRef::Native { pid: 4242 };
        assert_eq!(native.to_string(), "native:4242");
        assert_eq!("native:4242".parse::<HandleRef>().unwrap(), native);

        let container = HandleRef::Container { id: "abc123".into() };
        assert_eq!(container.to_string(), "container:abc123");
        assert_eq!("container:abc123".parse::<HandleRef>().unwrap(), container);
    }

    #[test]
    fn test_handle_ref_rejects_garbage() {
        assert!("native:notapid".parse::<HandleRef>().is_err());
        assert!("container:".parse::<HandleRef>().is_err());
        assert!("vm:1".parse::<HandleRef>().is_err());
        assert!("1234".parse::<HandleRef>().is_err());
    }

    #[test]
    fn test_exit_success() {
        assert!(Exit::with_code(0).is_success());
        assert!(!Exit::with_code(1).is_success());
        assert!(!Exit::UNKNOWN.is_success());
        assert_eq!(Exit::with_code(3).to_string(), "code 3");
    }

    #[tokio::test]
    async fn test_output_stream_lines() {
        let data: &[u8] = b"first\r\nsecond\n\xffbad\nlast";
        let mut stream = OutputStream::new(LogSource::Stdout, data);
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("\u{fffd}bad"));
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(stream.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_handle_streams_taken_once() {
        let (_tx, rx) = watch::channel(None);
        let data: &[u8] = b"x\n";
        let handle = Handle::new(
            HandleRef::Native { pid: 1 },
            vec![OutputStream::new(LogSource::Stdout, data)],
            rx,
        );
        assert_eq!(handle.take_streams().len(), 1);
        assert!(handle.take_streams().is_empty());
    }

    #[tokio::test]
    async fn test_handle_exited_resolves() {
        let (tx, rx) = watch::channel(None);
        let handle = Handle::new(HandleRef::Native { pid: 1 }, Vec::new(), rx);
        assert!(handle.exit_status().is_none());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.exited().await })
        };
        tx.send(Some(Exit::with_code(7))).unwrap();
        assert_eq!(waiter.await.unwrap(), Exit::with_code(7));
        assert_eq!(handle.exit_status(), Some(Exit::with_code(7)));
    }

    #[tokio::test]
    async fn test_handle_exited_when_sender_dropped() {
        let (tx, rx) = watch::channel(None);
        let handle = Handle::new(HandleRef::Native { pid: 1 }, Vec::new(), rx);
        drop(tx);
        assert_eq!(handle.exited().await, Exit::UNKNOWN);
    }
}
