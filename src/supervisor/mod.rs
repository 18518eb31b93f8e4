//! Supervisor core: owns every job execution.
//!
//! All changes to a job's `running` flag and backend handle happen while the
//! job's own async lock is held, so start/stop/exit handling for one job are
//! strictly ordered while different jobs proceed independently. Slots are
//! always reserved before anything is spawned and released exactly once when
//! the execution is gone.

pub mod admission;
pub mod error;
pub mod log_ring;
pub mod recovery;
pub mod requests;
pub mod state_machine;
pub mod tracker;

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio::task::{JoinHandle, JoinSet};

use crate::backend::{ExecutionBackend, Handle, LogSource, OutputStream};
use crate::config::{GlobalConfig, SupervisorConfig};
use crate::deps::DependencyInstaller;
use crate::store::{Job, JobId, JobStore, JobUpdate, OwnerId, StoreCounts, StoreError};
use crate::workspace::Workspace;
use admission::AdmissionController;
use log_ring::LogRing;
use tracker::{JobTracker, TrackerError};

pub use error::SupervisorError;
pub use recovery::RecoveryReport;
pub use state_machine::JobState;

/// How long an exit watcher waits for the drain tasks to flush.
const DRAIN_SETTLE: Duration = Duration::from_secs(2);
const EVENT_CAPACITY: usize = 256;

// ─── Public types ────────────────────────────────────────────

/// Asynchronous notification for the owner of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub owner: OwnerId,
    pub name: String,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEventKind {
    Exited { code: Option<i32> },
    Restarted,
    RestartDenied { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    User,
    ReplaceEntry,
    Delete,
    Reaped,
    Shutdown,
}

impl StopReason {
    fn log_message(&self) -> &'static str {
        match self {
            Self::User => "Stopped by user",
            Self::ReplaceEntry => "Stopped to install a new script",
            Self::Delete => "Stopped for deletion",
            Self::Reaped => "Stopped: owner inactive",
            Self::Shutdown => "Stopped: supervisor shutting down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartCause {
    Request,
    Restart,
    Recovery,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    #[serde(flatten)]
    pub job: Job,
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub owners: u64,
    pub jobs: u64,
    pub running_jobs: u64,
    pub slots_in_use: usize,
    pub slot_limit: usize,
}

// ─── Supervisor ──────────────────────────────────────────────

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    install_on_start: bool,
    store: Arc<JobStore>,
    backend: Arc<dyn ExecutionBackend>,
    admission: AdmissionController,
    logs: LogRing,
    tracker: JobTracker,
    locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
    installer: DependencyInstaller,
    workspace: Workspace,
    events: broadcast::Sender<JobEvent>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(config: &GlobalConfig, store: Arc<JobStore>, backend: Arc<dyn ExecutionBackend>) -> Self {
        let sup = &config.supervisor;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        tracing::info!(
            "Supervisor ready: {:?} backend, {} slots",
            backend.kind(),
            sup.max_concurrent
        );
        Self {
            inner: Arc::new(Inner {
                config: sup.clone(),
                install_on_start: config.dependencies.install_on_start,
                logs: LogRing::new(store.clone(), sup.log_cap_chars),
                store,
                backend,
                admission: AdmissionController::new(sup.max_concurrent),
                tracker: JobTracker::new(),
                locks: Mutex::new(HashMap::new()),
                installer: DependencyInstaller::new(&config.dependencies),
                workspace: Workspace::new(config.projects_dir.clone(), sup),
                events,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    pub fn workspace(&self) -> &Workspace {
        &self.inner.workspace
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether a live execution of the job is being monitored.
    pub fn is_tracked(&self, id: JobId) -> bool {
        matches!(self.inner.tracker.handle(id), Ok(Some(_)))
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.admission.in_use()
    }

    async fn lock_job(&self, id: JobId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn forget_lock(&self, id: JobId) {
        let mut locks = self.inner.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(&id);
    }

    fn load(&self, id: JobId) -> Result<Job, SupervisorError> {
        self.inner
            .store
            .get(id)?
            .ok_or_else(|| SupervisorError::NotFound(format!("#{}", id)))
    }

    fn job_dir(&self, job: &Job) -> PathBuf {
        self.inner.workspace.job_dir(job.owner, job.id, &job.safe_name)
    }

    async fn log_system(&self, id: JobId, message: &str) {
        if let Err(e) = self.inner.logs.append_line(id, LogSource::System, message).await {
            tracing::warn!("Job {}: failed to write log line: {}", id, e);
        }
    }

    fn notify(&self, job: &Job, kind: JobEventKind) {
        // no subscribers is fine
        let _ = self.inner.events.send(JobEvent {
            job_id: job.id,
            owner: job.owner,
            name: job.name.clone(),
            kind,
        });
    }

    // ── Registry ────────────────────────────────────────────

    pub fn job(&self, id: JobId) -> Result<Job, SupervisorError> {
        self.load(id)
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus, SupervisorError> {
        let job = self.load(id)?;
        let state = self.inner.tracker.state(id)?;
        Ok(JobStatus { job, state })
    }

    pub fn stats(&self) -> Result<SupervisorStats, SupervisorError> {
        let StoreCounts { owners, jobs, running } = self.inner.store.counts()?;
        Ok(SupervisorStats {
            owners,
            jobs,
            running_jobs: running,
            slots_in_use: self.inner.admission.in_use(),
            slot_limit: self.inner.admission.limit(),
        })
    }

    // ── Start ───────────────────────────────────────────────

    /// Start a stopped job. Returns once the execution is spawned and monitored.
    pub async fn start(&self, id: JobId) -> Result<(), SupervisorError> {
        let _guard = self.lock_job(id).await;
        self.start_locked(id, StartCause::Request).await
    }

    async fn start_locked(&self, id: JobId, cause: StartCause) -> Result<(), SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let job = self.load(id)?;
        if self.inner.tracker.state(id)? != JobState::Stopped {
            return Err(SupervisorError::AlreadyRunning(job.name));
        }
        let entry = match &job.entry_path {
            Some(path) if path.is_file() => path.clone(),
            _ => return Err(SupervisorError::MissingEntry(job.name)),
        };
        if !self.inner.admission.try_reserve() {
            tracing::warn!("Job {} ({}): no free slot", id, job.name);
            return Err(SupervisorError::CapacityExceeded {
                limit: self.inner.admission.limit(),
            });
        }

        let result = self.launch(&job, &entry, cause).await;
        if result.is_err() {
            self.inner.admission.release();
        }
        result
    }

    /// Spawn and monitor `job`. The caller holds the job lock and one slot,
    /// and releases the slot if this fails.
    async fn launch(&self, job: &Job, entry: &Path, cause: StartCause) -> Result<(), SupervisorError> {
        self.inner.tracker.begin_start(job.id).map_err(|e| match e {
            TrackerError::Busy { .. } => SupervisorError::AlreadyRunning(job.name.clone()),
            other => other.into(),
        })?;
        let result = self.spawn_monitored(job, entry, cause).await;
        if result.is_err() {
            if let Err(e) = self.inner.tracker.abort_start(job.id) {
                tracing::error!("Job {}: {}", job.id, e);
            }
        }
        result
    }

    async fn spawn_monitored(&self, job: &Job, entry: &Path, cause: StartCause) -> Result<(), SupervisorError> {
        let job_dir = self.job_dir(job);
        let working_dir = entry.parent().unwrap_or(&job_dir);
        let file_name = entry
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if self.inner.install_on_start && !job.dependencies.is_empty() {
            if let Err(e) = self.inner.installer.install(working_dir, &job.dependencies).await {
                self.log_system(job.id, &format!("Dependency installation failed: {}", e)).await;
                return Err(e.into());
            }
        }

        let handle = match self.inner.backend.spawn(working_dir, entry).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Job {} ({}): spawn failed: {}", job.id, job.name, e);
                self.log_system(job.id, &format!("Failed to start {}: {}", file_name, e)).await;
                return Err(SupervisorError::SpawnFailed {
                    job: job.name.clone(),
                    reason: e.to_string(),
                });
            }
        };

        if let Err(e) = self.inner.store.update(job.id, &JobUpdate::started(handle.reference().clone())) {
            self.discard(&handle).await;
            return Err(e.into());
        }

        let line = match cause {
            StartCause::Request => format!("Started: {}", file_name),
            StartCause::Restart => format!("Restarted: {}", file_name),
            StartCause::Recovery => format!("Restarted after supervisor restart: {}", file_name),
        };
        self.log_system(job.id, &line).await;
        tracing::info!("Job {} ({}) running as {}", job.id, job.name, handle.reference());

        if let Err(e) = self.monitor(job, handle.clone()) {
            self.discard(&handle).await;
            if let Err(se) = self.inner.store.update(job.id, &JobUpdate::stopped()) {
                tracing::error!("Job {}: {}", job.id, se);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Terminate an execution that could not be put under supervision.
    async fn discard(&self, handle: &Handle) {
        if let Err(e) = self
            .inner
            .backend
            .terminate(handle, self.inner.config.grace_period())
            .await
        {
            tracing::error!("Failed to discard {}: {}", handle.reference(), e);
        }
    }

    /// Track `handle` as the job's execution and start its drain and exit tasks.
    fn monitor(&self, job: &Job, handle: Handle) -> Result<u64, SupervisorError> {
        let generation = self.inner.tracker.attach(job.id, handle.clone())?;
        let drains = self
            .inner
            .backend
            .stream_output(&handle)
            .into_iter()
            .map(|stream| tokio::spawn(self.clone().drain(job.id, stream)))
            .collect();
        tokio::spawn(self.clone().watch_exit(job.id, generation, handle, drains));
        Ok(generation)
    }

    /// Copy one output stream into the job log until it closes.
    async fn drain(self, id: JobId, mut stream: OutputStream) {
        let source = stream.source();
        loop {
            match stream.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = self.inner.logs.append_line(id, source, &line).await {
                        tracing::warn!("Job {}: dropping {} output: {}", id, source.label(), e);
                        if matches!(e, StoreError::UnknownId(_)) {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Job {}: {} read error: {}", id, source.label(), e);
                    break;
                }
            }
        }
        tracing::debug!("Job {}: {} drain finished", id, source.label());
    }

    // ── Exit handling ───────────────────────────────────────

    /// Wait for the execution to end, record it and apply the restart policy.
    ///
    /// Boxed because a restart spawns the watcher of the next run.
    fn watch_exit(
        self,
        id: JobId,
        generation: u64,
        handle: Handle,
        drains: Vec<JoinHandle<()>>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(async move {
            let exit = self.inner.backend.wait(&handle).await;
            for drain in drains {
                let _ = tokio::time::timeout(DRAIN_SETTLE, drain).await;
            }

            let guard = self.lock_job(id).await;
            match self.inner.tracker.begin_exit(id, generation) {
                Ok(true) => {}
                // stopped on purpose or superseded by a newer run
                Ok(false) => return,
                Err(e) => {
                    tracing::error!("Job {}: {}", id, e);
                    return;
                }
            }

            self.inner.admission.release();
            if let Err(e) = self.inner.store.update(id, &JobUpdate::stopped()) {
                tracing::error!("Job {}: failed to persist exit: {}", id, e);
            }
            self.log_system(id, &format!("Process exited with {}", exit)).await;
            if let Err(e) = self.inner.tracker.finish(id) {
                tracing::error!("Job {}: {}", id, e);
            }

            let job = match self.inner.store.get(id) {
                Ok(Some(job)) => job,
                _ => return,
            };
            tracing::info!("Job {} ({}) exited with {}", id, job.name, exit);
            self.notify(&job, JobEventKind::Exited { code: exit.code });

            if !job.auto_restart || exit.is_success() || self.is_shutting_down() {
                return;
            }
            drop(guard);
            self.restart_after_backoff(id).await;
        })
    }

    async fn restart_after_backoff(&self, id: JobId) {
        let backoff = self.inner.config.restart_backoff();
        tracing::info!("Job {}: restarting in {:?}", id, backoff);
        tokio::time::sleep(backoff).await;

        let _guard = self.lock_job(id).await;
        if self.is_shutting_down() {
            return;
        }
        // deleted, disabled or started by hand during the backoff
        let job = match self.inner.store.get(id) {
            Ok(Some(job)) if job.auto_restart => job,
            _ => return,
        };
        if !matches!(self.inner.tracker.state(id), Ok(JobState::Stopped)) {
            return;
        }

        match self.start_locked(id, StartCause::Restart).await {
            Ok(()) => self.notify(&job, JobEventKind::Restarted),
            Err(e) => {
                let reason = match &e {
                    SupervisorError::CapacityExceeded { .. } => "no free execution slot".to_string(),
                    other => other.to_string(),
                };
                tracing::warn!("Job {} ({}): restart denied: {}", id, job.name, reason);
                self.log_system(id, &format!("Restart denied: {}", reason)).await;
                self.notify(&job, JobEventKind::RestartDenied { reason });
            }
        }
    }

    // ── Stop ────────────────────────────────────────────────

    /// Stop a job. Stopping a job that is not running succeeds with
    /// [`StopOutcome::NotRunning`].
    pub async fn stop(&self, id: JobId, reason: StopReason) -> Result<StopOutcome, SupervisorError> {
        let _guard = self.lock_job(id).await;
        self.stop_locked(id, reason).await
    }

    async fn stop_locked(&self, id: JobId, reason: StopReason) -> Result<StopOutcome, SupervisorError> {
        let job = self.load(id)?;
        let Some(handle) = self.inner.tracker.begin_stop(id)? else {
            if job.running && reason != StopReason::Shutdown {
                tracing::warn!("Job {}: clearing stale running flag", id);
                self.inner.store.update(id, &JobUpdate::stopped())?;
            }
            return Ok(StopOutcome::NotRunning);
        };

        tracing::info!("Stopping job {} ({}): {:?}", id, job.name, reason);
        if let Err(e) = self
            .inner
            .backend
            .terminate(&handle, self.inner.config.grace_period())
            .await
        {
            tracing::error!("Job {}: {}", id, e);
            self.log_system(id, &format!("Termination error: {}", e)).await;
        }

        self.inner.admission.release();
        // on shutdown the record keeps its running intent for recovery
        let persisted = if reason == StopReason::Shutdown {
            Ok(())
        } else {
            self.inner.store.update(id, &JobUpdate::stopped())
        };
        self.log_system(id, reason.log_message()).await;
        self.inner.tracker.finish(id)?;
        persisted?;
        Ok(StopOutcome::Stopped)
    }

    // ── Entry / settings ────────────────────────────────────

    /// Point the job at a new entry script, stopping it first if running.
    pub async fn install_entry(&self, id: JobId, path: PathBuf) -> Result<(), SupervisorError> {
        let _guard = self.lock_job(id).await;
        self.stop_locked(id, StopReason::ReplaceEntry).await?;
        self.commit_entry(id, path).await
    }

    /// Replace the job's workspace with a submitted file (script or `.zip`)
    /// and install the resulting entry. Returns the entry path.
    pub async fn replace_script(
        &self,
        id: JobId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, SupervisorError> {
        let _guard = self.lock_job(id).await;
        let job = self.load(id)?;
        self.stop_locked(id, StopReason::ReplaceEntry).await?;
        let entry = self.inner.workspace.place(&self.job_dir(&job), filename, bytes)?;
        self.commit_entry(id, entry.clone()).await?;
        Ok(entry)
    }

    async fn commit_entry(&self, id: JobId, path: PathBuf) -> Result<(), SupervisorError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.inner.store.update(id, &JobUpdate::entry(path))?;
        self.log_system(id, &format!("Script installed: {}", file_name)).await;
        tracing::info!("Job {}: entry set to {}", id, file_name);
        Ok(())
    }

    pub async fn set_auto_restart_for(&self, id: JobId, enabled: bool) -> Result<(), SupervisorError> {
        let _guard = self.lock_job(id).await;
        self.load(id)?;
        self.inner.store.update(id, &JobUpdate::auto_restart(enabled))?;
        let state = if enabled { "enabled" } else { "disabled" };
        self.log_system(id, &format!("Auto-restart {}", state)).await;
        Ok(())
    }

    /// Tail of the job log.
    pub async fn logs_for(&self, id: JobId) -> Result<String, SupervisorError> {
        self.load(id)?;
        Ok(self.inner.logs.read(id, self.inner.config.log_read_chars).await?)
    }

    /// Install one package for the job and record it on success.
    pub async fn add_dependency(&self, id: JobId, package: &str) -> Result<(), SupervisorError> {
        let package = package.trim();
        if package.is_empty() || package.starts_with('-') || package.contains(char::is_whitespace) {
            return Err(SupervisorError::InvalidRequest(format!(
                "invalid package name '{}'",
                package
            )));
        }
        let job = self.load(id)?;
        let dir = self.job_dir(&job);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!("Job {}: cannot create {}: {}", id, dir.display(), e);
        }

        // The install runs without the job lock so start/stop stay responsive.
        self.log_system(id, &format!("Installing {}...", package)).await;
        let packages = [package.to_string()];
        match self.inner.installer.install(&dir, &packages).await {
            Ok(output) => {
                if !output.is_empty() {
                    self.append_output(id, &output).await;
                }
            }
            Err(e) => {
                if let Some(output) = e.output() {
                    self.append_output(id, output).await;
                }
                self.log_system(id, &format!("Installation of {} failed: {}", package, e)).await;
                return Err(e.into());
            }
        }

        let _guard = self.lock_job(id).await;
        let job = self.load(id)?;
        if !job.dependencies.iter().any(|d| d == package) {
            let mut deps = job.dependencies;
            deps.push(package.to_string());
            self.inner.store.update(id, &JobUpdate::dependencies(deps))?;
        }
        self.log_system(id, &format!("Installed {}", package)).await;
        Ok(())
    }

    async fn append_output(&self, id: JobId, output: &str) {
        let mut text = output.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        if let Err(e) = self.inner.logs.append(id, &text).await {
            tracing::warn!("Job {}: failed to write installer output: {}", id, e);
        }
    }

    // ── Delete / shutdown ───────────────────────────────────

    /// Stop the job if needed, remove its workspace and its record.
    pub async fn delete(&self, id: JobId, reason: StopReason) -> Result<(), SupervisorError> {
        {
            let _guard = self.lock_job(id).await;
            let job = self.load(id)?;
            self.stop_locked(id, reason).await?;
            if let Err(e) = self.inner.workspace.remove_job_dir(&self.job_dir(&job)) {
                tracing::warn!("Job {}: failed to remove workspace: {}", id, e);
            }
            self.inner.store.delete(id)?;
            self.inner.logs.forget(id);
            tracing::info!("Job {} ({}) deleted", id, job.name);
        }
        self.forget_lock(id);
        Ok(())
    }

    /// Refuse new starts and terminate every live job. Records keep
    /// `running=true` so the next startup recovers them.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids = self.inner.tracker.live_ids().unwrap_or_default();
        tracing::info!("Supervisor shutting down, stopping {} job(s)", ids.len());

        let mut stops = JoinSet::new();
        for id in ids {
            let sup = self.clone();
            stops.spawn(async move {
                if let Err(e) = sup.stop(id, StopReason::Shutdown).await {
                    tracing::warn!("Job {}: stop during shutdown failed: {}", id, e);
                }
            });
        }
        while stops.join_next().await.is_some() {}
        tracing::info!("Supervisor shutdown complete");
    }
}
