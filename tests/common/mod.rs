//! Shared setup for the supervisor integration tests.
//!
//! Jobs are plain `sh` scripts so the tests need nothing beyond a POSIX shell.

#![allow(dead_code)]

use codehost::backend;
use codehost::config::GlobalConfig;
use codehost::store::{Job, JobId, JobStore};
use codehost::supervisor::Supervisor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Harness {
    pub tmp: TempDir,
    pub config: GlobalConfig,
    pub store: Arc<JobStore>,
    pub sup: Supervisor,
}

pub fn test_config(root: &Path) -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.data_dir = root.join("data");
    config.projects_dir = root.join("projects");
    config.backend.interpreter = "sh".into();
    config.backend.liveness_poll_ms = 50;
    config.supervisor.grace_period_ms = 500;
    config.supervisor.restart_backoff_ms = 200;
    config.dependencies.install_on_start = false;
    config
}

pub fn harness(max_concurrent: usize) -> Harness {
    harness_with(|c| c.supervisor.max_concurrent = max_concurrent)
}

pub fn harness_with(adjust: impl FnOnce(&mut GlobalConfig)) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    adjust(&mut config);
    let store = Arc::new(JobStore::open(config.db_path()).unwrap());
    let sup = Supervisor::new(&config, store.clone(), backend::from_config(&config.backend));
    Harness { tmp, config, store, sup }
}

impl Harness {
    /// A second supervisor over the same store, as after a daemon restart.
    pub fn restarted(&self, adjust: impl FnOnce(&mut GlobalConfig)) -> Supervisor {
        let mut config = self.config.clone();
        adjust(&mut config);
        Supervisor::new(&config, self.store.clone(), backend::from_config(&config.backend))
    }
}

/// Create a job for `owner` and install `body` as its script.
pub async fn job_with_script(sup: &Supervisor, owner: i64, name: &str, body: &str) -> Job {
    sup.create_job(owner, name, None).unwrap();
    sup.submit_script(owner, name, body.as_bytes(), "main.sh").await.unwrap();
    sup.store().find_by_name(owner, name).unwrap().unwrap()
}

/// Poll `check` every 25ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Wait until the job log contains `needle`; returns the full log either way.
pub async fn wait_for_log(store: &JobStore, id: JobId, needle: &str, timeout: Duration) -> String {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let log = store.log_buffer(id).unwrap_or_default();
        if log.contains(needle) || tokio::time::Instant::now() >= deadline {
            return log;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn is_running_in_store(store: &JobStore, id: JobId) -> bool {
    store.get(id).unwrap().map(|j| j.running).unwrap_or(false)
}
