//! Startup reconciliation of jobs persisted as running.
//!
//! A previous supervisor run may have died with executions still alive, or
//! shut down leaving their records marked running. Each such job is either
//! re-attached, respawned or marked stopped, and every job that ends up
//! running holds exactly one slot. Jobs already tracked are skipped, so
//! running recovery twice changes nothing.

use serde::Serialize;

use super::{JobState, StartCause, Supervisor, SupervisorError};
use crate::config::RecoveryPolicy;
use crate::store::{Job, JobId, JobUpdate};

#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    pub reattached: Vec<JobId>,
    pub respawned: Vec<JobId>,
    pub stopped: Vec<JobId>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.reattached.len() + self.respawned.len() + self.stopped.len()
    }
}

enum Recovered {
    Reattached,
    Respawned,
    Stopped,
}

impl Supervisor {
    pub async fn recover(&self) -> Result<RecoveryReport, SupervisorError> {
        let jobs = self.inner.store.running_jobs()?;
        let policy = self.inner.config.recovery_policy;
        tracing::info!("Recovering {} job(s) marked running ({:?})", jobs.len(), policy);

        let mut report = RecoveryReport::default();
        for job in jobs {
            let _guard = self.lock_job(job.id).await;
            if self.inner.tracker.state(job.id)? != JobState::Stopped {
                continue;
            }
            match self.recover_job(&job, policy).await {
                Recovered::Reattached => report.reattached.push(job.id),
                Recovered::Respawned => report.respawned.push(job.id),
                Recovered::Stopped => report.stopped.push(job.id),
            }
        }

        tracing::info!(
            "Recovery done: {} re-attached, {} respawned, {} stopped",
            report.reattached.len(),
            report.respawned.len(),
            report.stopped.len()
        );
        Ok(report)
    }

    async fn recover_job(&self, job: &Job, policy: RecoveryPolicy) -> Recovered {
        let entry = match &job.entry_path {
            Some(path) if path.is_file() => path.clone(),
            _ => {
                self.dispose_orphan(job).await;
                self.mark_stopped(job, "Not restored: entry script is missing").await;
                return Recovered::Stopped;
            }
        };

        if !self.inner.admission.try_reserve() {
            self.dispose_orphan(job).await;
            self.mark_stopped(job, "Not restored: all execution slots are in use").await;
            return Recovered::Stopped;
        }

        match policy {
            RecoveryPolicy::Reattach => {
                if self.reattach(job).await {
                    return Recovered::Reattached;
                }
            }
            RecoveryPolicy::Respawn => self.dispose_orphan(job).await,
        }

        if !job.auto_restart {
            self.inner.admission.release();
            self.mark_stopped(job, "Not restored: process is gone and auto-restart is off")
                .await;
            return Recovered::Stopped;
        }

        match self.launch(job, &entry, StartCause::Recovery).await {
            Ok(()) => Recovered::Respawned,
            Err(e) => {
                self.inner.admission.release();
                self.mark_stopped(job, &format!("Not restored: {}", e)).await;
                Recovered::Stopped
            }
        }
    }

    /// Resume monitoring a still-alive execution. The caller holds a slot.
    async fn reattach(&self, job: &Job) -> bool {
        let Some(reference) = &job.backend_handle else {
            return false;
        };
        let Some(handle) = self.inner.backend.attach(reference).await else {
            tracing::info!("Job {}: {} is gone", job.id, reference);
            return false;
        };

        if let Err(e) = self.inner.tracker.begin_start(job.id) {
            tracing::error!("Job {}: {}", job.id, e);
            return false;
        }
        match self.monitor(job, handle) {
            Ok(_) => {
                self.log_system(job.id, &format!("Re-attached to {}", reference)).await;
                tracing::info!("Job {} ({}) re-attached to {}", job.id, job.name, reference);
                true
            }
            Err(e) => {
                tracing::error!("Job {}: re-attach failed: {}", job.id, e);
                let _ = self.inner.tracker.abort_start(job.id);
                false
            }
        }
    }

    /// Kill a persisted execution nobody will monitor.
    async fn dispose_orphan(&self, job: &Job) {
        let Some(reference) = &job.backend_handle else {
            return;
        };
        if !self.inner.backend.is_alive(reference).await {
            return;
        }
        if let Err(e) = self.inner.backend.kill_orphan(reference).await {
            tracing::warn!("Job {}: failed to kill orphan {}: {}", job.id, reference, e);
        }
    }

    async fn mark_stopped(&self, job: &Job, diagnostic: &str) {
        tracing::warn!("Job {} ({}): {}", job.id, job.name, diagnostic);
        if let Err(e) = self.inner.store.update(job.id, &JobUpdate::stopped()) {
            tracing::error!("Job {}: {}", job.id, e);
        }
        self.log_system(job.id, diagnostic).await;
    }
}
