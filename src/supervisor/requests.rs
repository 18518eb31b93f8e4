//! Owner-scoped operations used by the chat layer.
//!
//! Jobs are addressed by `(owner, name)`. Every call refreshes the owner's
//! activity timestamp, which is what inactivity reaping looks at.

use std::path::PathBuf;

use super::{JobStatus, StopOutcome, StopReason, Supervisor, SupervisorError};
use crate::store::{Job, OwnerId};
use crate::utils::safe_name;

impl Supervisor {
    fn resolve(&self, owner: OwnerId, name: &str) -> Result<Job, SupervisorError> {
        self.inner.store.touch_owner(owner, None)?;
        self.inner
            .store
            .find_by_name(owner, name)?
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    /// Register a new, stopped job.
    pub fn create_job(
        &self,
        owner: OwnerId,
        name: &str,
        username: Option<&str>,
    ) -> Result<Job, SupervisorError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SupervisorError::InvalidRequest("job name is empty".into()));
        }
        self.inner.store.touch_owner(owner, username)?;
        let job = self.inner.store.create_job(owner, name, &safe_name(name))?;
        tracing::info!("Owner {} created job {} ({})", owner, job.id, job.name);
        Ok(job)
    }

    pub fn list_jobs(&self, owner: OwnerId) -> Result<Vec<JobStatus>, SupervisorError> {
        self.inner.store.touch_owner(owner, None)?;
        self.inner
            .store
            .list_by_owner(owner)?
            .into_iter()
            .map(|job| {
                let state = self.inner.tracker.state(job.id)?;
                Ok::<_, SupervisorError>(JobStatus { job, state })
            })
            .collect()
    }

    pub fn job_status(&self, owner: OwnerId, name: &str) -> Result<JobStatus, SupervisorError> {
        let job = self.resolve(owner, name)?;
        self.status(job.id)
    }

    /// Upload a script or archive, replacing whatever the job ran before.
    pub async fn submit_script(
        &self,
        owner: OwnerId,
        name: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<PathBuf, SupervisorError> {
        let job = self.resolve(owner, name)?;
        self.replace_script(job.id, filename, bytes).await
    }

    pub async fn request_start(&self, owner: OwnerId, name: &str) -> Result<(), SupervisorError> {
        let job = self.resolve(owner, name)?;
        self.start(job.id).await
    }

    pub async fn request_stop(&self, owner: OwnerId, name: &str) -> Result<StopOutcome, SupervisorError> {
        let job = self.resolve(owner, name)?;
        self.stop(job.id, StopReason::User).await
    }

    pub async fn request_delete(&self, owner: OwnerId, name: &str) -> Result<(), SupervisorError> {
        let job = self.resolve(owner, name)?;
        self.delete(job.id, StopReason::Delete).await
    }

    pub async fn set_auto_restart(
        &self,
        owner: OwnerId,
        name: &str,
        enabled: bool,
    ) -> Result<(), SupervisorError> {
        let job = self.resolve(owner, name)?;
        self.set_auto_restart_for(job.id, enabled).await
    }

    pub async fn read_logs(&self, owner: OwnerId, name: &str) -> Result<String, SupervisorError> {
        let job = self.resolve(owner, name)?;
        self.logs_for(job.id).await
    }

    pub async fn install_dependency(
        &self,
        owner: OwnerId,
        name: &str,
        package: &str,
    ) -> Result<(), SupervisorError> {
        let job = self.resolve(owner, name)?;
        self.add_dependency(job.id, package).await
    }
}
