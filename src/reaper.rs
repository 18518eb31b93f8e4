//! Removal of owners that have been inactive for too long.

use std::time::Duration;

use crate::supervisor::{StopReason, Supervisor, SupervisorError};
use crate::utils::current_timestamp;

/// Delete every owner idle for longer than `max_idle`, with all their jobs
/// and files. Returns the number of owners removed.
pub async fn reap_inactive(sup: &Supervisor, max_idle: Duration) -> Result<usize, SupervisorError> {
    let cutoff = current_timestamp().saturating_sub(max_idle.as_secs());
    let owners = sup.store().inactive_owners(cutoff)?;
    if owners.is_empty() {
        return Ok(0);
    }
    tracing::info!("Reaping {} inactive owner(s)", owners.len());

    let mut reaped = 0;
    for owner in owners {
        for job in sup.store().list_by_owner(owner)? {
            match sup.delete(job.id, StopReason::Reaped).await {
                Ok(()) | Err(SupervisorError::NotFound(_)) => {}
                Err(e) => tracing::warn!("Owner {}: failed to delete job {}: {}", owner, job.id, e),
            }
        }
        if let Err(e) = sup.workspace().remove_owner(owner) {
            tracing::warn!("Owner {}: failed to remove files: {}", owner, e);
        }
        let leftover = sup.store().delete_owner(owner)?;
        if leftover > 0 {
            tracing::warn!("Owner {}: {} job record(s) removed without cleanup", owner, leftover);
        }
        tracing::info!("Owner {} reaped", owner);
        reaped += 1;
    }
    Ok(reaped)
}

/// Run [`reap_inactive`] every `interval` until the task is dropped.
pub async fn run_loop(sup: Supervisor, max_idle: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        if sup.is_shutting_down() {
            break;
        }
        match reap_inactive(&sup, max_idle).await {
            Ok(0) => tracing::debug!("No inactive owners"),
            Ok(n) => tracing::info!("Reaped {} inactive owner(s)", n),
            Err(e) => tracing::error!("Inactive owner cleanup failed: {}", e),
        }
    }
}
