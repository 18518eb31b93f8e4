//! In-memory table of jobs that currently own a live execution.
//!
//! A job absent from the table is `Stopped`. Every entry carries a generation
//! number so that an exit watcher of an older run can tell it has been
//! superseded and must not touch the job.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::state_machine::{JobState, StateMachine, TransitionError};
use crate::backend::Handle;
use crate::store::JobId;
use crate::utils::current_timestamp;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("job tracker lock poisoned")]
    LockPoisoned,

    #[error("job {id} is {state:?}")]
    Busy { id: JobId, state: JobState },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

struct TrackedJob {
    machine: StateMachine,
    handle: Option<Handle>,
    generation: u64,
    started_at: u64,
}

#[derive(Default)]
struct Table {
    jobs: HashMap<JobId, TrackedJob>,
    next_generation: u64,
}

#[derive(Default)]
pub struct JobTracker {
    table: Mutex<Table>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Table>, TrackerError> {
        self.table.lock().map_err(|e| {
            tracing::error!("JobTracker lock poisoned: {}", e);
            TrackerError::LockPoisoned
        })
    }

    /// Stopped → Starting. Any other state is `Busy`.
    pub fn begin_start(&self, id: JobId) -> Result<(), TrackerError> {
        let mut table = self.lock()?;
        let entry = table.jobs.entry(id).or_insert_with(|| TrackedJob {
            machine: StateMachine::new(),
            handle: None,
            generation: 0,
            started_at: 0,
        });
        if entry.machine.state != JobState::Stopped {
            return Err(TrackerError::Busy {
                id,
                state: entry.machine.state,
            });
        }
        entry.machine.transition(JobState::Starting)?;
        Ok(())
    }

    /// Starting → Running with the new execution. Returns its generation.
    pub fn attach(&self, id: JobId, handle: Handle) -> Result<u64, TrackerError> {
        let mut table = self.lock()?;
        table.next_generation += 1;
        let generation = table.next_generation;
        let entry = table.jobs.get_mut(&id).ok_or(TrackerError::Busy {
            id,
            state: JobState::Stopped,
        })?;
        entry.machine.transition(JobState::Running)?;
        tracing::info!("Job {} now tracking {}", id, handle.reference());
        entry.handle = Some(handle);
        entry.generation = generation;
        entry.started_at = current_timestamp();
        Ok(generation)
    }

    /// Starting → Stopped after a failed start.
    pub fn abort_start(&self, id: JobId) -> Result<(), TrackerError> {
        let mut table = self.lock()?;
        if let Some(mut entry) = table.jobs.remove(&id) {
            entry.machine.transition(JobState::Stopped)?;
        }
        Ok(())
    }

    /// Running → Stopping. `None` when there is nothing to stop.
    pub fn begin_stop(&self, id: JobId) -> Result<Option<Handle>, TrackerError> {
        let mut table = self.lock()?;
        match table.jobs.get_mut(&id) {
            Some(entry) if entry.machine.state == JobState::Running => {
                entry.machine.transition(JobState::Stopping)?;
                Ok(entry.handle.clone())
            }
            _ => Ok(None),
        }
    }

    /// Running → Exiting, only for the run identified by `generation`.
    pub fn begin_exit(&self, id: JobId, generation: u64) -> Result<bool, TrackerError> {
        let mut table = self.lock()?;
        match table.jobs.get_mut(&id) {
            Some(entry)
                if entry.generation == generation && entry.machine.state == JobState::Running =>
            {
                entry.machine.transition(JobState::Exiting)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Stopping/Exiting → Stopped; the job leaves the table.
    pub fn finish(&self, id: JobId) -> Result<(), TrackerError> {
        let mut table = self.lock()?;
        if let Some(mut entry) = table.jobs.remove(&id) {
            entry.machine.transition(JobState::Stopped)?;
            let uptime = current_timestamp().saturating_sub(entry.started_at);
            tracing::debug!("Job {} untracked after {}s", id, uptime);
        }
        Ok(())
    }

    pub fn state(&self, id: JobId) -> Result<JobState, TrackerError> {
        let table = self.lock()?;
        Ok(table
            .jobs
            .get(&id)
            .map(|e| e.machine.state)
            .unwrap_or(JobState::Stopped))
    }

    pub fn handle(&self, id: JobId) -> Result<Option<Handle>, TrackerError> {
        let table = self.lock()?;
        Ok(table.jobs.get(&id).and_then(|e| e.handle.clone()))
    }

    /// Jobs holding a live execution.
    pub fn live_ids(&self) -> Result<Vec<JobId>, TrackerError> {
        let table = self.lock()?;
        let mut ids: Vec<JobId> = table
            .jobs
            .iter()
            .filter(|(_, e)| e.handle.is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn live_count(&self) -> Result<usize, TrackerError> {
        let table = self.lock()?;
        Ok(table.jobs.values().filter(|e| e.handle.is_some()).count())
    }
}
