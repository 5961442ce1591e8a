//! Resumable task failures.
//!
//! A failed job is not thrown away: its registry entry becomes a failed,
//! resubmittable one and a [`TaskFailure`] envelope is handed to listeners
//! or to the caller of [`Run::execute`](crate::Run::execute). The envelope
//! resolves the failure either way:
//!
//! ```text
//! Pending ──ok──> removed
//!    │
//!  error
//!    v
//! Failed ──retry()──> Pending
//!    │
//! discard()
//!    v
//! removed
//! ```

use crate::environment::RunCore;
use crate::executor::SubmitError;
use crate::job::{Job, JobId};
use crate::mapping::MapError;
use std::fmt;
use std::sync::Arc;

/// Envelope for a job that finished with an error.
///
/// Clones refer to the same failure; resolving it through one clone resolves
/// it for all of them. An envelope only ever resolves its own failure: once a
/// retried job fails again, the older envelope stays resolved.
pub struct TaskFailure<K, V> {
    job: Job<K, V>,
    cause: Arc<MapError>,
    attempt: u32,
    core: Arc<RunCore<K, V>>,
}

impl<K, V> Clone for TaskFailure<K, V> {
    fn clone(&self) -> Self {
        Self {
            job: self.job.clone(),
            cause: Arc::clone(&self.cause),
            attempt: self.attempt,
            core: Arc::clone(&self.core),
        }
    }
}

impl<K, V> TaskFailure<K, V> {
    pub(crate) fn new(
        job: Job<K, V>,
        cause: Arc<MapError>,
        attempt: u32,
        core: Arc<RunCore<K, V>>,
    ) -> Self {
        Self {
            job,
            cause,
            attempt,
            core,
        }
    }

    /// Identity of the failed job.
    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    /// Key of the record that failed.
    pub fn key(&self) -> &K {
        self.job.key()
    }

    /// Value of the record that failed.
    pub fn value(&self) -> &V {
        self.job.value()
    }

    /// How many times the job has failed, this failure included.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The error the mapping returned.
    pub fn cause(&self) -> &MapError {
        &self.cause
    }

    /// The resubmittable job, or `None` once the failure was retried or
    /// discarded.
    pub fn task(&self) -> Option<Job<K, V>> {
        self.core.registry.failed_job(self.job.id(), self.attempt)
    }

    /// Check if this failure no longer awaits a decision.
    pub fn is_resolved(&self) -> bool {
        self.task().is_none()
    }

    /// Drop the job permanently, letting the run complete without it.
    ///
    /// Returns `false` if the failure was already retried or discarded.
    pub fn discard(&self) -> bool {
        self.core.discard(self.job.id(), self.attempt)
    }
}

impl<K, V> TaskFailure<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Submit the same job again through the run's executor.
    ///
    /// Each failure can be retried once; a retried job that fails again
    /// produces a new envelope. With an inline executor the job has already
    /// run when this returns.
    pub fn retry(&self) -> Result<(), RetryError> {
        self.core.retry(self.job.id(), self.attempt, Arc::clone(&self.cause))
    }
}

impl<K, V> fmt::Display for TaskFailure<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.job.id(), self.cause)
    }
}

impl<K, V> fmt::Debug for TaskFailure<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFailure")
            .field("job", &self.job.id())
            .field("attempt", &self.attempt)
            .field("cause", &self.cause)
            .finish()
    }
}

impl<K, V> std::error::Error for TaskFailure<K, V> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Errors raised by [`TaskFailure::retry`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("{0} is not awaiting a retry")]
    NotFailed(JobId),

    #[error("failed to resubmit job: {0}")]
    Submit(#[from] SubmitError),
}

/// Receives failure envelopes as they are reconciled.
///
/// A listener may retry or discard the failure right away, or keep the
/// envelope and decide later.
pub trait FailureListener<K, V>: Send + Sync {
    fn on_failure(&self, failure: &TaskFailure<K, V>);
}

impl<K, V, F> FailureListener<K, V> for F
where
    F: Fn(&TaskFailure<K, V>) + Send + Sync,
{
    fn on_failure(&self, failure: &TaskFailure<K, V>) {
        self(failure)
    }
}
