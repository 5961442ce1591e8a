//! Jobs and the registry of outstanding jobs.
//!
//! A job binds one record to the mapping and output it is processed with.
//! When it finishes, however it finishes, it pushes itself onto the run's
//! completion channel; that channel is the only way the environment learns
//! a job is done.

use crate::mapping::{MapError, Mapping};
use crate::record::Output;
use crossbeam_channel::Sender;
use indexmap::IndexMap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identity of a job. Two jobs over equal records are still distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        JobId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// A mapping paired with the output it writes to.
pub(crate) trait Work<K, V>: Send + Sync {
    fn apply(&self, key: &K, value: &V) -> Result<(), MapError>;
}

pub(crate) struct Binding<M, O> {
    mapping: M,
    output: O,
}

impl<M, O> Binding<M, O> {
    pub(crate) fn new(mapping: M, output: O) -> Self {
        Self { mapping, output }
    }
}

impl<K, V, M, O> Work<K, V> for Binding<M, O>
where
    M: Mapping<K, V>,
    O: Output<M::OutKey, M::OutValue> + Send + Sync,
{
    fn apply(&self, key: &K, value: &V) -> Result<(), MapError> {
        self.mapping.map(key, value, &self.output)
    }
}

/// How a job's execution ended.
#[derive(Debug, Clone)]
pub(crate) enum JobOutcome {
    Completed,
    Failed(Arc<MapError>),
    Panicked(String),
}

/// Message a finished job leaves on the completion channel.
pub(crate) struct Completion<K, V> {
    pub(crate) job: Job<K, V>,
    pub(crate) outcome: JobOutcome,
}

struct JobInner<K, V> {
    id: JobId,
    key: K,
    value: V,
    work: Arc<dyn Work<K, V>>,
    completions: Sender<Completion<K, V>>,
}

/// One record bound to its processing context.
///
/// Cloning is cheap and keeps the identity: clones compare equal.
pub struct Job<K, V> {
    inner: Arc<JobInner<K, V>>,
}

impl<K, V> Clone for Job<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> PartialEq for Job<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<K, V> Eq for Job<K, V> {}

impl<K, V> fmt::Debug for Job<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("id", &self.inner.id).finish()
    }
}

impl<K, V> Job<K, V> {
    pub(crate) fn new(
        key: K,
        value: V,
        work: Arc<dyn Work<K, V>>,
        completions: Sender<Completion<K, V>>,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                id: JobId::next(),
                key,
                value,
                work,
                completions,
            }),
        }
    }

    /// Identity of this job.
    pub fn id(&self) -> JobId {
        self.inner.id
    }

    /// Key of the record this job processes.
    pub fn key(&self) -> &K {
        &self.inner.key
    }

    /// Value of the record this job processes.
    pub fn value(&self) -> &V {
        &self.inner.value
    }

    /// Apply the mapping, then enqueue this job on the completion channel.
    ///
    /// The enqueue happens on every exit path, including a panic inside the
    /// mapping.
    pub(crate) fn run(&self) {
        let inner = &self.inner;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            inner.work.apply(&inner.key, &inner.value)
        }));

        let outcome = match result {
            Ok(Ok(())) => JobOutcome::Completed,
            Ok(Err(e)) => JobOutcome::Failed(Arc::new(e)),
            Err(payload) => JobOutcome::Panicked(panic_message(payload.as_ref())),
        };

        let completion = Completion {
            job: self.clone(),
            outcome,
        };
        if inner.completions.send(completion).is_err() {
            tracing::debug!(job = %inner.id, "completion channel closed, run was abandoned");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Job Registry
// ============================================================================

/// Registry state of one outstanding job.
///
/// `attempt` counts the failures a job has had. It is the identity of a
/// failure: an envelope only acts on the entry while the attempt matches.
pub(crate) enum Entry<K, V> {
    /// Submitted, completion not yet reconciled.
    Pending { job: Job<K, V>, attempt: u32 },
    /// Finished with a failure; holds the resubmittable job and its cause.
    Failed {
        job: Job<K, V>,
        cause: Arc<MapError>,
        attempt: u32,
    },
}

/// A failed entry as handed out by [`JobRegistry::failed_jobs`].
pub(crate) struct FailedJob<K, V> {
    pub(crate) job: Job<K, V>,
    pub(crate) cause: Arc<MapError>,
    pub(crate) attempt: u32,
}

/// Jobs submitted and not yet reconciled.
///
/// Every mutation goes through one mutex, shared by the submitting path,
/// the reconciling path, and retries issued from failure envelopes.
pub(crate) struct JobRegistry<K, V> {
    entries: Mutex<IndexMap<JobId, Entry<K, V>>>,
}

impl<K, V> JobRegistry<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<JobId, Entry<K, V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly submitted job.
    pub(crate) fn insert_pending(&self, job: Job<K, V>) {
        self.lock()
            .insert(job.id(), Entry::Pending { job, attempt: 0 });
    }

    /// Remove a job that completed normally. Returns false if it was unknown.
    pub(crate) fn complete(&self, id: JobId) -> bool {
        let mut entries = self.lock();
        if matches!(entries.get(&id), Some(Entry::Pending { .. })) {
            entries.shift_remove(&id);
            true
        } else {
            false
        }
    }

    /// Turn a pending entry into a failed, resubmittable one.
    ///
    /// Returns the job and the number of this failure.
    pub(crate) fn mark_failed(&self, id: JobId, cause: Arc<MapError>) -> Option<(Job<K, V>, u32)> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id)?;
        let (job, attempt) = match entry {
            Entry::Pending { job, attempt } => (job.clone(), *attempt + 1),
            Entry::Failed { .. } => return None,
        };
        *entry = Entry::Failed {
            job: job.clone(),
            cause,
            attempt,
        };
        Some((job, attempt))
    }

    /// Move failure `attempt` back to pending so it can be submitted again.
    ///
    /// Returns `None` unless the job is failed with that attempt, which keeps
    /// at most one execution of a job in flight.
    pub(crate) fn resubmit(&self, id: JobId, attempt: u32) -> Option<Job<K, V>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id)?;
        let job = match entry {
            Entry::Failed {
                job, attempt: a, ..
            } if *a == attempt => job.clone(),
            _ => return None,
        };
        *entry = Entry::Pending {
            job: job.clone(),
            attempt,
        };
        Some(job)
    }

    /// Undo a [`resubmit`](Self::resubmit) whose submission was refused.
    pub(crate) fn restore_failed(&self, id: JobId, cause: Arc<MapError>, attempt: u32) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        let job = match entry {
            Entry::Pending { job, attempt: a } if *a == attempt => job.clone(),
            _ => return,
        };
        *entry = Entry::Failed {
            job,
            cause,
            attempt,
        };
    }

    /// The resubmittable job, if `id` is failed with `attempt`.
    pub(crate) fn failed_job(&self, id: JobId, attempt: u32) -> Option<Job<K, V>> {
        match self.lock().get(&id) {
            Some(Entry::Failed {
                job, attempt: a, ..
            }) if *a == attempt => Some(job.clone()),
            _ => None,
        }
    }

    /// Remove failure `attempt` permanently.
    pub(crate) fn evict_failed(&self, id: JobId, attempt: u32) -> bool {
        let mut entries = self.lock();
        if matches!(entries.get(&id), Some(Entry::Failed { attempt: a, .. }) if *a == attempt) {
            entries.shift_remove(&id);
            true
        } else {
            false
        }
    }

    /// Remove an entry regardless of state.
    pub(crate) fn evict(&self, id: JobId) -> bool {
        self.lock().shift_remove(&id).is_some()
    }

    /// All failed jobs, in submission order.
    pub(crate) fn failed_jobs(&self) -> Vec<FailedJob<K, V>> {
        self.lock()
            .values()
            .filter_map(|entry| match entry {
                Entry::Failed {
                    job,
                    cause,
                    attempt,
                } => Some(FailedJob {
                    job: job.clone(),
                    cause: Arc::clone(cause),
                    attempt: *attempt,
                }),
                Entry::Pending { .. } => None,
            })
            .collect()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| matches!(entry, Entry::Pending { .. }))
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Identity, from_fn};
    use crate::record::Collector;
    use crossbeam_channel::{Receiver, unbounded};

    type TestCompletion = Completion<&'static str, i32>;
    type Channel = (Sender<TestCompletion>, Receiver<TestCompletion>);

    fn job_with<M>(mapping: M, tx: &Sender<TestCompletion>) -> Job<&'static str, i32>
    where
        M: Mapping<&'static str, i32, OutKey = &'static str, OutValue = i32> + 'static,
    {
        let work: Arc<dyn Work<&'static str, i32>> =
            Arc::new(Binding::new(mapping, Collector::<&'static str, i32>::new()));
        Job::new("a", 1, work, tx.clone())
    }

    #[test]
    fn test_job_enqueues_on_success() {
        let (tx, rx): Channel = unbounded();
        let job = job_with(Identity, &tx);

        job.run();

        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.job, job);
        assert!(matches!(completion.outcome, JobOutcome::Completed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_job_enqueues_on_failure() {
        let (tx, rx): Channel = unbounded();
        let failing = from_fn(|_: &&str, _: &i32, _: &dyn Output<&'static str, i32>| {
            Err(MapError::failed("nope"))
        });
        let job = job_with(failing, &tx);

        job.run();

        match rx.try_recv().unwrap().outcome {
            JobOutcome::Failed(e) => assert!(e.to_string().contains("nope")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_job_enqueues_on_panic() {
        let (tx, rx): Channel = unbounded();
        let panicking = from_fn(|_: &&str, _: &i32, _: &dyn Output<&'static str, i32>| {
            panic!("exploded")
        });
        let job = job_with(panicking, &tx);

        job.run();

        match rx.try_recv().unwrap().outcome {
            JobOutcome::Panicked(msg) => assert_eq!(msg, "exploded"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_jobs_compare_by_identity() {
        let (tx, _rx): Channel = unbounded();
        let a = job_with(Identity, &tx);
        let b = job_with(Identity, &tx);

        assert_eq!(a.key(), b.key());
        assert_eq!(a.value(), b.value());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_registry_state_transitions() {
        let (tx, _rx): Channel = unbounded();
        let registry = JobRegistry::new();
        let job = job_with(Identity, &tx);
        let id = job.id();

        registry.insert_pending(job);
        assert_eq!(registry.pending_count(), 1);
        assert!(registry.resubmit(id, 0).is_none());

        let cause = Arc::new(MapError::failed("boom"));
        let (_, attempt) = registry.mark_failed(id, Arc::clone(&cause)).unwrap();
        assert_eq!(attempt, 1);
        assert!(registry.mark_failed(id, cause).is_none());
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.failed_jobs().len(), 1);
        assert!(registry.failed_job(id, 1).is_some());

        assert!(registry.resubmit(id, 1).is_some());
        assert!(registry.resubmit(id, 1).is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.complete(id));
        assert!(registry.is_empty());
        assert!(!registry.complete(id));
    }

    #[test]
    fn test_registry_failures_are_per_attempt() {
        let (tx, _rx): Channel = unbounded();
        let registry = JobRegistry::new();
        let job = job_with(Identity, &tx);
        let id = job.id();
        registry.insert_pending(job);

        registry.mark_failed(id, Arc::new(MapError::failed("first")));
        assert!(registry.resubmit(id, 1).is_some());
        let (_, attempt) = registry
            .mark_failed(id, Arc::new(MapError::failed("second")))
            .unwrap();
        assert_eq!(attempt, 2);

        // The first failure was resolved by its retry.
        assert!(registry.failed_job(id, 1).is_none());
        assert!(registry.resubmit(id, 1).is_none());
        assert!(!registry.evict_failed(id, 1));

        let failed = registry.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempt, 2);
        assert_eq!(failed[0].cause.to_string(), MapError::failed("second").to_string());
        assert!(registry.evict_failed(id, 2));
    }

    #[test]
    fn test_restore_failed_undoes_resubmit() {
        let (tx, _rx): Channel = unbounded();
        let registry = JobRegistry::new();
        let job = job_with(Identity, &tx);
        let id = job.id();
        registry.insert_pending(job);

        let cause = Arc::new(MapError::failed("boom"));
        registry.mark_failed(id, Arc::clone(&cause));
        registry.resubmit(id, 1).unwrap();
        registry.restore_failed(id, cause, 1);

        assert_eq!(registry.pending_count(), 0);
        assert!(registry.failed_job(id, 1).is_some());
    }

    #[test]
    fn test_registry_evict_failed_only() {
        let (tx, _rx): Channel = unbounded();
        let registry = JobRegistry::new();
        let job = job_with(Identity, &tx);
        let id = job.id();

        registry.insert_pending(job);
        assert!(!registry.evict_failed(id, 0));

        registry.mark_failed(id, Arc::new(MapError::failed("boom")));
        assert!(!registry.evict_failed(id, 2));
        assert!(registry.evict_failed(id, 1));
        assert!(registry.is_empty());
        assert!(!registry.evict(id));
    }
}
