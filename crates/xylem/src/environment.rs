//! Execution environment: drives a reader through a mapping.
//!
//! The environment owns the policy (executor, drop-failed-tasks, panic
//! handling). Each call to [`Environment::start`] creates a [`Run`] that
//! owns everything mutable about one pass over a reader: the job registry,
//! the completion channel and the reader itself.
//!
//! The run loop reads one record, reconciles every job that has already
//! finished, then submits the new job. Once the reader is exhausted it
//! blocks on the completion channel until no job is outstanding.

use crate::config::{EnvironmentConfig, PanicPolicy};
#[cfg(feature = "parallel")]
use crate::executor::{PoolExecutor, available_parallelism};
use crate::executor::{Executor, SimpleExecutor, SubmitError};
use crate::failure::{FailureListener, RetryError, TaskFailure};
use crate::job::{Binding, Completion, Job, JobId, JobOutcome, JobRegistry, Work};
use crate::mapping::{MapError, Mapping};
use crate::record::{Output, ReadError, Reader};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Runs mappings over readers with a configured executor and failure policy.
#[derive(Clone)]
pub struct Environment {
    executor: Arc<dyn Executor>,
    drop_failed_tasks: bool,
    panic_policy: PanicPolicy,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("concurrency", &self.executor.concurrency())
            .field("drop_failed_tasks", &self.drop_failed_tasks)
            .field("panic_policy", &self.panic_policy)
            .finish()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Inline execution, failed jobs held until resolved, panics fatal.
    pub fn new() -> Self {
        Self {
            executor: Arc::new(SimpleExecutor::new()),
            drop_failed_tasks: false,
            panic_policy: PanicPolicy::default(),
        }
    }

    /// Build an environment from configuration.
    ///
    /// A parallelism above one selects a worker pool; `0` sizes the pool to
    /// the machine.
    pub fn from_config(config: &EnvironmentConfig) -> Result<Self, SubmitError> {
        let env = Self::new()
            .with_drop_failed_tasks(config.drop_failed_tasks)
            .with_panic_policy(config.panic_policy);

        match config.parallelism {
            None | Some(1) => Ok(env),
            Some(threads) => env.with_pool(threads),
        }
    }

    #[cfg(feature = "parallel")]
    fn with_pool(self, threads: usize) -> Result<Self, SubmitError> {
        let threads = if threads == 0 {
            available_parallelism()
        } else {
            threads
        };
        Ok(self.with_executor(PoolExecutor::new(threads)?))
    }

    #[cfg(not(feature = "parallel"))]
    fn with_pool(self, threads: usize) -> Result<Self, SubmitError> {
        tracing::warn!(
            threads,
            "built without the `parallel` feature, running jobs inline"
        );
        Ok(self)
    }

    /// Use `executor` for every run started from this environment.
    pub fn with_executor<E: Executor + 'static>(self, executor: E) -> Self {
        self.with_shared_executor(Arc::new(executor))
    }

    /// Use an executor shared with other environments.
    pub fn with_shared_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Evict failed jobs once listeners have seen them.
    pub fn with_drop_failed_tasks(mut self, drop_failed_tasks: bool) -> Self {
        self.drop_failed_tasks = drop_failed_tasks;
        self
    }

    /// Choose how panics inside mappings are treated.
    pub fn with_panic_policy(mut self, panic_policy: PanicPolicy) -> Self {
        self.panic_policy = panic_policy;
        self
    }

    pub fn drop_failed_tasks(&self) -> bool {
        self.drop_failed_tasks
    }

    pub fn panic_policy(&self) -> PanicPolicy {
        self.panic_policy
    }

    /// Maximum number of jobs run at once.
    pub fn concurrency(&self) -> usize {
        self.executor.concurrency()
    }

    /// Prepare a run of `mapping` over `reader`, writing to `output`.
    ///
    /// Nothing is read until [`Run::execute`] is called.
    pub fn start<R, M, O>(&self, reader: R, mapping: M, output: O) -> Run<R>
    where
        R: Reader,
        R::Key: Clone + Send + Sync + 'static,
        R::Value: Clone + Send + Sync + 'static,
        M: Mapping<R::Key, R::Value> + 'static,
        O: Output<M::OutKey, M::OutValue> + Send + Sync + 'static,
    {
        let work: Arc<dyn Work<R::Key, R::Value>> = Arc::new(Binding::new(mapping, output));
        let (completions, finished) = unbounded();

        Run {
            reader: ReaderGuard::new(reader),
            work,
            core: Arc::new(RunCore::new(Arc::clone(&self.executor))),
            completions,
            finished,
            listeners: Vec::new(),
            drop_failed_tasks: self.drop_failed_tasks,
            panic_policy: self.panic_policy,
            exhausted: false,
            staged: None,
        }
    }

    /// Run `mapping` over every record of `reader` in one call.
    ///
    /// The reader is closed before this returns, whatever the outcome. A
    /// failure returned here ends the run; use [`start`](Self::start) to
    /// retry failures and resume.
    pub fn execute<R, M, O>(
        &self,
        reader: R,
        mapping: M,
        output: O,
        listeners: Vec<Arc<dyn FailureListener<R::Key, R::Value>>>,
    ) -> Result<RunSummary, ExecuteError<R::Key, R::Value>>
    where
        R: Reader,
        R::Key: Clone + Send + Sync + 'static,
        R::Value: Clone + Send + Sync + 'static,
        M: Mapping<R::Key, R::Value> + 'static,
        O: Output<M::OutKey, M::OutValue> + Send + Sync + 'static,
    {
        let mut run = self.start(reader, mapping, output);
        run.listeners.extend(listeners);
        run.execute()
    }
}

// ============================================================================
// Run core
// ============================================================================

/// State shared between a run and the failure envelopes it hands out.
pub(crate) struct RunCore<K, V> {
    pub(crate) registry: JobRegistry<K, V>,
    executor: Arc<dyn Executor>,
    read: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    dropped: AtomicUsize,
}

impl<K, V> RunCore<K, V> {
    fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            registry: JobRegistry::new(),
            executor,
            read: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            retried: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Evict failure `attempt` of a job for good.
    pub(crate) fn discard(&self, id: JobId, attempt: u32) -> bool {
        let discarded = self.registry.evict_failed(id, attempt);
        if discarded {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job = %id, "discarded failed job");
        }
        discarded
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            read: self.read.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> RunCore<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Register `job` as pending and hand it to the executor.
    fn submit(&self, job: Job<K, V>) -> Result<(), SubmitError> {
        let id = job.id();
        self.registry.insert_pending(job.clone());

        let result = self.executor.submit(Box::new(move || job.run()));
        if result.is_err() {
            self.registry.evict(id);
        }
        result
    }

    /// Move failure `attempt` back to pending and submit the job again.
    pub(crate) fn retry(
        &self,
        id: JobId,
        attempt: u32,
        cause: Arc<MapError>,
    ) -> Result<(), RetryError> {
        let job = self
            .registry
            .resubmit(id, attempt)
            .ok_or(RetryError::NotFailed(id))?;

        tracing::debug!(job = %id, attempt, "retrying failed job");
        if let Err(e) = self.executor.submit(Box::new(move || job.run())) {
            self.registry.restore_failed(id, cause, attempt);
            return Err(e.into());
        }

        self.retried.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// Run
// ============================================================================

/// Closes the reader at most once, on the first of an explicit close or drop.
struct ReaderGuard<R: Reader> {
    reader: R,
    closed: bool,
}

impl<R: Reader> ReaderGuard<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            closed: false,
        }
    }

    fn close(&mut self) -> Result<(), ReadError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reader.close()
    }
}

impl<R: Reader> Drop for ReaderGuard<R> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "failed to close reader");
        }
    }
}

/// One pass of a mapping over a reader.
///
/// A run survives per-record failures: when [`execute`](Self::execute)
/// returns [`ExecuteError::Task`] or [`ExecuteError::Stalled`], resolve the
/// failures through their envelopes and call `execute` again to continue
/// where the run stopped. The reader is closed when the run completes, on a
/// fatal error, or when the run is dropped.
pub struct Run<R: Reader> {
    reader: ReaderGuard<R>,
    work: Arc<dyn Work<R::Key, R::Value>>,
    core: Arc<RunCore<R::Key, R::Value>>,
    completions: Sender<Completion<R::Key, R::Value>>,
    finished: Receiver<Completion<R::Key, R::Value>>,
    listeners: Vec<Arc<dyn FailureListener<R::Key, R::Value>>>,
    drop_failed_tasks: bool,
    panic_policy: PanicPolicy,
    /// Set once the reader returned its last record or a fatal error ended
    /// reading.
    exhausted: bool,
    /// A job built from the reader but not yet submitted.
    staged: Option<Job<R::Key, R::Value>>,
}

impl<R: Reader> fmt::Debug for Run<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("summary", &self.core.summary())
            .field("outstanding", &self.core.registry.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl<R, K, V> Run<R>
where
    R: Reader<Key = K, Value = V>,
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Notify `listener` of every failure.
    ///
    /// With at least one listener registered, failures no longer abort
    /// [`execute`](Self::execute).
    pub fn with_listener<L>(self, listener: L) -> Self
    where
        L: FailureListener<K, V> + 'static,
    {
        self.with_shared_listener(Arc::new(listener))
    }

    pub fn with_shared_listener(mut self, listener: Arc<dyn FailureListener<K, V>>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Drive the run until every record is processed or an error stops it.
    pub fn execute(&mut self) -> Result<RunSummary, ExecuteError<K, V>> {
        match self.drive() {
            Ok(()) => {
                self.reader.close()?;
                let summary = self.core.summary();
                tracing::info!(
                    read = summary.read,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    retried = summary.retried,
                    dropped = summary.dropped,
                    "run complete"
                );
                Ok(summary)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.exhausted = true;
                    if let Err(close_err) = self.reader.close() {
                        tracing::error!(error = %close_err, "failed to close reader");
                    }
                }
                Err(e)
            }
        }
    }

    /// Counters so far.
    pub fn summary(&self) -> RunSummary {
        self.core.summary()
    }

    /// Jobs submitted and not yet reconciled, failed ones included.
    pub fn outstanding(&self) -> usize {
        self.core.registry.len()
    }

    /// Envelopes for every failed job still awaiting a decision.
    pub fn failures(&self) -> Vec<TaskFailure<K, V>> {
        self.core
            .registry
            .failed_jobs()
            .into_iter()
            .map(|failed| {
                TaskFailure::new(
                    failed.job,
                    failed.cause,
                    failed.attempt,
                    Arc::clone(&self.core),
                )
            })
            .collect()
    }

    fn drive(&mut self) -> Result<(), ExecuteError<K, V>> {
        while !self.exhausted {
            let job = match self.staged.take() {
                Some(job) => job,
                None => match self.next_job()? {
                    Some(job) => job,
                    None => {
                        self.exhausted = true;
                        break;
                    }
                },
            };

            if let Err(e) = self.drain_ready() {
                self.staged = Some(job);
                return Err(e);
            }

            tracing::trace!(job = %job.id(), "submitting job");
            self.core.submit(job)?;
        }

        // A record read just before a fatal error stopped the read phase.
        if let Some(job) = self.staged.take() {
            tracing::debug!(job = %job.id(), "submitting record read before the run aborted");
            self.core.submit(job)?;
        }

        loop {
            self.drain_ready()?;

            if self.core.registry.is_empty() {
                return Ok(());
            }
            if self.core.registry.pending_count() == 0 {
                return Err(ExecuteError::Stalled(self.failures()));
            }

            // `self.completions` keeps the channel open for the life of the run.
            let Ok(completion) = self.finished.recv() else {
                unreachable!("completion channel closed while the run holds a sender");
            };
            self.reconcile(completion)?;
        }
    }

    fn next_job(&mut self) -> Result<Option<Job<K, V>>, ReadError> {
        let reader = &mut self.reader.reader;
        if !reader.advance()? {
            return Ok(None);
        }

        let key = reader.current_key().ok_or(ReadError::NoCurrentRecord)?;
        let value = reader.current_value().ok_or(ReadError::NoCurrentRecord)?;
        self.core.read.fetch_add(1, Ordering::Relaxed);

        Ok(Some(Job::new(
            key.clone(),
            value.clone(),
            Arc::clone(&self.work),
            self.completions.clone(),
        )))
    }

    fn drain_ready(&self) -> Result<(), ExecuteError<K, V>> {
        while let Ok(completion) = self.finished.try_recv() {
            self.reconcile(completion)?;
        }
        Ok(())
    }

    fn reconcile(&self, completion: Completion<K, V>) -> Result<(), ExecuteError<K, V>> {
        let Completion { job, outcome } = completion;

        match outcome {
            JobOutcome::Completed => {
                if self.core.registry.complete(job.id()) {
                    self.core.succeeded.fetch_add(1, Ordering::Relaxed);
                } else {
                    tracing::debug!(job = %job.id(), "ignoring completion of unknown job");
                }
                Ok(())
            }
            JobOutcome::Failed(cause) => self.fail(job, cause),
            JobOutcome::Panicked(message) => match self.panic_policy {
                PanicPolicy::Isolate => self.fail(job, Arc::new(MapError::Panicked(message))),
                PanicPolicy::Fatal => {
                    let id = job.id();
                    if self.drop_failed_tasks {
                        self.core.registry.evict(id);
                    } else {
                        let cause = Arc::new(MapError::Panicked(message.clone()));
                        self.core.registry.mark_failed(id, cause);
                    }
                    self.core.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(job = %id, panic = %message, "mapping panicked");
                    Err(ExecuteError::Panicked { job: id, message })
                }
            },
        }
    }

    fn fail(&self, job: Job<K, V>, cause: Arc<MapError>) -> Result<(), ExecuteError<K, V>> {
        let id = job.id();
        let Some((job, attempt)) = self.core.registry.mark_failed(id, Arc::clone(&cause)) else {
            tracing::debug!(job = %id, "ignoring failure of job that is not pending");
            return Ok(());
        };
        self.core.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(job = %id, attempt, error = %cause, "job failed");

        let failure = TaskFailure::new(job, cause, attempt, Arc::clone(&self.core));
        for listener in &self.listeners {
            listener.on_failure(&failure);
        }

        if self.drop_failed_tasks {
            failure.discard();
            return Ok(());
        }
        if self.listeners.is_empty() {
            return Err(ExecuteError::Task(failure));
        }
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

/// Counters describing a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Records taken from the reader.
    pub read: usize,
    /// Jobs that completed normally, retries included.
    pub succeeded: usize,
    /// Failures reconciled, one per failed attempt.
    pub failed: usize,
    /// Retries submitted.
    pub retried: usize,
    /// Failed jobs discarded.
    pub dropped: usize,
}

/// Why [`Run::execute`] stopped.
pub enum ExecuteError<K, V> {
    /// A job failed and no listener was registered. Resumable.
    Task(TaskFailure<K, V>),
    /// Every outstanding job has failed and none was retried or discarded.
    /// Resumable.
    Stalled(Vec<TaskFailure<K, V>>),
    /// The reader failed.
    Read(ReadError),
    /// The executor refused a job.
    Submit(SubmitError),
    /// A mapping panicked under [`PanicPolicy::Fatal`].
    Panicked { job: JobId, message: String },
}

impl<K, V> ExecuteError<K, V> {
    /// Whether the run can no longer read records.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecuteError::Read(_) | ExecuteError::Submit(_) | ExecuteError::Panicked { .. }
        )
    }

    /// The failure envelope, for [`ExecuteError::Task`].
    pub fn into_failure(self) -> Option<TaskFailure<K, V>> {
        match self {
            ExecuteError::Task(failure) => Some(failure),
            _ => None,
        }
    }
}

impl<K, V> From<ReadError> for ExecuteError<K, V> {
    fn from(e: ReadError) -> Self {
        ExecuteError::Read(e)
    }
}

impl<K, V> From<SubmitError> for ExecuteError<K, V> {
    fn from(e: SubmitError) -> Self {
        ExecuteError::Submit(e)
    }
}

impl<K, V> fmt::Display for ExecuteError<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::Task(failure) => write!(f, "{failure}"),
            ExecuteError::Stalled(failures) => {
                write!(f, "run stalled on {} unresolved failed job(s)", failures.len())
            }
            ExecuteError::Read(e) => write!(f, "failed to read input: {e}"),
            ExecuteError::Submit(e) => write!(f, "failed to submit job: {e}"),
            ExecuteError::Panicked { job, message } => write!(f, "{job} panicked: {message}"),
        }
    }
}

impl<K, V> fmt::Debug for ExecuteError<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::Task(failure) => f.debug_tuple("Task").field(failure).finish(),
            ExecuteError::Stalled(failures) => f.debug_tuple("Stalled").field(failures).finish(),
            ExecuteError::Read(e) => f.debug_tuple("Read").field(e).finish(),
            ExecuteError::Submit(e) => f.debug_tuple("Submit").field(e).finish(),
            ExecuteError::Panicked { job, message } => f
                .debug_struct("Panicked")
                .field("job", job)
                .field("message", message)
                .finish(),
        }
    }
}

impl<K, V> std::error::Error for ExecuteError<K, V> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecuteError::Task(failure) => Some(failure.cause()),
            ExecuteError::Read(e) => Some(e),
            ExecuteError::Submit(e) => Some(e),
            ExecuteError::Stalled(_) | ExecuteError::Panicked { .. } => None,
        }
    }
}
