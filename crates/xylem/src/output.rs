//! Output factories: outputs scoped to one unit of work.
//!
//! A factory hands out outputs for a batch and is closed once with a
//! success flag. `close(true)` commits what was written; `close(false)`
//! discards it. The environment never closes a caller's output itself, so
//! committing or discarding is up to whoever owns the factory.

use crate::record::{Output, OutputError};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Produces outputs scoped to one batch, with commit/discard on close.
pub trait OutputFactory<K, V> {
    type Output: Output<K, V>;

    /// Create an output writing into this factory's batch.
    fn new_output(&self) -> Result<Self::Output, OutputError>;

    /// Create a fresh factory for a new batch with the same destination.
    fn new_instance(&self) -> Result<Self, OutputError>
    where
        Self: Sized;

    /// Finish the batch. `true` commits, `false` discards.
    ///
    /// Closing an already closed factory is a no-op.
    fn close(&self, success: bool) -> Result<(), OutputError>;
}

type Buffer<K, V> = Arc<Mutex<Option<Vec<(K, V)>>>>;

/// Buffers records in memory and forwards them to a target output on commit.
pub struct StagedOutputFactory<K, V, O> {
    target: O,
    buffer: Buffer<K, V>,
}

impl<K, V, O> fmt::Debug for StagedOutputFactory<K, V, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let staged = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Vec::len);
        f.debug_struct("StagedOutputFactory")
            .field("staged", &staged)
            .finish()
    }
}

impl<K, V, O> StagedOutputFactory<K, V, O> {
    /// Stage records for `target`.
    pub fn new(target: O) -> Self {
        Self {
            target,
            buffer: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Number of records waiting for commit. `None` once closed.
    pub fn staged(&self) -> Option<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Vec::len)
    }
}

impl<K, V, O> OutputFactory<K, V> for StagedOutputFactory<K, V, O>
where
    O: Output<K, V> + Clone,
{
    type Output = StagedOutput<K, V>;

    fn new_output(&self) -> Result<StagedOutput<K, V>, OutputError> {
        Ok(StagedOutput {
            buffer: Arc::clone(&self.buffer),
        })
    }

    fn new_instance(&self) -> Result<Self, OutputError> {
        Ok(Self::new(self.target.clone()))
    }

    fn close(&self, success: bool) -> Result<(), OutputError> {
        let staged = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(records) = staged else {
            return Ok(());
        };

        if !success {
            tracing::debug!(records = records.len(), "discarding staged records");
            return Ok(());
        }

        for (key, value) in records {
            self.target.write(key, value)?;
        }
        Ok(())
    }
}

/// Output handed out by [`StagedOutputFactory`].
pub struct StagedOutput<K, V> {
    buffer: Buffer<K, V>,
}

impl<K, V> Clone for StagedOutput<K, V> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl<K, V> Output<K, V> for StagedOutput<K, V> {
    fn write(&self, key: K, value: V) -> Result<(), OutputError> {
        match self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(records) => {
                records.push((key, value));
                Ok(())
            }
            None => Err(OutputError::Closed),
        }
    }
}
