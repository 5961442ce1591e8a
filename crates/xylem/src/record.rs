//! Record contracts: readers produce key/value records, outputs consume them.

use crate::mapping::MapError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// One key/value pair flowing through a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> Record<K, V> {
    /// Create a new record.
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    /// Split into a `(key, value)` tuple.
    pub fn into_pair(self) -> (K, V) {
        (self.key, self.value)
    }
}

/// A producer of ordered key/value records.
///
/// The engine calls [`advance`](Reader::advance) until it returns `false`,
/// reading the current record after every successful advance, and calls
/// [`close`](Reader::close) exactly once when the run ends.
pub trait Reader {
    type Key;
    type Value;

    /// Move to the next record. Returns `false` once the reader is exhausted.
    fn advance(&mut self) -> Result<bool, ReadError>;

    /// Key of the current record, if positioned on one.
    fn current_key(&self) -> Option<&Self::Key>;

    /// Value of the current record, if positioned on one.
    fn current_value(&self) -> Option<&Self::Value>;

    /// Release the underlying resource.
    fn close(&mut self) -> Result<(), ReadError> {
        Ok(())
    }
}

/// Errors raised while reading records.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("reader is not positioned on a record")]
    NoCurrentRecord,

    #[error("reader is closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

type RecordIter<K, V> = Box<dyn Iterator<Item = Result<(K, V), ReadError>> + Send>;

/// A [`Reader`] over any iterator of records.
pub struct IterReader<K, V> {
    records: RecordIter<K, V>,
    current: Option<(K, V)>,
    closed: bool,
}

impl<K, V> IterReader<K, V>
where
    K: 'static,
    V: 'static,
{
    /// Read from an infallible sequence of records.
    pub fn new<I>(records: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        I::IntoIter: Send + 'static,
    {
        Self::fallible(records.into_iter().map(Ok))
    }

    /// Read from a sequence where individual reads can fail.
    pub fn fallible<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Result<(K, V), ReadError>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            records: Box::new(records.into_iter()),
            current: None,
            closed: false,
        }
    }

    /// Whether [`Reader::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<K, V> Reader for IterReader<K, V> {
    type Key = K;
    type Value = V;

    fn advance(&mut self) -> Result<bool, ReadError> {
        if self.closed {
            return Err(ReadError::Closed);
        }
        match self.records.next() {
            Some(record) => {
                self.current = Some(record?);
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    fn current_key(&self) -> Option<&K> {
        self.current.as_ref().map(|(k, _)| k)
    }

    fn current_value(&self) -> Option<&V> {
        self.current.as_ref().map(|(_, v)| v)
    }

    fn close(&mut self) -> Result<(), ReadError> {
        self.closed = true;
        self.current = None;
        Ok(())
    }
}

/// A consumer of key/value records.
///
/// When an executor runs several jobs at once, the same output receives
/// writes from several worker threads; implementations shared that way must
/// synchronize internally.
pub trait Output<K, V> {
    /// Accept one record.
    fn write(&self, key: K, value: V) -> Result<(), OutputError>;

    /// Flush and release the output. Defaults to a no-op.
    fn close(&self) -> Result<(), OutputError> {
        Ok(())
    }
}

impl<K, V, O: Output<K, V> + ?Sized> Output<K, V> for Arc<O> {
    fn write(&self, key: K, value: V) -> Result<(), OutputError> {
        (**self).write(key, value)
    }

    fn close(&self) -> Result<(), OutputError> {
        (**self).close()
    }
}

impl<K, V, O: Output<K, V> + ?Sized> Output<K, V> for &O {
    fn write(&self, key: K, value: V) -> Result<(), OutputError> {
        (**self).write(key, value)
    }

    fn close(&self) -> Result<(), OutputError> {
        (**self).close()
    }
}

/// Errors raised while writing records.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize record: {0}")]
    Serialize(String),

    #[error("output is closed")]
    Closed,

    /// A downstream chain stage failed while handling the written record.
    #[error("downstream stage failed: {0}")]
    Downstream(Box<MapError>),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Thread-safe in-memory output that keeps every record it receives.
#[derive(Debug)]
pub struct Collector<K, V> {
    records: Mutex<Vec<(K, V)>>,
}

impl<K, V> Default for Collector<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Collector<K, V> {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Number of records collected so far.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the collector, returning records in arrival order.
    pub fn into_records(self) -> Vec<(K, V)> {
        self.records.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Clone, V: Clone> Collector<K, V> {
    /// Snapshot of the records in arrival order.
    pub fn records(&self) -> Vec<(K, V)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<K, V> Output<K, V> for Collector<K, V> {
    fn write(&self, key: K, value: V) -> Result<(), OutputError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_reader_walks_records() {
        let mut reader = IterReader::new(vec![("a", 1), ("b", 2)]);

        assert!(reader.current_key().is_none());
        assert!(reader.advance().unwrap());
        assert_eq!(reader.current_key(), Some(&"a"));
        assert_eq!(reader.current_value(), Some(&1));
        assert!(reader.advance().unwrap());
        assert_eq!(reader.current_key(), Some(&"b"));
        assert!(!reader.advance().unwrap());
        assert!(reader.current_key().is_none());
    }

    #[test]
    fn test_iter_reader_rejects_reads_after_close() {
        let mut reader = IterReader::new(vec![("a", 1)]);
        reader.close().unwrap();

        assert!(reader.is_closed());
        assert!(matches!(reader.advance(), Err(ReadError::Closed)));
    }

    #[test]
    fn test_fallible_reader_surfaces_errors() {
        let mut reader = IterReader::fallible(vec![
            Ok(("a", 1)),
            Err(ReadError::Parse {
                line: 2,
                message: "bad".into(),
            }),
        ]);

        assert!(reader.advance().unwrap());
        let err = reader.advance().unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_collector_through_arc() {
        let collector = Arc::new(Collector::new());
        let output: &dyn Output<&str, i32> = &collector;

        output.write("a", 1).unwrap();
        output.write("b", 2).unwrap();

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.records(), vec![("a", 1), ("b", 2)]);
    }
}
