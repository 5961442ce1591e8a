//! Mapping trait and the trivial mappings built on it.

use crate::record::{Output, OutputError};
use std::marker::PhantomData;
use std::sync::Arc;

/// A transform from one input record to zero or more output records.
///
/// Mappings are shared by every worker of an executor, so one instance may
/// be invoked concurrently for independent records.
pub trait Mapping<K, V>: Send + Sync {
    type OutKey;
    type OutValue;

    /// Transform one record, writing any results to `output`.
    fn map(
        &self,
        key: &K,
        value: &V,
        output: &dyn Output<Self::OutKey, Self::OutValue>,
    ) -> Result<(), MapError>;
}

impl<K, V, M: Mapping<K, V> + ?Sized> Mapping<K, V> for Arc<M> {
    type OutKey = M::OutKey;
    type OutValue = M::OutValue;

    fn map(
        &self,
        key: &K,
        value: &V,
        output: &dyn Output<Self::OutKey, Self::OutValue>,
    ) -> Result<(), MapError> {
        (**self).map(key, value, output)
    }
}

impl<K, V, M: Mapping<K, V> + ?Sized> Mapping<K, V> for Box<M> {
    type OutKey = M::OutKey;
    type OutValue = M::OutValue;

    fn map(
        &self,
        key: &K,
        value: &V,
        output: &dyn Output<Self::OutKey, Self::OutValue>,
    ) -> Result<(), MapError> {
        (**self).map(key, value, output)
    }
}

/// Errors raised by a mapping while processing one record.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("mapping failed: {0}")]
    Failed(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("failed to write output: {0}")]
    Output(#[from] OutputError),

    #[error("mapping panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl MapError {
    /// Create a generic failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        MapError::Failed(message.into())
    }
}

/// Writes every input record unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl<K: Clone, V: Clone> Mapping<K, V> for Identity {
    type OutKey = K;
    type OutValue = V;

    fn map(&self, key: &K, value: &V, output: &dyn Output<K, V>) -> Result<(), MapError> {
        output.write(key.clone(), value.clone())?;
        Ok(())
    }
}

/// A mapping backed by a closure. Built with [`from_fn`].
pub struct FnMapping<F, K2, V2> {
    f: F,
    _out: PhantomData<fn() -> (K2, V2)>,
}

/// Wrap a closure as a [`Mapping`].
///
/// ```
/// use xylem::{Mapping, MapError, Output, from_fn};
///
/// let double = from_fn(|key: &String, value: &i64, out: &dyn Output<String, i64>| {
///     out.write(key.clone(), value * 2)?;
///     Ok::<_, MapError>(())
/// });
/// # let _ = &double;
/// ```
pub fn from_fn<F, K, V, K2, V2>(f: F) -> FnMapping<F, K2, V2>
where
    F: Fn(&K, &V, &dyn Output<K2, V2>) -> Result<(), MapError> + Send + Sync,
{
    FnMapping {
        f,
        _out: PhantomData,
    }
}

impl<F, K, V, K2, V2> Mapping<K, V> for FnMapping<F, K2, V2>
where
    F: Fn(&K, &V, &dyn Output<K2, V2>) -> Result<(), MapError> + Send + Sync,
{
    type OutKey = K2;
    type OutValue = V2;

    fn map(&self, key: &K, value: &V, output: &dyn Output<K2, V2>) -> Result<(), MapError> {
        (self.f)(key, value, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Collector;

    #[test]
    fn test_identity_writes_input() {
        let out = Collector::new();
        Identity.map(&"a", &1, &out).unwrap();
        assert_eq!(out.into_records(), vec![("a", 1)]);
    }

    #[test]
    fn test_fn_mapping_can_fan_out() {
        let split = from_fn(|key: &&str, value: &i32, out: &dyn Output<String, i32>| {
            for i in 0..*value {
                out.write(format!("{key}{i}"), i)?;
            }
            Ok(())
        });

        let out = Collector::new();
        split.map(&"k", &3, &out).unwrap();

        assert_eq!(
            out.into_records(),
            vec![("k0".to_string(), 0), ("k1".to_string(), 1), ("k2".to_string(), 2)]
        );
    }

    #[test]
    fn test_fn_mapping_can_emit_nothing() {
        let skip = from_fn(|_: &&str, _: &i32, _: &dyn Output<&str, i32>| Ok(()));
        let out = Collector::new();
        skip.map(&"k", &3, &out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_output_error_converts() {
        struct Closed;
        impl Output<&'static str, i32> for Closed {
            fn write(&self, _: &'static str, _: i32) -> Result<(), OutputError> {
                Err(OutputError::Closed)
            }
        }

        let err = Identity.map(&"a", &1, &Closed).unwrap_err();
        assert!(matches!(err, MapError::Output(OutputError::Closed)));
    }
}
