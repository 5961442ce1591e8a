//! Chain composition: several mappings presented as one.
//!
//! Every stage except the last writes into a relay output whose `write`
//! feeds the record straight into the next stage's `map`. The last stage
//! writes to whatever output the composed mapping was handed. Relays live
//! on the stack of a single invocation, so a chain can be invoked from many
//! workers at once as long as its stages allow it.
//!
//! Two flavours exist:
//! - [`compose`] builds a [`Chain`] of two mappings whose types are checked
//!   at compile time; stage output types may differ from input types.
//! - [`MappingChain`] holds a runtime list of stages over one record type,
//!   for chains assembled from configuration.

use crate::mapping::{MapError, Mapping};
use crate::record::{Output, OutputError};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Two mappings run back to back. Built with [`compose`].
#[derive(Debug, Clone, Copy)]
pub struct Chain<A, B> {
    first: A,
    second: B,
}

/// Compose two mappings so that every record `first` writes is mapped by
/// `second`.
///
/// The output types of `first` must match the input types of `second`.
pub fn compose<A, B>(first: A, second: B) -> Chain<A, B> {
    Chain { first, second }
}

impl<A, B> Chain<A, B> {
    /// Split the chain back into its stages.
    pub fn into_inner(self) -> (A, B) {
        (self.first, self.second)
    }
}

impl<K, V, A, B> Mapping<K, V> for Chain<A, B>
where
    A: Mapping<K, V>,
    B: Mapping<A::OutKey, A::OutValue>,
{
    type OutKey = B::OutKey;
    type OutValue = B::OutValue;

    fn map(
        &self,
        key: &K,
        value: &V,
        output: &dyn Output<Self::OutKey, Self::OutValue>,
    ) -> Result<(), MapError> {
        let relay = Relay {
            next: &self.second,
            output,
            _input: PhantomData,
        };
        self.first.map(key, value, &relay)
    }
}

/// Output that forwards each write into the next stage.
struct Relay<'a, K, V, M: Mapping<K, V>> {
    next: &'a M,
    output: &'a dyn Output<M::OutKey, M::OutValue>,
    _input: PhantomData<fn(K, V)>,
}

impl<K, V, M: Mapping<K, V>> Output<K, V> for Relay<'_, K, V, M> {
    fn write(&self, key: K, value: V) -> Result<(), OutputError> {
        self.next
            .map(&key, &value, self.output)
            .map_err(|e| OutputError::Downstream(Box::new(e)))
    }
}

/// A shared, type-erased stage of a [`MappingChain`].
pub type Stage<K, V> = Arc<dyn Mapping<K, V, OutKey = K, OutValue = V>>;

/// A runtime-assembled chain of stages over a single record type.
///
/// An empty chain behaves as the identity mapping.
pub struct MappingChain<K, V> {
    stages: Vec<Stage<K, V>>,
}

impl<K, V> Clone for MappingChain<K, V> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<K, V> Default for MappingChain<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for MappingChain<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl<K, V> MappingChain<K, V> {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Create a chain from already shared stages, first stage first.
    pub fn from_stages(stages: Vec<Stage<K, V>>) -> Self {
        Self { stages }
    }

    /// Append a stage.
    pub fn stage<M>(mut self, mapping: M) -> Self
    where
        M: Mapping<K, V, OutKey = K, OutValue = V> + 'static,
    {
        self.stages.push(Arc::new(mapping));
        self
    }

    /// Append an already shared stage.
    pub fn push(&mut self, stage: Stage<K, V>) {
        self.stages.push(stage);
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<K: Clone, V: Clone> Mapping<K, V> for MappingChain<K, V> {
    type OutKey = K;
    type OutValue = V;

    fn map(&self, key: &K, value: &V, output: &dyn Output<K, V>) -> Result<(), MapError> {
        run_stages(&self.stages, key, value, output)
    }
}

fn run_stages<K: Clone, V: Clone>(
    stages: &[Stage<K, V>],
    key: &K,
    value: &V,
    output: &dyn Output<K, V>,
) -> Result<(), MapError> {
    match stages {
        [] => {
            output.write(key.clone(), value.clone())?;
            Ok(())
        }
        [last] => last.map(key, value, output),
        [stage, rest @ ..] => stage.map(key, value, &StageRelay { rest, output }),
    }
}

struct StageRelay<'a, K, V> {
    rest: &'a [Stage<K, V>],
    output: &'a dyn Output<K, V>,
}

impl<K: Clone, V: Clone> Output<K, V> for StageRelay<'_, K, V> {
    fn write(&self, key: K, value: V) -> Result<(), OutputError> {
        run_stages(self.rest, &key, &value, self.output)
            .map_err(|e| OutputError::Downstream(Box::new(e)))
    }
}
