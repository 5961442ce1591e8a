//! Registry of named mapping factories.
//!
//! Pipelines refer to mappings by name; the registry turns a list of
//! [`Step`]s into a [`MappingChain`].

use crate::chain::{MappingChain, Stage};
use crate::config::{Options, Step};
use indexmap::IndexMap;
use std::sync::Arc;

/// Declaration of a registered mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingDecl {
    /// Unique name used in pipeline steps.
    pub id: String,
    /// Human-readable description.
    pub description: String,
}

impl MappingDecl {
    /// Create a new declaration.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
        }
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }
}

/// Builds a stage from step options.
pub type StageFactory<K, V> =
    Arc<dyn Fn(&Options) -> Result<Stage<K, V>, RegistryError> + Send + Sync>;

/// Registry of mappings over one record type.
pub struct MappingRegistry<K, V> {
    /// Declarations indexed by ID.
    declarations: IndexMap<String, MappingDecl>,
    /// Factories indexed by ID.
    factories: IndexMap<String, StageFactory<K, V>>,
}

impl<K, V> Clone for MappingRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            declarations: self.declarations.clone(),
            factories: self.factories.clone(),
        }
    }
}

impl<K, V> Default for MappingRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MappingRegistry<K, V> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            declarations: IndexMap::new(),
            factories: IndexMap::new(),
        }
    }

    /// Register a mapping factory.
    pub fn register<F>(&mut self, decl: MappingDecl, factory: F)
    where
        F: Fn(&Options) -> Result<Stage<K, V>, RegistryError> + Send + Sync + 'static,
    {
        let id = decl.id.clone();
        self.declarations.insert(id.clone(), decl);
        self.factories.insert(id, Arc::new(factory));
    }

    /// Get a declaration by ID.
    pub fn get_decl(&self, id: &str) -> Option<&MappingDecl> {
        self.declarations.get(id)
    }

    /// Iterate over all declarations.
    pub fn declarations(&self) -> impl Iterator<Item = &MappingDecl> {
        self.declarations.values()
    }

    /// Build one stage.
    pub fn build(&self, id: &str, options: &Options) -> Result<Stage<K, V>, RegistryError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| RegistryError::UnknownMapping(id.to_string()))?;
        factory(options)
    }

    /// Build a chain from pipeline steps, first step first.
    pub fn build_chain(&self, steps: &[Step]) -> Result<MappingChain<K, V>, RegistryError> {
        let stages = steps
            .iter()
            .map(|step| self.build(&step.mapping, &step.options))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MappingChain::from_stages(stages))
    }

    /// Number of registered mappings.
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

/// Errors raised while building mappings from configuration.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown mapping: {0}")]
    UnknownMapping(String),

    #[error("mapping {mapping}: missing required option '{option}'")]
    MissingOption { mapping: String, option: String },

    #[error("mapping {mapping}: invalid option '{option}': {message}")]
    InvalidOption {
        mapping: String,
        option: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Identity, Mapping, from_fn};
    use crate::record::{Collector, Output};

    fn make_test_registry() -> MappingRegistry<String, i64> {
        let mut registry = MappingRegistry::new();

        registry.register(
            MappingDecl::new("identity").description("Pass records through"),
            |_| Ok(Arc::new(Identity) as Stage<String, i64>),
        );

        registry.register(MappingDecl::new("add"), |options| {
            let n = options
                .get("n")
                .ok_or_else(|| RegistryError::MissingOption {
                    mapping: "add".into(),
                    option: "n".into(),
                })?
                .as_i64()
                .ok_or_else(|| RegistryError::InvalidOption {
                    mapping: "add".into(),
                    option: "n".into(),
                    message: "expected an integer".into(),
                })?;
            let stage = from_fn(move |k: &String, v: &i64, out: &dyn Output<String, i64>| {
                out.write(k.clone(), v + n)?;
                Ok(())
            });
            Ok(Arc::new(stage) as Stage<String, i64>)
        });

        registry
    }

    #[test]
    fn test_declarations() {
        let registry = make_test_registry();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get_decl("identity").unwrap().description,
            "Pass records through"
        );
        assert!(registry.get_decl("nonexistent").is_none());
    }

    #[test]
    fn test_build_chain() {
        let registry = make_test_registry();
        let steps = vec![
            Step::new("add").option("n", 2),
            Step::new("identity"),
            Step::new("add").option("n", 10),
        ];

        let chain = registry.build_chain(&steps).unwrap();
        let out = Collector::new();
        chain.map(&"a".to_string(), &1, &out).unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(out.into_records(), vec![("a".to_string(), 13)]);
    }

    #[test]
    fn test_unknown_mapping() {
        let registry = make_test_registry();
        let err = registry.build_chain(&[Step::new("nope")]).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownMapping(id) if id == "nope"));
    }

    #[test]
    fn test_option_errors() {
        let registry = make_test_registry();

        let missing = registry.build("add", &Options::new()).err().unwrap();
        assert!(matches!(missing, RegistryError::MissingOption { .. }));

        let invalid = registry
            .build_chain(&[Step::new("add").option("n", "two")])
            .unwrap_err();
        assert!(invalid.to_string().contains("expected an integer"));
    }
}
