//! Built-in mappings over JSON records.
//!
//! Keys are strings and values arbitrary JSON. Every mapping is registered
//! by name so pipelines can refer to it from a step.

use serde_json::Value;
use std::sync::Arc;
use xylem::{
    Identity, MapError, Mapping, MappingDecl, MappingRegistry, Options, Output, RegistryError,
    Stage,
};

/// Register every built-in mapping.
pub fn register_all(registry: &mut MappingRegistry<String, Value>) {
    registry.register(
        MappingDecl::new("identity").description("Pass records through unchanged"),
        |_| Ok(Arc::new(Identity) as Stage<String, Value>),
    );

    registry.register(
        MappingDecl::new("scale").description("Multiply numeric values by `factor`"),
        |options| {
            let factor = number(options, "scale", "factor")?;
            Ok(Arc::new(Scale { factor }) as Stage<String, Value>)
        },
    );

    registry.register(
        MappingDecl::new("prefix-key").description("Prepend `prefix` to every key"),
        |options| {
            let prefix = string(options, "prefix-key", "prefix")?;
            Ok(Arc::new(PrefixKey { prefix }) as Stage<String, Value>)
        },
    );

    registry.register(
        MappingDecl::new("uppercase-key").description("Convert keys to uppercase"),
        |_| Ok(Arc::new(UppercaseKey) as Stage<String, Value>),
    );

    registry.register(
        MappingDecl::new("filter").description("Keep records whose numeric value is >= `min`"),
        |options| {
            let min = number(options, "filter", "min")?;
            Ok(Arc::new(Filter { min }) as Stage<String, Value>)
        },
    );

    registry.register(
        MappingDecl::new("explode").description("Emit one record per element of array values"),
        |_| Ok(Arc::new(Explode) as Stage<String, Value>),
    );

    registry.register(
        MappingDecl::new("fail-on").description("Reject records whose key equals `key`"),
        |options| {
            let key = string(options, "fail-on", "key")?;
            Ok(Arc::new(FailOn { key }) as Stage<String, Value>)
        },
    );
}

fn required<'a>(
    options: &'a Options,
    mapping: &str,
    name: &str,
) -> Result<&'a Value, RegistryError> {
    options.get(name).ok_or_else(|| RegistryError::MissingOption {
        mapping: mapping.to_string(),
        option: name.to_string(),
    })
}

fn number(options: &Options, mapping: &str, name: &str) -> Result<f64, RegistryError> {
    required(options, mapping, name)?
        .as_f64()
        .ok_or_else(|| RegistryError::InvalidOption {
            mapping: mapping.to_string(),
            option: name.to_string(),
            message: "expected a number".into(),
        })
}

fn string(options: &Options, mapping: &str, name: &str) -> Result<String, RegistryError> {
    required(options, mapping, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RegistryError::InvalidOption {
            mapping: mapping.to_string(),
            option: name.to_string(),
            message: "expected a string".into(),
        })
}

fn numeric(key: &str, value: &Value) -> Result<f64, MapError> {
    value
        .as_f64()
        .ok_or_else(|| MapError::InvalidRecord(format!("value of '{key}' is not a number")))
}

/// Multiplies numeric values. Integers stay integers when the factor is whole.
pub struct Scale {
    factor: f64,
}

impl Mapping<String, Value> for Scale {
    type OutKey = String;
    type OutValue = Value;

    fn map(
        &self,
        key: &String,
        value: &Value,
        output: &dyn Output<String, Value>,
    ) -> Result<(), MapError> {
        let whole = self.factor.fract() == 0.0;
        let scaled = match value.as_i64() {
            Some(n) if whole => n.checked_mul(self.factor as i64).map(Value::from),
            _ => None,
        };

        let scaled = match scaled {
            Some(v) => v,
            None => {
                let n = numeric(key, value)? * self.factor;
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .ok_or_else(|| MapError::InvalidRecord(format!("'{key}' scaled to {n}")))?
            }
        };

        output.write(key.clone(), scaled)?;
        Ok(())
    }
}

pub struct PrefixKey {
    prefix: String,
}

impl Mapping<String, Value> for PrefixKey {
    type OutKey = String;
    type OutValue = Value;

    fn map(
        &self,
        key: &String,
        value: &Value,
        output: &dyn Output<String, Value>,
    ) -> Result<(), MapError> {
        output.write(format!("{}{}", self.prefix, key), value.clone())?;
        Ok(())
    }
}

pub struct UppercaseKey;

impl Mapping<String, Value> for UppercaseKey {
    type OutKey = String;
    type OutValue = Value;

    fn map(
        &self,
        key: &String,
        value: &Value,
        output: &dyn Output<String, Value>,
    ) -> Result<(), MapError> {
        output.write(key.to_uppercase(), value.clone())?;
        Ok(())
    }
}

pub struct Filter {
    min: f64,
}

impl Mapping<String, Value> for Filter {
    type OutKey = String;
    type OutValue = Value;

    fn map(
        &self,
        key: &String,
        value: &Value,
        output: &dyn Output<String, Value>,
    ) -> Result<(), MapError> {
        if numeric(key, value)? >= self.min {
            output.write(key.clone(), value.clone())?;
        }
        Ok(())
    }
}

/// Fans array values out into one record per element; other values pass.
pub struct Explode;

impl Mapping<String, Value> for Explode {
    type OutKey = String;
    type OutValue = Value;

    fn map(
        &self,
        key: &String,
        value: &Value,
        output: &dyn Output<String, Value>,
    ) -> Result<(), MapError> {
        match value {
            Value::Array(items) => {
                for item in items {
                    output.write(key.clone(), item.clone())?;
                }
            }
            other => output.write(key.clone(), other.clone())?,
        }
        Ok(())
    }
}

pub struct FailOn {
    key: String,
}

impl Mapping<String, Value> for FailOn {
    type OutKey = String;
    type OutValue = Value;

    fn map(
        &self,
        key: &String,
        value: &Value,
        output: &dyn Output<String, Value>,
    ) -> Result<(), MapError> {
        if *key == self.key {
            return Err(MapError::failed(format!("record '{key}' rejected")));
        }
        output.write(key.clone(), value.clone())?;
        Ok(())
    }
}
