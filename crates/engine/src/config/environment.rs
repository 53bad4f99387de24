//! Layered property source
//!
//! Lookup order, highest priority first:
//! 1. explicit overrides ([`Environment::set`])
//! 2. environment variables, with relaxed binding (`email.host` is satisfied
//!    by `EMAIL_HOST`, `activiti.process-definitions.cache.max` by
//!    `ACTIVITI_PROCESS_DEFINITIONS_CACHE_MAX`)
//! 3. a YAML file, nested maps flattened to dotted keys
//! 4. defaults ([`Environment::set_default`])

use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use serde_yaml::Value as YamlValue;
use tracing::debug;

use super::ConfigError;

/// Environment variable naming the YAML file to load
pub const CONFIG_FILE_VAR: &str = "CONVEYOR_CONFIG";

/// File loaded when [`CONFIG_FILE_VAR`] is not set
pub const DEFAULT_CONFIG_FILE: &str = "application.yml";

#[derive(Debug, Clone, Default)]
pub struct Environment {
    overrides: HashMap<String, String>,
    variables: HashMap<String, String>,
    file: HashMap<String, String>,
    defaults: HashMap<String, String>,
}

/// Key form used for file, override and default lookups: lower case with
/// dashes and underscores dropped, so `cache.max-size`, `cache.max_size`
/// and `cache.maxSize` are the same property
fn canonical_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Environment variable name a property binds to
pub fn env_var_name(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

fn flatten_yaml(prefix: &str, value: &YamlValue, out: &mut HashMap<String, String>) {
    match value {
        YamlValue::Mapping(map) => {
            for (k, v) in map {
                let key = match k {
                    YamlValue::String(s) => s.clone(),
                    YamlValue::Number(n) => n.to_string(),
                    YamlValue::Bool(b) => b.to_string(),
                    _ => continue,
                };
                let full = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_yaml(&full, v, out);
            }
        }
        YamlValue::Sequence(items) => {
            let joined: Vec<String> = items.iter().filter_map(scalar_text).collect();
            out.insert(canonical_key(prefix), joined.join(","));
        }
        YamlValue::Tagged(tagged) => flatten_yaml(prefix, &tagged.value, out),
        other => {
            if let Some(text) = scalar_text(other) {
                out.insert(canonical_key(prefix), text);
            }
        }
    }
}

fn scalar_text(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        YamlValue::Null => Some(String::new()),
        _ => None,
    }
}

impl Environment {
    /// Empty environment; nothing is read from the process
    pub fn new() -> Self {
        Self::default()
    }

    /// Process environment variables plus the YAML file, if present
    pub fn from_process() -> Result<Self, ConfigError> {
        let mut env = Self::new().with_variables(std::env::vars());
        let path = env
            .variables
            .get(CONFIG_FILE_VAR)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        if Path::new(&path).exists() {
            env.load_yaml_file(&path)?;
        } else {
            debug!(path = %path, "no configuration file");
        }
        Ok(env)
    }

    /// Use the given name/value pairs as environment variables
    pub fn with_variables<I, K, V>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.variables = variables
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn with_yaml(mut self, source: &str) -> Result<Self, ConfigError> {
        self.merge_yaml(source)?;
        Ok(self)
    }

    pub fn load_yaml_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        self.merge_yaml(&source)?;
        debug!(path = %path.display(), properties = self.file.len(), "loaded configuration file");
        Ok(())
    }

    fn merge_yaml(&mut self, source: &str) -> Result<(), ConfigError> {
        let value: YamlValue =
            serde_yaml::from_str(source).map_err(|e| ConfigError::Yaml(e.to_string()))?;
        flatten_yaml("", &value, &mut self.file);
        Ok(())
    }

    /// Set a property, overriding every other source
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.overrides.insert(canonical_key(key), value.into());
    }

    /// Fallback used when no source defines the property
    pub fn set_default(&mut self, key: &str, value: impl Into<String>) {
        self.defaults.insert(canonical_key(key), value.into());
    }

    /// Raw property value, if any source defines it
    pub fn get_property(&self, key: &str) -> Option<String> {
        let canonical = canonical_key(key);
        self.overrides
            .get(&canonical)
            .or_else(|| self.variables.get(&env_var_name(key)))
            .or_else(|| self.file.get(&canonical))
            .or_else(|| self.defaults.get(&canonical))
            .cloned()
    }

    pub fn contains_property(&self, key: &str) -> bool {
        self.get_property(key).is_some()
    }

    /// Defined with at least one character; whitespace counts
    pub fn is_not_empty(&self, key: &str) -> bool {
        self.get_property(key).is_some_and(|value| !value.is_empty())
    }

    /// Parsed property; blank values count as absent
    pub fn get_typed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get_property(key) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                    message: e.to_string(),
                }),
            _ => Ok(None),
        }
    }

    /// Boolean property in any letter case: `true`/`on`/`yes`/`1` or
    /// `false`/`off`/`no`/`0`; blank values count as absent
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.get_property(key) else {
            return Ok(None);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "true" | "on" | "yes" | "1" => Ok(Some(true)),
            "false" | "off" | "no" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                message: "expected true/false, on/off, yes/no or 1/0".to_string(),
            }),
        }
    }

    pub fn get_required<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get_typed(key)?
            .ok_or_else(|| ConfigError::MissingProperty(key.to_string()))
    }

    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.get_typed(key)?.unwrap_or(default))
    }
}
