//! Job manifest (r3.yaml)
//!
//! The manifest is the declarative description of a job. The hashed keys
//! (`dependencies`, `environment`, `commands`, `parameters`, `files`)
//! participate in the job identity; `ignore` does not. Numeric values in the
//! opaque maps must be integers or strings so they survive canonical
//! encoding byte-for-byte.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::canonical;
use crate::dependency::{Dependency, DependencyError};
use crate::hash;

/// Reserved file name: the manifest itself (hashed, immutable once committed).
pub const MANIFEST_FILE: &str = "r3.yaml";

/// Reserved file name: mutable annotations (never hashed).
pub const METADATA_FILE: &str = "metadata.yaml";

/// Reserved directory name: mutable results (never hashed).
pub const OUTPUT_DIR: &str = "output";

/// Error for manifest parsing and validation, carrying the offending
/// file or key location.
#[derive(Debug, thiserror::Error)]
#[error("{path}: {reason}")]
pub struct ConfigError {
    pub reason: String,
    pub path: String,
}

impl ConfigError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            path: path.into(),
        }
    }
}

/// A parsed, normalized job manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Manifest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,

    #[serde(skip_serializing_if = "Map::is_empty")]
    pub environment: Map<String, Value>,

    #[serde(skip_serializing_if = "Map::is_empty")]
    pub commands: Map<String, Value>,

    #[serde(skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,

    /// Relative path to file digest, recorded at commit time. Absent in the
    /// user-supplied staging form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// Load and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::new(&origin, format!("cannot read manifest: {}", e)))?;
        Self::from_yaml_str(&text, &origin)
    }

    /// Parse and validate a manifest from YAML text. `origin` names the
    /// source in error messages.
    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| ConfigError::new(origin, format!("invalid YAML: {}", e)))?;
        Self::from_value(&value, origin)
    }

    fn from_value(value: &Value, origin: &str) -> Result<Self, ConfigError> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            _ => return Err(ConfigError::new(origin, "manifest must be a mapping")),
        };

        let mut manifest = Self::default();
        for (key, entry) in map {
            match key.as_str() {
                "dependencies" => {
                    manifest.dependencies = parse_dependencies(entry, origin)?;
                }
                "ignore" => {
                    manifest.ignore = parse_ignore(entry, origin)?;
                }
                "environment" => {
                    manifest.environment = parse_opaque_map(entry, origin, "environment")?;
                }
                "commands" => {
                    manifest.commands = parse_opaque_map(entry, origin, "commands")?;
                }
                "parameters" => {
                    manifest.parameters = parse_opaque_map(entry, origin, "parameters")?;
                }
                "files" => {
                    manifest.files = Some(parse_files(entry, origin)?);
                }
                other => {
                    return Err(ConfigError::new(
                        origin,
                        format!("unknown manifest key {:?}", other),
                    ));
                }
            }
        }
        Ok(manifest)
    }

    /// The hashed subset of the manifest: `commands`, `dependencies`
    /// (canonical, query-stripped), `environment`, `parameters`. Empty keys
    /// are omitted so an absent key and an empty one encode identically.
    /// `ignore` and `files` never enter the subset.
    pub fn hashed_subset(&self) -> Result<Value, DependencyError> {
        let mut subset = Map::new();
        if !self.commands.is_empty() {
            subset.insert("commands".to_string(), Value::Object(self.commands.clone()));
        }
        if !self.dependencies.is_empty() {
            let records = self
                .dependencies
                .iter()
                .map(Dependency::canonical_value)
                .collect::<Result<Vec<_>, _>>()?;
            subset.insert("dependencies".to_string(), Value::Array(records));
        }
        if !self.environment.is_empty() {
            subset.insert(
                "environment".to_string(),
                Value::Object(self.environment.clone()),
            );
        }
        if !self.parameters.is_empty() {
            subset.insert(
                "parameters".to_string(),
                Value::Object(self.parameters.clone()),
            );
        }
        Ok(Value::Object(subset))
    }

    /// Digest of the canonical encoding of the hashed subset. This is the
    /// digest recorded under the `r3.yaml` key of the committed `files` map.
    pub fn subset_digest(&self) -> Result<String, DependencyError> {
        let bytes = canonical::to_canonical_bytes(&self.hashed_subset()?)?;
        Ok(hash::sha256_bytes(&bytes))
    }

    /// The committed form: this manifest with the `files` map frozen in.
    pub fn frozen(&self, files: BTreeMap<String, String>) -> Self {
        let mut committed = self.clone();
        committed.files = Some(files);
        committed
    }

    /// Write the manifest as YAML.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, text)
    }
}

fn parse_dependencies(value: &Value, origin: &str) -> Result<Vec<Dependency>, ConfigError> {
    let items = value.as_array().ok_or_else(|| {
        ConfigError::new(origin, "dependencies must be a sequence of mappings")
    })?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            Dependency::from_value(item).map_err(|e| {
                ConfigError::new(origin, format!("dependencies[{}]: {}", index, e))
            })
        })
        .collect()
}

fn parse_ignore(value: &Value, origin: &str) -> Result<Vec<String>, ConfigError> {
    let items = value
        .as_array()
        .ok_or_else(|| ConfigError::new(origin, "ignore must be a list of strings"))?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ConfigError::new(origin, format!("ignore[{}] must be a string", index))
            })
        })
        .collect()
}

fn parse_opaque_map(
    value: &Value,
    origin: &str,
    key: &str,
) -> Result<Map<String, Value>, ConfigError> {
    let map = value
        .as_object()
        .ok_or_else(|| ConfigError::new(origin, format!("{} must be a mapping", key)))?;
    canonical::reject_floats(value, key)
        .map_err(|e| ConfigError::new(origin, e.to_string()))?;
    Ok(map.clone())
}

fn parse_files(value: &Value, origin: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let map = value
        .as_object()
        .ok_or_else(|| ConfigError::new(origin, "files must be a mapping of path to digest"))?;
    let mut files = BTreeMap::new();
    for (path, digest) in map {
        let digest = digest.as_str().ok_or_else(|| {
            ConfigError::new(origin, format!("files[{:?}] must be a string digest", path))
        })?;
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::new(
                origin,
                format!("files[{:?}] is not a 64-hex digest", path),
            ));
        }
        files.insert(path.clone(), digest.to_string());
    }
    Ok(files)
}
