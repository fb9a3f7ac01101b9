//! Dependency records
//!
//! A dependency is a tagged variant discriminated by key presence: `job`
//! (or `query`) references another committed job, `repository` + `commit`
//! pin a git commit. Mixed records are invalid. Records are normalized at
//! parse time and hashed in canonical form with `query` stripped.

mod resolve;

pub use resolve::{resolve_queries, resolve_refs, QueryResolver, ResolveError};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::canonical::{self, EncodingError};
use crate::hash;
use crate::manifest::{MANIFEST_FILE, METADATA_FILE, OUTPUT_DIR};

/// Errors for dependency record validation and hashing
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("dependency record must be a mapping")]
    NotAMapping,

    #[error("missing destination")]
    MissingDestination,

    #[error("record mixes job and repository keys")]
    MixedKeys,

    #[error("record names neither a job (or query) nor a repository")]
    MissingTarget,

    #[error("git dependency is missing commit")]
    MissingCommit,

    #[error("{field} must be a string")]
    NotAString { field: &'static str },

    #[error("{field} {value:?}: {reason}")]
    InvalidPath {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid job id {id:?}: expected 64 lowercase hex digits")]
    InvalidJobId { id: String },

    #[error("invalid repository url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unknown key {key:?}")]
    UnknownKey { key: String },

    #[error("query {query:?} has not been resolved to a job id")]
    UnresolvedQuery { query: String },

    #[error("commit {commit:?} is not a full object id")]
    SymbolicCommit { commit: String },

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Dependency on another committed job.
///
/// `job` is `None` while the record still carries an unresolved `query`;
/// query expansion fills it in before hashing. The `query` text is retained
/// for provenance and never participates in the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDependency {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    pub source: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Dependency on a git commit, keyed by normalized repository URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitDependency {
    pub repository: String,
    pub commit: String,
    pub source: String,
    pub destination: String,
}

/// A normalized dependency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Dependency {
    Job(JobDependency),
    Git(GitDependency),
}

impl Dependency {
    /// Parse and normalize a record from a manifest value.
    ///
    /// Fills the default `source = ""`, rejects missing `destination`,
    /// rejects mixed `job`/`repository` keys, and rewrites `repository`
    /// to its normalized `host/path` form.
    pub fn from_value(value: &Value) -> Result<Self, DependencyError> {
        let map = value.as_object().ok_or(DependencyError::NotAMapping)?;

        for key in map.keys() {
            match key.as_str() {
                "job" | "query" | "repository" | "commit" | "source" | "destination" => {}
                other => {
                    return Err(DependencyError::UnknownKey {
                        key: other.to_string(),
                    })
                }
            }
        }

        let has_job = map.contains_key("job") || map.contains_key("query");
        let has_git = map.contains_key("repository") || map.contains_key("commit");
        if has_job && has_git {
            return Err(DependencyError::MixedKeys);
        }
        if !has_job && !has_git {
            return Err(DependencyError::MissingTarget);
        }

        let destination = require_string(map, "destination")?
            .ok_or(DependencyError::MissingDestination)?;
        validate_relative_path("destination", &destination, false)?;
        validate_destination(&destination)?;

        let source = require_string(map, "source")?.unwrap_or_default();
        validate_relative_path("source", &source, true)?;

        if has_job {
            let job = require_string(map, "job")?;
            if let Some(id) = &job {
                if !is_job_id(id) {
                    return Err(DependencyError::InvalidJobId { id: id.clone() });
                }
            }
            let query = require_string(map, "query")?;
            Ok(Dependency::Job(JobDependency {
                job,
                source,
                destination,
                query,
            }))
        } else {
            let url = require_string(map, "repository")?
                .ok_or(DependencyError::MissingTarget)?;
            let repository = crate::store::git::normalize_url(&url).map_err(|reason| {
                DependencyError::InvalidUrl {
                    url: url.clone(),
                    reason,
                }
            })?;
            let commit =
                require_string(map, "commit")?.ok_or(DependencyError::MissingCommit)?;
            if commit.is_empty() {
                return Err(DependencyError::MissingCommit);
            }
            Ok(Dependency::Git(GitDependency {
                repository,
                commit,
                source,
                destination,
            }))
        }
    }

    pub fn destination(&self) -> &str {
        match self {
            Dependency::Job(d) => &d.destination,
            Dependency::Git(d) => &d.destination,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Dependency::Job(d) => &d.source,
            Dependency::Git(d) => &d.source,
        }
    }

    /// The canonical form of this record: `query` stripped, `source`
    /// explicit, keys in canonical order. Fails while a query is
    /// unresolved or a commit is still symbolic.
    pub fn canonical_value(&self) -> Result<Value, DependencyError> {
        let mut out = Map::new();
        match self {
            Dependency::Job(d) => {
                let job = d.job.as_ref().ok_or_else(|| DependencyError::UnresolvedQuery {
                    query: d.query.clone().unwrap_or_default(),
                })?;
                out.insert("destination".to_string(), Value::String(d.destination.clone()));
                out.insert("job".to_string(), Value::String(job.clone()));
                out.insert("source".to_string(), Value::String(d.source.clone()));
            }
            Dependency::Git(d) => {
                if !hash::is_full_object_id(&d.commit) {
                    return Err(DependencyError::SymbolicCommit {
                        commit: d.commit.clone(),
                    });
                }
                out.insert("commit".to_string(), Value::String(d.commit.clone()));
                out.insert("destination".to_string(), Value::String(d.destination.clone()));
                out.insert("repository".to_string(), Value::String(d.repository.clone()));
                out.insert("source".to_string(), Value::String(d.source.clone()));
            }
        }
        Ok(Value::Object(out))
    }

    /// The entry this record contributes to the job hash:
    /// `(destination, SHA-256 of the canonical record)`.
    pub fn hash_entry(&self) -> Result<(String, String), DependencyError> {
        let bytes = canonical::to_canonical_bytes(&self.canonical_value()?)?;
        Ok((self.destination().to_string(), hash::sha256_bytes(&bytes)))
    }
}

/// Check whether a string has the form of a job identifier
/// (64 lowercase hex digits).
pub fn is_job_id(s: &str) -> bool {
    s.len() == 64
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn require_string(
    map: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, DependencyError> {
    match map.get(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DependencyError::NotAString { field }),
    }
}

fn validate_relative_path(
    field: &'static str,
    value: &str,
    allow_empty: bool,
) -> Result<(), DependencyError> {
    let invalid = |reason: &str| DependencyError::InvalidPath {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        if allow_empty {
            return Ok(());
        }
        return Err(invalid("must not be empty"));
    }
    if value.starts_with('/') {
        return Err(invalid("must be relative"));
    }
    if value.contains('\\') {
        return Err(invalid("must use forward slashes"));
    }
    for segment in value.split('/') {
        match segment {
            "" => return Err(invalid("contains an empty segment")),
            "." | ".." => return Err(invalid("must not contain . or .. segments")),
            _ => {}
        }
    }
    Ok(())
}

fn validate_destination(destination: &str) -> Result<(), DependencyError> {
    let reserved = destination == MANIFEST_FILE
        || destination == METADATA_FILE
        || destination == OUTPUT_DIR
        || destination.starts_with(&format!("{}/", OUTPUT_DIR));
    if reserved {
        return Err(DependencyError::InvalidPath {
            field: "destination",
            value: destination.to_string(),
            reason: "reserved path".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_record() -> Value {
        json!({
            "job": "a".repeat(64),
            "destination": "data",
        })
    }

    fn git_record() -> Value {
        json!({
            "repository": "github.com/owner/repo",
            "commit": "b".repeat(40),
            "destination": "src",
        })
    }

    #[test]
    fn test_job_record_defaults_source() {
        let dep = Dependency::from_value(&job_record()).unwrap();
        assert_eq!(dep.source(), "");
        assert_eq!(dep.destination(), "data");
    }

    #[test]
    fn test_git_record_normalizes_url() {
        let record = json!({
            "repository": "https://github.com/owner/repo.git",
            "commit": "b".repeat(40),
            "destination": "src",
        });
        match Dependency::from_value(&record).unwrap() {
            Dependency::Git(d) => assert_eq!(d.repository, "github.com/owner/repo"),
            other => panic!("expected git dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_mixed_keys_rejected() {
        let record = json!({
            "job": "a".repeat(64),
            "repository": "github.com/owner/repo",
            "destination": "x",
        });
        assert!(matches!(
            Dependency::from_value(&record),
            Err(DependencyError::MixedKeys)
        ));
    }

    #[test]
    fn test_missing_destination_rejected() {
        let record = json!({"job": "a".repeat(64)});
        assert!(matches!(
            Dependency::from_value(&record),
            Err(DependencyError::MissingDestination)
        ));
    }

    #[test]
    fn test_escaping_destination_rejected() {
        for destination in ["/etc/passwd", "../sibling", "a/../b", "a//b"] {
            let record = json!({"job": "a".repeat(64), "destination": destination});
            let err = Dependency::from_value(&record).unwrap_err();
            assert!(
                matches!(err, DependencyError::InvalidPath { field: "destination", .. }),
                "{:?} should be rejected, got {:?}",
                destination,
                err
            );
        }
    }

    #[test]
    fn test_reserved_destination_rejected() {
        for destination in ["r3.yaml", "metadata.yaml", "output", "output/result"] {
            let record = json!({"job": "a".repeat(64), "destination": destination});
            assert!(
                Dependency::from_value(&record).is_err(),
                "{:?} should be rejected",
                destination
            );
        }
    }

    #[test]
    fn test_short_job_id_rejected() {
        let record = json!({"job": "abc123", "destination": "data"});
        assert!(matches!(
            Dependency::from_value(&record),
            Err(DependencyError::InvalidJobId { .. })
        ));
    }

    #[test]
    fn test_query_without_job_allowed() {
        let record = json!({"query": "latest", "destination": "data"});
        match Dependency::from_value(&record).unwrap() {
            Dependency::Job(d) => {
                assert_eq!(d.job, None);
                assert_eq!(d.query.as_deref(), Some("latest"));
            }
            other => panic!("expected job dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_hash_entry_strips_query() {
        let with_query = json!({
            "job": "a".repeat(64),
            "destination": "data",
            "query": "latest",
        });
        let without_query = job_record();

        let a = Dependency::from_value(&with_query).unwrap().hash_entry().unwrap();
        let b = Dependency::from_value(&without_query).unwrap().hash_entry().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_entry_sensitive_to_fields() {
        let base = Dependency::from_value(&git_record()).unwrap().hash_entry().unwrap();

        let mut other = git_record();
        other["commit"] = json!("c".repeat(40));
        let changed = Dependency::from_value(&other).unwrap().hash_entry().unwrap();
        assert_ne!(base.1, changed.1);

        let mut other = git_record();
        other["source"] = json!("subdir");
        let changed = Dependency::from_value(&other).unwrap().hash_entry().unwrap();
        assert_ne!(base.1, changed.1);
    }

    #[test]
    fn test_hash_entry_rejects_symbolic_commit() {
        let record = json!({
            "repository": "github.com/owner/repo",
            "commit": "main",
            "destination": "src",
        });
        let dep = Dependency::from_value(&record).unwrap();
        assert!(matches!(
            dep.hash_entry(),
            Err(DependencyError::SymbolicCommit { .. })
        ));
    }

    #[test]
    fn test_hash_entry_rejects_unresolved_query() {
        let record = json!({"query": "latest", "destination": "data"});
        let dep = Dependency::from_value(&record).unwrap();
        assert!(matches!(
            dep.hash_entry(),
            Err(DependencyError::UnresolvedQuery { .. })
        ));
    }
}
