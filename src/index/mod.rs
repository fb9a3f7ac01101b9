//! Metadata index
//!
//! A derived lookup cache (`index.yaml`) over the committed jobs. The store
//! notifies it after commits and removals on a best-effort basis; failures
//! are logged and swallowed. The cache is never authoritative and can
//! always be rebuilt by scanning `jobs/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

use crate::manifest::{Manifest, METADATA_FILE};
use crate::store::{JobMetadata, Repository, StoreError, JOBS_DIR};

/// Index file at the repository root.
pub const INDEX_FILE: &str = "index.yaml";

/// Errors for index operations
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid index: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One cached job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// The on-disk index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    #[serde(default)]
    pub jobs: BTreeMap<String, IndexEntry>,
}

impl Index {
    /// Load the index; a missing file is an empty index.
    pub fn load(repo_root: &Path) -> Result<Self, IndexError> {
        let path = repo_root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn save(&self, repo_root: &Path) -> Result<(), IndexError> {
        let text = serde_yaml::to_string(self)?;
        fs::write(repo_root.join(INDEX_FILE), text)?;
        Ok(())
    }

    /// Rebuild from the source of truth, scanning `jobs/`, and persist the
    /// result.
    pub fn rebuild(repo: &Repository) -> Result<Self, IndexError> {
        let mut index = Self::default();
        for id in repo.job_ids()? {
            let manifest = repo.load_manifest(&id)?;
            let metadata = JobMetadata::load(&repo.job_dir(&id).join(METADATA_FILE))
                .unwrap_or_default();
            index.jobs.insert(id, entry_for(&manifest, &metadata));
        }
        index.save(repo.root())?;
        Ok(index)
    }
}

fn entry_for(manifest: &Manifest, metadata: &JobMetadata) -> IndexEntry {
    IndexEntry {
        committed_at: metadata.committed_at,
        parameters: manifest.parameters.clone(),
    }
}

/// Record a freshly committed job. Best-effort: a failure leaves the cache
/// stale until the next rebuild.
pub fn notify_committed(repo_root: &Path, id: &str, manifest: &Manifest) {
    let result = (|| -> Result<(), IndexError> {
        let mut index = Index::load(repo_root)?;
        let metadata =
            JobMetadata::load(&repo_root.join(JOBS_DIR).join(id).join(METADATA_FILE))
                .unwrap_or_default();
        index.jobs.insert(id.to_string(), entry_for(manifest, &metadata));
        index.save(repo_root)
    })();
    if let Err(err) = result {
        warn!(id = %id, error = %err, "index update failed; run rebuild-index");
    }
}

/// Drop a removed job from the cache. Best-effort.
pub fn notify_removed(repo_root: &Path, id: &str) {
    let result = (|| -> Result<(), IndexError> {
        let mut index = Index::load(repo_root)?;
        index.jobs.remove(id);
        index.save(repo_root)
    })();
    if let Err(err) = result {
        warn!(id = %id, error = %err, "index update failed; run rebuild-index");
    }
}
