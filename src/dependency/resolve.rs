//! Pre-commit resolution of dependency records
//!
//! Two passes run before a job is hashed: query expansion turns `query`
//! records into concrete job ids through an external engine, and ref
//! resolution rewrites symbolic git refs to full object ids.

use tracing::debug;

use crate::dependency::Dependency;
use crate::hash;
use crate::store::git::{GitCache, GitError};

/// Errors for dependency resolution
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no job matches query {query:?}")]
    DependencyNotFound { query: String },

    #[error("query {query:?} is ambiguous: {count} jobs match")]
    AmbiguousDependency { query: String, count: usize },

    #[error("cannot resolve {reference:?} in {repository}")]
    RefResolution {
        repository: String,
        reference: String,
    },

    #[error("query engine error: {0}")]
    QueryEngine(String),

    #[error(transparent)]
    Git(#[from] GitError),
}

/// External query engine interface.
///
/// Returns every job id matching a query; "all"/"latest" collapsing is the
/// engine's business. The core only accepts exactly one match.
pub trait QueryResolver {
    fn resolve(&self, query: &str) -> Result<Vec<String>, ResolveError>;
}

/// Expand `query` records into concrete job ids.
///
/// Records that already carry a job id are left alone; the query text is
/// retained on the record for provenance.
pub fn resolve_queries(
    dependencies: &mut [Dependency],
    resolver: Option<&dyn QueryResolver>,
) -> Result<(), ResolveError> {
    for dependency in dependencies.iter_mut() {
        let record = match dependency {
            Dependency::Job(record) if record.job.is_none() => record,
            _ => continue,
        };
        let query = record.query.clone().unwrap_or_default();
        let resolver = resolver.ok_or_else(|| {
            ResolveError::QueryEngine("no query engine configured".to_string())
        })?;

        let mut matches = resolver.resolve(&query)?;
        match matches.len() {
            0 => return Err(ResolveError::DependencyNotFound { query }),
            1 => {
                let id = matches.remove(0);
                debug!(query = %query, job = %id, "query resolved");
                record.job = Some(id);
            }
            count => return Err(ResolveError::AmbiguousDependency { query, count }),
        }
    }
    Ok(())
}

/// Rewrite symbolic git refs (branches, tags) to full object ids.
///
/// Resolution asks the bare clone first; on a miss the clone is fetched and
/// the ref is retried once before `RefResolution` is raised.
pub fn resolve_refs(
    dependencies: &mut [Dependency],
    git: &GitCache,
) -> Result<(), ResolveError> {
    for dependency in dependencies.iter_mut() {
        let record = match dependency {
            Dependency::Git(record) if !hash::is_full_object_id(&record.commit) => record,
            _ => continue,
        };
        let sha = git
            .resolve_ref(&record.repository, &record.commit)
            .map_err(|err| match err {
                GitError::RefNotFound { .. } => ResolveError::RefResolution {
                    repository: record.repository.clone(),
                    reference: record.commit.clone(),
                },
                other => ResolveError::Git(other),
            })?;
        debug!(repository = %record.repository, reference = %record.commit, commit = %sha,
               "git ref resolved");
        record.commit = sha;
    }
    Ok(())
}
