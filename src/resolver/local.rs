use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rdfc_processor::ir::IRDependency;
use tokio::fs;
use tracing::debug;

use super::{INDEX_FILE, PackageCache, Resolver, ResolverError};

/// Resolves `file:` dependencies by linking the package directory into the cache.
#[derive(Debug, Clone)]
pub struct LocalResolver {
    cache: PackageCache,
}

impl LocalResolver {
    pub fn new(cache: PackageCache) -> Self {
        Self { cache }
    }

    pub fn handles(uri: &str) -> bool {
        uri.starts_with("file:")
    }
}

/// `file:///a/b` → `/a/b`, `file:a/b` → `a/b`.
fn source_path(uri: &str) -> PathBuf {
    let rest = uri.strip_prefix("file:").unwrap_or(uri);
    PathBuf::from(rest.strip_prefix("//").unwrap_or(rest))
}

fn invalid(dependency: &IRDependency, path: &Path, reason: impl Into<String>) -> ResolverError {
    ResolverError::InvalidLocalPath {
        uri: dependency.uri.clone(),
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

#[async_trait]
impl Resolver for LocalResolver {
    fn cache(&self) -> &PackageCache {
        &self.cache
    }

    async fn resolve(&self, dependency: &IRDependency) -> Result<PathBuf, ResolverError> {
        let raw = source_path(&dependency.uri);
        let source = fs::canonicalize(&raw)
            .await
            .map_err(|e| invalid(dependency, &raw, e.to_string()))?;
        if !fs::metadata(&source).await.is_ok_and(|m| m.is_dir()) {
            return Err(invalid(dependency, &source, "not a directory"));
        }
        if fs::metadata(source.join(INDEX_FILE)).await.is_err() {
            return Err(invalid(dependency, &source, format!("missing {INDEX_FILE}")));
        }

        self.cache
            .resolve_with(dependency, |target| link_package(dependency, source, target))
            .await
    }
}

async fn link_package(
    dependency: &IRDependency,
    source: PathBuf,
    target: PathBuf,
) -> Result<(), ResolverError> {
    let conflict = |reason: String| ResolverError::Conflict {
        uri: dependency.uri.clone(),
        path: target.clone(),
        reason,
    };

    match fs::symlink_metadata(&target).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(source = %source.display(), target = %target.display(), "linking local package");
            place(&source, &target).await
        }
        Err(e) => Err(ResolverError::io(&target)(e)),
        Ok(meta) if meta.file_type().is_symlink() => {
            let points_to = fs::read_link(&target).await.map_err(ResolverError::io(&target))?;
            if points_to == source {
                Ok(())
            } else {
                Err(conflict(format!("symlink points to {}", points_to.display())))
            }
        }
        Ok(meta) if meta.is_dir() => {
            if fs::metadata(target.join(INDEX_FILE)).await.is_ok() {
                Ok(())
            } else {
                Err(conflict(format!("directory without {INDEX_FILE}")))
            }
        }
        Ok(_) => Err(conflict("a plain file is in the way".to_string())),
    }
}

#[cfg(unix)]
async fn place(source: &Path, target: &Path) -> Result<(), ResolverError> {
    fs::symlink(source, target).await.map_err(ResolverError::io(target))
}

#[cfg(not(unix))]
async fn place(source: &Path, target: &Path) -> Result<(), ResolverError> {
    let (source, target) = (source.to_path_buf(), target.to_path_buf());
    let dest = target.clone();
    tokio::task::spawn_blocking(move || copy_dir(&source, &target))
        .await
        .map_err(|e| ResolverError::io(&dest)(io::Error::other(e)))?
        .map_err(ResolverError::io(&dest))
}

#[cfg(not(unix))]
fn copy_dir(source: &Path, target: &Path) -> io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}
