//! Fetches pipeline dependencies into the local packages directory.
//!
//! Every dependency maps to one directory below the cache root, derived from
//! its URI alone. Resolution is idempotent: once a package directory exists
//! it is reused and never fetched or written again.
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rdfc_processor::ir::IRDependency;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub mod generic;
pub mod git;
pub mod local;

pub use generic::GenericResolver;
pub use git::GitResolver;
pub use local::LocalResolver;

pub const DEFAULT_PACKAGES_DIR: &str = "packages";
pub const INDEX_FILE: &str = "index.ttl";

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("no resolver handles `{uri}`")]
    Unresolvable { uri: String },

    #[error("local dependency `{uri}` at {path}: {reason}")]
    InvalidLocalPath {
        uri: String,
        path: PathBuf,
        reason: String,
    },

    #[error("{path} already holds something other than `{uri}`: {reason}")]
    Conflict {
        uri: String,
        path: PathBuf,
        reason: String,
    },

    #[error("package `{uri}` at {path} has no index file")]
    MissingIndex { uri: String, path: PathBuf },

    #[error("packages path {path} exists and is not a directory")]
    PackagesNotADirectory { path: PathBuf },

    #[error("fetching `{uri}` failed after {attempts} attempt(s): {reason}")]
    Fetch {
        uri: String,
        attempts: u32,
        reason: String,
    },

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResolverError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolverError::Fetch { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| ResolverError::Io { path, source }
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    fn cache(&self) -> &PackageCache;

    /// Make the dependency available locally and return its index file.
    async fn resolve(&self, dependency: &IRDependency) -> Result<PathBuf, ResolverError>;

    /// Where `dependency` lives once resolved. Touches nothing on disk.
    fn directory_of(&self, dependency: &IRDependency) -> PathBuf {
        self.cache().directory_of(dependency)
    }

    fn index_of(&self, dependency: &IRDependency) -> PathBuf {
        self.cache().index_of(dependency)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPackage {
    pub uri: String,
    pub directory: PathBuf,
    pub index: PathBuf,
}

#[derive(Debug)]
struct CacheInner {
    root: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    resolved: DashMap<PathBuf, ResolvedPackage>,
}

/// Package directory bookkeeping shared by every resolver of an orchestrator.
#[derive(Debug, Clone)]
pub struct PackageCache {
    inner: Arc<CacheInner>,
}

impl Default for PackageCache {
    fn default() -> Self {
        Self::new(DEFAULT_PACKAGES_DIR)
    }
}

impl PackageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                root: root.into(),
                locks: DashMap::new(),
                resolved: DashMap::new(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn directory_of(&self, dependency: &IRDependency) -> PathBuf {
        self.inner.root.join(dependency.directory())
    }

    pub fn index_of(&self, dependency: &IRDependency) -> PathBuf {
        self.directory_of(dependency).join(INDEX_FILE)
    }

    pub fn resolved(&self) -> Vec<ResolvedPackage> {
        let mut out: Vec<_> = self.inner.resolved.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.directory.cmp(&b.directory));
        out
    }

    /// Create the packages root (with a catch-all `.gitignore`) if needed.
    pub async fn ensure_root(&self) -> Result<(), ResolverError> {
        let root = self.root();
        match fs::metadata(root).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(ResolverError::PackagesNotADirectory {
                    path: root.to_path_buf(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(root).await.map_err(ResolverError::io(root))?;
                info!(path = %root.display(), "created packages directory");
            }
            Err(e) => return Err(ResolverError::io(root)(e)),
        }

        let ignore = root.join(".gitignore");
        if fs::symlink_metadata(&ignore).await.is_err() {
            fs::write(&ignore, "*\n").await.map_err(ResolverError::io(&ignore))?;
        }
        Ok(())
    }

    /// Shared driver for every resolver: serializes work per target directory,
    /// short-circuits packages already resolved in this process and records
    /// the result. A second dependency mapping onto a directory already
    /// resolved for another URI is a [`ResolverError::Conflict`]. `fetch` receives the target directory and must leave the
    /// package there.
    pub async fn resolve_with<F, Fut>(
        &self,
        dependency: &IRDependency,
        fetch: F,
    ) -> Result<PathBuf, ResolverError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), ResolverError>>,
    {
        self.ensure_root().await?;
        let directory = self.directory_of(dependency);
        let lock = self
            .inner
            .locks
            .entry(directory.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(pkg) = self.inner.resolved.get(&directory) {
            if pkg.uri != dependency.uri {
                return Err(ResolverError::Conflict {
                    uri: dependency.uri.clone(),
                    path: directory.clone(),
                    reason: format!("already resolved from `{}`", pkg.uri),
                });
            }
            debug!(uri = %dependency.uri, "dependency already resolved");
            return Ok(pkg.index.clone());
        }

        fetch(directory.clone()).await?;

        let pkg = ResolvedPackage {
            uri: dependency.uri.clone(),
            directory: directory.clone(),
            index: self.index_of(dependency),
        };
        info!(uri = %pkg.uri, directory = %pkg.directory.display(), "dependency resolved");
        let index = pkg.index.clone();
        self.inner.resolved.insert(directory, pkg);
        Ok(index)
    }

    /// Forget `dependency` and delete its directory so the next resolve fetches again.
    pub async fn invalidate(&self, dependency: &IRDependency) -> Result<(), ResolverError> {
        let directory = self.directory_of(dependency);
        self.inner.resolved.remove(&directory);
        match fs::symlink_metadata(&directory).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&directory)
                .await
                .map_err(ResolverError::io(&directory)),
            Ok(_) => fs::remove_file(&directory).await.map_err(ResolverError::io(&directory)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ResolverError::io(&directory)(e)),
        }
    }
}
