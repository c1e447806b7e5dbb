use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use rdfc_processor::ir::IRDependency;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::{INDEX_FILE, PackageCache, Resolver, ResolverError};
use crate::retry::RetryPolicy;

/// Resolves `*.git` dependencies with a shallow clone into the cache.
#[derive(Debug, Clone)]
pub struct GitResolver {
    cache: PackageCache,
    retry: RetryPolicy,
    program: String,
}

impl GitResolver {
    pub fn new(cache: PackageCache, retry: RetryPolicy) -> Self {
        Self {
            cache,
            retry,
            program: "git".to_string(),
        }
    }

    /// Use another `git` executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn handles(uri: &str) -> bool {
        uri.ends_with(".git")
    }

    async fn fetch(&self, dependency: &IRDependency, target: PathBuf) -> Result<(), ResolverError> {
        if fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            require_index(&dependency.uri, &target).await?;
            debug!(uri = %dependency.uri, "repository already present");
            return Ok(());
        }
        let max = self.retry.max_attempts();
        self.retry
            .run(
                "git clone",
                |attempt| self.clone_once(&dependency.uri, &target, attempt),
                ResolverError::is_retryable,
            )
            .await
            .map_err(|e| match e {
                ResolverError::Fetch { uri, reason, .. } => ResolverError::Fetch {
                    uri,
                    attempts: max,
                    reason,
                },
                other => other,
            })
    }

    /// Clone into a sibling scratch directory and move it into place, so an
    /// interrupted clone never looks like a resolved package.
    async fn clone_once(&self, uri: &str, target: &Path, attempt: u32) -> Result<(), ResolverError> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "package".to_string());
        let scratch = target.with_file_name(format!(".{name}.partial-{}", Uuid::new_v4()));
        let fetch_err = |reason: String| ResolverError::Fetch {
            uri: uri.to_string(),
            attempts: attempt,
            reason,
        };

        info!(uri, attempt, "cloning repository");
        let output = Command::new(&self.program)
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("--quiet")
            .arg(uri)
            .arg(&scratch)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| fetch_err(format!("cannot run {}: {e}", self.program)))?;

        if !output.status.success() {
            let _ = fs::remove_dir_all(&scratch).await;
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(fetch_err(format!("{}: {stderr}", output.status)));
        }
        if let Err(e) = require_index(uri, &scratch).await {
            let _ = fs::remove_dir_all(&scratch).await;
            return Err(match e {
                ResolverError::MissingIndex { uri, .. } => ResolverError::MissingIndex {
                    uri,
                    path: target.to_path_buf(),
                },
                other => other,
            });
        }

        if let Err(e) = fs::rename(&scratch, target).await {
            let _ = fs::remove_dir_all(&scratch).await;
            return Err(ResolverError::io(target)(e));
        }
        Ok(())
    }
}

async fn require_index(uri: &str, directory: &Path) -> Result<(), ResolverError> {
    if fs::metadata(directory.join(INDEX_FILE)).await.is_ok_and(|m| m.is_file()) {
        Ok(())
    } else {
        Err(ResolverError::MissingIndex {
            uri: uri.to_string(),
            path: directory.to_path_buf(),
        })
    }
}

#[async_trait]
impl Resolver for GitResolver {
    fn cache(&self) -> &PackageCache {
        &self.cache
    }

    async fn resolve(&self, dependency: &IRDependency) -> Result<PathBuf, ResolverError> {
        self.cache
            .resolve_with(dependency, |target| self.fetch(dependency, target))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn handles_git_suffix_only() {
        assert!(GitResolver::handles("https://github.com/rdf-connect/template.git"));
        assert!(!GitResolver::handles("https://github.com/rdf-connect/template"));
    }

    #[tokio::test]
    async fn existing_checkout_is_reused() {
        let tmp = tempdir().unwrap();
        let cache = PackageCache::new(tmp.path().join("packages"));
        let dep = IRDependency::new("https://invalid.invalid/procs.git");
        let dir = cache.directory_of(&dep);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(INDEX_FILE), "").unwrap();

        // a failing program proves no clone was attempted
        let resolver = GitResolver::new(cache, RetryPolicy::none()).with_program("/nonexistent/git");
        let index = resolver.resolve(&dep).await.unwrap();
        assert_eq!(index, dir.join("index.ttl"));
    }

    #[tokio::test]
    async fn existing_checkout_without_index_is_rejected() {
        let tmp = tempdir().unwrap();
        let cache = PackageCache::new(tmp.path().join("packages"));
        let dep = IRDependency::new("https://invalid.invalid/procs.git");
        let dir = cache.directory_of(&dep);
        std::fs::create_dir_all(&dir).unwrap();

        let resolver = GitResolver::new(cache.clone(), RetryPolicy::none()).with_program("/nonexistent/git");
        match resolver.resolve(&dep).await {
            Err(ResolverError::MissingIndex { uri, path }) => {
                assert_eq!(uri, dep.uri);
                assert_eq!(path, dir);
            }
            other => panic!("expected missing index, got {other:?}"),
        }
        assert!(cache.resolved().is_empty());
        // left for the user to inspect
        assert!(dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clone_without_index_is_not_kept() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempdir().unwrap();
        // stands in for git: `clone --depth 1 --quiet <uri> <dir>` creates an empty dir
        let fake_git = tmp.path().join("fake-git");
        std::fs::write(&fake_git, "#!/bin/sh\nmkdir -p \"$6\"\n").unwrap();
        std::fs::set_permissions(&fake_git, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cache = PackageCache::new(tmp.path().join("packages"));
        let resolver = GitResolver::new(cache.clone(), RetryPolicy::new(3, Duration::from_millis(5)))
            .with_program(fake_git.to_string_lossy());
        let dep = IRDependency::new("https://invalid.invalid/empty.git");

        match resolver.resolve(&dep).await {
            Err(ResolverError::MissingIndex { uri, path }) => {
                assert_eq!(uri, dep.uri);
                assert_eq!(path, cache.directory_of(&dep));
            }
            other => panic!("expected missing index, got {other:?}"),
        }
        assert!(!cache.directory_of(&dep).exists());
        let leftovers: Vec<_> = std::fs::read_dir(cache.root())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".partial-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn failing_clone_reports_attempts() {
        let tmp = tempdir().unwrap();
        let cache = PackageCache::new(tmp.path().join("packages"));
        let resolver = GitResolver::new(cache.clone(), RetryPolicy::new(2, Duration::from_millis(5)))
            .with_program("/nonexistent/git");
        let dep = IRDependency::new("https://invalid.invalid/procs.git");

        match resolver.resolve(&dep).await {
            Err(ResolverError::Fetch { attempts, uri, .. }) => {
                assert_eq!(attempts, 2);
                assert_eq!(uri, dep.uri);
            }
            other => panic!("expected fetch error, got {other:?}"),
        }
        assert!(!cache.directory_of(&dep).exists());
    }
}
