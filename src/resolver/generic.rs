use std::path::PathBuf;

use async_trait::async_trait;
use rdfc_processor::ir::IRDependency;

use super::{GitResolver, LocalResolver, PackageCache, Resolver, ResolverError};
use crate::retry::RetryPolicy;

/// Picks the concrete resolver from the shape of the URI.
#[derive(Debug, Clone)]
pub struct GenericResolver {
    cache: PackageCache,
    local: LocalResolver,
    git: GitResolver,
}

impl GenericResolver {
    pub fn new(cache: PackageCache, retry: RetryPolicy) -> Self {
        Self {
            local: LocalResolver::new(cache.clone()),
            git: GitResolver::new(cache.clone(), retry),
            cache,
        }
    }

    pub fn with_git(mut self, git: GitResolver) -> Self {
        self.git = git;
        self
    }

    fn pick(&self, uri: &str) -> Option<&dyn Resolver> {
        if LocalResolver::handles(uri) {
            Some(&self.local)
        } else if GitResolver::handles(uri) {
            Some(&self.git)
        } else {
            None
        }
    }
}

#[async_trait]
impl Resolver for GenericResolver {
    fn cache(&self) -> &PackageCache {
        &self.cache
    }

    async fn resolve(&self, dependency: &IRDependency) -> Result<PathBuf, ResolverError> {
        match self.pick(&dependency.uri) {
            Some(resolver) => resolver.resolve(dependency).await,
            None => Err(ResolverError::Unresolvable {
                uri: dependency.uri.clone(),
            }),
        }
    }
}
