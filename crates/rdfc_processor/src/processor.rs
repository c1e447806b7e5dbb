use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::arguments::Arguments;
use crate::error::ProcessorError;

/// A unit of pipeline work.
///
/// Instances are built from bound [`Arguments`] by a factory and then run
/// exactly once. Writers a processor does not close itself are closed by
/// the runner after `exec` returns.
#[async_trait]
pub trait Processor: Send {
    async fn exec(&mut self) -> anyhow::Result<()>;
}

pub type ProcessorFactory =
    Arc<dyn Fn(Arguments) -> Result<Box<dyn Processor>, ProcessorError> + Send + Sync>;

/// Maps implementation identifiers (`IRProcessor::implementation`) to factories.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    factories: Arc<DashMap<String, ProcessorFactory>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one under the same name.
    pub fn register<F>(&self, implementation: impl Into<String>, factory: F)
    where
        F: Fn(Arguments) -> Result<Box<dyn Processor>, ProcessorError> + Send + Sync + 'static,
    {
        self.factories.insert(implementation.into(), Arc::new(factory));
    }

    pub fn unregister(&self, implementation: &str) -> bool {
        self.factories.remove(implementation).is_some()
    }

    pub fn contains(&self, implementation: &str) -> bool {
        self.factories.contains_key(implementation)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn instantiate(
        &self,
        implementation: &str,
        arguments: Arguments,
    ) -> Result<Box<dyn Processor>, ProcessorError> {
        // clone out of the map so the shard lock is not held while the factory runs
        let factory = self
            .factories
            .get(implementation)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| ProcessorError::UnknownProcessor(implementation.to_string()))?;
        factory(arguments)
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("implementations", &self.list())
            .finish()
    }
}
