//! Drives one pipeline from IR to completion.
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use rdfc_processor::ir::{IRDependency, IRPipeline, IRStage};
use rdfc_processor::processor::ProcessorRegistry;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::OrchestratorConfig;
use crate::error::{ConfigurationError, PipelineError};
use crate::resolver::{GenericResolver, PackageCache, ResolvedPackage, Resolver};
use crate::runner::{Runner, RunnerContext, StageReport, create_runner};

/// Read a pipeline serialized as JSON IR.
pub async fn load_pipeline(path: &Path) -> Result<IRPipeline, ConfigurationError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&raw).map_err(|source| ConfigurationError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Outcome of a pipeline where every stage completed.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub packages: Vec<ResolvedPackage>,
    pub stages: Vec<StageReport>,
    pub elapsed: Duration,
}

struct Planned {
    runner: Arc<dyn Runner>,
    stages: Vec<IRStage>,
}

pub struct Orchestrator {
    pipeline: IRPipeline,
    registry: ProcessorRegistry,
    config: OrchestratorConfig,
    broker: Broker,
    resolver: Arc<dyn Resolver>,
}

impl Orchestrator {
    pub fn new(pipeline: IRPipeline, registry: ProcessorRegistry, config: OrchestratorConfig) -> Self {
        let cache = PackageCache::new(config.packages_dir.clone());
        Self {
            broker: Broker::new(config.channel_capacity),
            resolver: Arc::new(GenericResolver::new(cache, config.retry)),
            pipeline,
            registry,
            config,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn pipeline(&self) -> &IRPipeline {
        &self.pipeline
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Structural checks that need nothing but the IR.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.pipeline.stages.is_empty() {
            return Err(ConfigurationError::EmptyPipeline(self.pipeline.uri.clone()));
        }
        for stage in &self.pipeline.stages {
            if self.pipeline.runner(&stage.runner).is_none() {
                return Err(ConfigurationError::MissingRunner {
                    stage: stage.uri.clone(),
                    runner: stage.runner.clone(),
                });
            }
            stage.validate()?;
        }
        Ok(())
    }

    /// Every dependency of the pipeline and of its runners, first occurrence wins.
    fn dependencies(&self) -> Vec<&IRDependency> {
        let mut seen = HashSet::new();
        self.pipeline
            .dependencies
            .iter()
            .chain(self.pipeline.runners.iter().filter_map(|r| r.dependency.as_ref()))
            .filter(|dep| seen.insert(dep.uri.as_str()))
            .collect()
    }

    /// Resolve every dependency without running anything.
    pub async fn install(&self) -> Result<Vec<ResolvedPackage>, PipelineError> {
        let mut packages = Vec::new();
        for dependency in self.dependencies() {
            let index = self.resolver.resolve(dependency).await?;
            packages.push(ResolvedPackage {
                uri: dependency.uri.clone(),
                directory: self.resolver.directory_of(dependency),
                index,
            });
        }
        Ok(packages)
    }

    fn context(&self) -> RunnerContext {
        RunnerContext {
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            retry: self.config.retry,
            handshake_timeout: self.config.handshake_timeout,
            shutdown_grace: self.config.shutdown_timeout,
        }
    }

    /// One runner per declared runner that has stages.
    fn plan(&self) -> Result<Vec<Planned>, PipelineError> {
        let ctx = self.context();
        let mut planned = Vec::new();
        for declared in &self.pipeline.runners {
            let stages: Vec<IRStage> = self.pipeline.stages_for(&declared.uri).cloned().collect();
            if stages.is_empty() {
                debug!(runner = %declared.uri, "runner has no stages, skipping");
                continue;
            }
            let working_dir: Option<PathBuf> = declared
                .dependency
                .as_ref()
                .map(|dep| self.resolver.directory_of(dep));
            let runner = create_runner(declared, &ctx, working_dir)?;
            planned.push(Planned { runner, stages });
        }
        Ok(planned)
    }

    pub async fn exec(self) -> Result<PipelineReport, PipelineError> {
        self.exec_until(std::future::pending()).await
    }

    /// Run the pipeline, aborting it when `shutdown` resolves first.
    pub async fn exec_until<F>(self, shutdown: F) -> Result<PipelineReport, PipelineError>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let started_at = Utc::now();
        info!(pipeline = %self.pipeline.uri, stages = self.pipeline.stages.len(), "starting pipeline");

        self.validate()?;
        let planned = self.plan()?;

        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            res = self.drive(&planned) => res,
            _ = &mut shutdown => {
                warn!(pipeline = %self.pipeline.uri, "shutdown requested, aborting pipeline");
                Err(PipelineError::Aborted)
            }
        };
        self.close_all(&planned).await;

        let elapsed = started.elapsed();
        match outcome {
            Ok((packages, stages)) => {
                info!(pipeline = %self.pipeline.uri, ?elapsed, "pipeline completed");
                Ok(PipelineReport {
                    pipeline: self.pipeline.uri.clone(),
                    started_at,
                    packages,
                    stages,
                    elapsed,
                })
            }
            Err(e) => {
                error!(pipeline = %self.pipeline.uri, ?elapsed, "pipeline failed: {e}");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        planned: &[Planned],
    ) -> Result<(Vec<ResolvedPackage>, Vec<StageReport>), PipelineError> {
        let packages = self.install().await?;

        try_join_all(
            planned
                .iter()
                .map(|p| p.runner.prepare(p.stages.clone())),
        )
        .await?;
        // nobody will ever write to these
        self.broker.close_orphans();

        let mut set = JoinSet::new();
        for p in planned {
            let runner = Arc::clone(&p.runner);
            set.spawn(async move { runner.exec().await });
        }

        let mut reports: Vec<StageReport> = Vec::new();
        let mut first_failure = None;
        while let Some(joined) = set.join_next().await {
            let batch = match joined {
                Ok(batch) => batch,
                Err(e) => {
                    error!("runner task died: {e}");
                    continue;
                }
            };
            for report in batch {
                if first_failure.is_none() {
                    if let Err(e) = &report.result {
                        first_failure = Some((report.stage.clone(), e.clone()));
                    }
                }
                reports.push(report);
            }
        }

        let failed: Vec<String> = reports
            .iter()
            .filter(|r| r.result.is_err())
            .map(|r| r.stage.clone())
            .collect();
        match first_failure {
            Some((stage, source)) => Err(PipelineError::StageFailed { stage, source, failed }),
            None => Ok((packages, reports)),
        }
    }

    async fn close_all(&self, planned: &[Planned]) {
        let deadline = self.config.shutdown_timeout * 2;
        let closing = join_all(planned.iter().map(|p| p.runner.close()));
        if timeout(deadline, closing).await.is_err() {
            warn!(?deadline, "runners did not close in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::{SEND, register_builtins};
    use crate::runner::{BUILTIN_RUNNER_URI, RunnerError};
    use async_trait::async_trait;
    use rdfc_processor::channel::Reader;
    use rdfc_processor::ir::{IRArgument, IRParameter, IRProcessor, IRRunner, LiteralType};
    use rdfc_processor::processor::Processor;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Hang;

    #[async_trait]
    impl Processor for Hang {
        async fn exec(&mut self) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    struct Drain(Reader);

    #[async_trait]
    impl Processor for Drain {
        async fn exec(&mut self) -> anyhow::Result<()> {
            self.0.collect().await;
            anyhow::bail!("drained")
        }
    }

    fn stage(uri: &str, runner: &str, implementation: &str, args: &[(&str, LiteralType, &str)]) -> IRStage {
        let parameters = args
            .iter()
            .map(|(name, ty, _)| IRParameter::literal(*name, *ty))
            .collect();
        let arguments: BTreeMap<String, IRArgument> = args
            .iter()
            .map(|(name, _, value)| (name.to_string(), IRArgument::literal(*value)))
            .collect();
        IRStage {
            uri: uri.into(),
            runner: runner.into(),
            processor: IRProcessor {
                uri: format!("urn:proc:{implementation}"),
                implementation: implementation.into(),
                parameters,
                metadata: BTreeMap::new(),
            },
            arguments,
        }
    }

    fn pipeline(runners: Vec<IRRunner>, stages: Vec<IRStage>) -> IRPipeline {
        IRPipeline {
            uri: "urn:pipeline".into(),
            dependencies: vec![],
            runners,
            stages,
        }
    }

    fn config(dir: &std::path::Path) -> OrchestratorConfig {
        OrchestratorConfig {
            packages_dir: dir.join("packages"),
            shutdown_timeout: Duration::from_millis(200),
            ..OrchestratorConfig::default()
        }
    }

    fn registry() -> ProcessorRegistry {
        let registry = ProcessorRegistry::new();
        register_builtins(&registry);
        registry.register("hang", |_| Ok(Box::new(Hang) as Box<dyn Processor>));
        registry.register("drain", |mut args| {
            Ok(Box::new(Drain(args.reader("input")?)) as Box<dyn Processor>)
        });
        registry
    }

    #[tokio::test]
    async fn loads_pipeline_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let p = pipeline(
            vec![IRRunner::built_in(BUILTIN_RUNNER_URI)],
            vec![stage("urn:hang", BUILTIN_RUNNER_URI, "hang", &[])],
        );
        std::fs::write(&path, serde_json::to_string(&p).unwrap()).unwrap();
        assert_eq!(load_pipeline(&path).await.unwrap(), p);

        std::fs::write(&path, "{").unwrap();
        assert!(matches!(load_pipeline(&path).await, Err(ConfigurationError::Parse { .. })));
        assert!(matches!(
            load_pipeline(&dir.path().join("missing.json")).await,
            Err(ConfigurationError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn empty_pipeline_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(pipeline(vec![], vec![]), registry(), config(dir.path()));
        assert!(matches!(
            orchestrator.exec().await,
            Err(PipelineError::Configuration(ConfigurationError::EmptyPipeline(_)))
        ));
    }

    #[tokio::test]
    async fn stage_on_undeclared_runner_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(vec![], vec![stage("urn:s", "urn:nowhere", "hang", &[])]);
        let err = Orchestrator::new(p, registry(), config(dir.path())).validate().unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingRunner { runner, .. } if runner == "urn:nowhere"));
    }

    #[tokio::test]
    async fn unsupported_runner_fails_before_any_stage_runs() {
        static RAN: AtomicBool = AtomicBool::new(false);
        struct Flag;
        #[async_trait]
        impl Processor for Flag {
            async fn exec(&mut self) -> anyhow::Result<()> {
                RAN.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        registry.register("flag", |_| Ok(Box::new(Flag) as Box<dyn Processor>));
        let p = pipeline(
            vec![
                IRRunner::built_in(BUILTIN_RUNNER_URI),
                IRRunner::built_in("https://example.org/#PythonRunner"),
            ],
            vec![
                stage("urn:a", BUILTIN_RUNNER_URI, "flag", &[]),
                stage("urn:b", "https://example.org/#PythonRunner", "flag", &[]),
            ],
        );

        let err = Orchestrator::new(p, registry, config(dir.path())).exec().await.unwrap_err();
        assert!(matches!(err, PipelineError::Runner(RunnerError::UnsupportedRunnerType { .. })));
        assert!(!RAN.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn first_failure_is_reported_with_every_failed_stage() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![IRRunner::built_in(BUILTIN_RUNNER_URI)],
            vec![
                stage(
                    "urn:send",
                    BUILTIN_RUNNER_URI,
                    SEND,
                    &[("messages", LiteralType::String, "x"), ("output", LiteralType::Writer, "urn:ch")],
                ),
                stage("urn:drain", BUILTIN_RUNNER_URI, "drain", &[("input", LiteralType::Reader, "urn:ch")]),
            ],
        );

        let err = Orchestrator::new(p, registry(), config(dir.path())).exec().await.unwrap_err();
        match err {
            PipelineError::StageFailed { stage, source, failed } => {
                assert_eq!(stage, "urn:drain");
                assert!(matches!(source, RunnerError::StageFailed { .. }));
                assert_eq!(failed, vec!["urn:drain".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_aborts_and_closes_runners() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![IRRunner::built_in(BUILTIN_RUNNER_URI)],
            vec![stage("urn:hang", BUILTIN_RUNNER_URI, "hang", &[])],
        );

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        let err = Orchestrator::new(p, registry(), config(dir.path()))
            .exec_until(shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Aborted));
    }

    #[tokio::test]
    async fn reader_without_writer_sees_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            vec![IRRunner::built_in(BUILTIN_RUNNER_URI), IRRunner::remote("urn:unused")],
            vec![stage("urn:log", BUILTIN_RUNNER_URI, "rdfc:log", &[("input", LiteralType::Reader, "urn:nobody")])],
        );
        let report = Orchestrator::new(p, registry(), config(dir.path())).exec().await.unwrap();
        assert_eq!(report.stages.len(), 1);
        assert!(report.packages.is_empty());
    }
}
