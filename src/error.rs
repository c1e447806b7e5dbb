use std::path::PathBuf;

use rdfc_processor::error::IRError;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::resolver::ResolverError;
use crate::runner::RunnerError;

/// The pipeline or the orchestrator settings are unusable.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("pipeline `{0}` declares no stages")]
    EmptyPipeline(String),

    #[error("stage `{stage}` runs on undeclared runner `{runner}`")]
    MissingRunner { stage: String, runner: String },

    #[error(transparent)]
    InvalidStage(#[from] IRError),

    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse pipeline {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// First stage failure, with every stage that ended in error.
    #[error("stage `{stage}` failed ({} stage(s) in error): {source}", failed.len())]
    StageFailed {
        stage: String,
        #[source]
        source: RunnerError,
        failed: Vec<String>,
    },

    #[error("pipeline aborted")]
    Aborted,
}

impl PipelineError {
    /// Stages that did not complete, empty when the pipeline never ran.
    pub fn failed_stages(&self) -> &[String] {
        match self {
            PipelineError::StageFailed { failed, .. } => failed,
            _ => &[],
        }
    }
}
