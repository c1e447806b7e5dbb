//! Runner bridge: hosts stages either in-process or in a worker process.
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdfc_processor::ir::{IRRunner, IRStage, RunnerType};
use rdfc_processor::processor::ProcessorRegistry;
use strum_macros::Display;
use thiserror::Error;

use crate::broker::{Broker, BrokerError};
use crate::retry::RetryPolicy;

pub mod builtin;
pub mod connection;
pub mod remote;

pub use builtin::BuiltInRunner;
pub use connection::RpcConnection;
pub use remote::RemoteRunner;

pub const BUILTIN_RUNNER_URI: &str = "https://www.rdf-connect.com/#BuiltInRunner";
/// Older pipelines name the in-process runner after the JVM host.
pub const LEGACY_BUILTIN_RUNNER_URI: &str = "https://www.rdf-connect.com/#JVMRunner";

pub fn is_builtin_uri(uri: &str) -> bool {
    uri == BUILTIN_RUNNER_URI || uri == LEGACY_BUILTIN_RUNNER_URI
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("runner `{uri}` of type {runner_type} is not supported")]
    UnsupportedRunnerType { uri: String, runner_type: String },

    #[error("runner `{uri}` is misconfigured: {reason}")]
    Misconfigured { uri: String, reason: String },

    #[error("stage `{stage}` uses unknown processor `{implementation}`")]
    UnknownProcessor { stage: String, implementation: String },

    #[error("stage `{stage}` has invalid arguments: {reason}")]
    InvalidArguments { stage: String, reason: String },

    #[error("cannot reach runner `{runner}`: {reason}")]
    Connect { runner: String, reason: String },

    #[error("connection to runner `{runner}` lost")]
    ConnectionLost { runner: String },

    #[error("runner `{runner}` sent an unrecognized message: {message}")]
    UnrecognizedRequest { runner: String, message: String },

    #[error("runner `{runner}` answered with error {code}: {message}")]
    Remote {
        runner: String,
        code: i64,
        message: String,
    },

    #[error("runner rejected stage `{stage}`: {message}")]
    PrepareRejected { stage: String, message: String },

    #[error("stage `{stage}` failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("stage `{stage}` panicked")]
    StagePanicked { stage: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl RunnerError {
    /// Only connection setup is worth another try.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunnerError::Connect { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RunnerState {
    Created,
    Initializing,
    Ready,
    Running,
    Completed,
    Failed,
    Closed,
}

/// Lifecycle guard. Illegal transitions are programming errors and panic.
#[derive(Debug)]
pub struct StateCell {
    runner: String,
    state: Mutex<RunnerState>,
}

impl StateCell {
    pub fn new(runner: impl Into<String>) -> Self {
        Self {
            runner: runner.into(),
            state: Mutex::new(RunnerState::Created),
        }
    }

    pub fn get(&self) -> RunnerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transition(&self, from: RunnerState, to: RunnerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(
            *state == from,
            "runner `{}`: illegal transition {} -> {to}, expected {from}",
            self.runner,
            *state
        );
        *state = to;
    }

    /// Move out of `Running` into `Completed` or `Failed`, or to `Failed` from setup.
    pub fn finish(&self, ok: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            RunnerState::Running if ok => *state = RunnerState::Completed,
            RunnerState::Running | RunnerState::Initializing | RunnerState::Ready => {
                *state = RunnerState::Failed
            }
            // closed underneath us, keep it closed
            RunnerState::Closed => {}
            other => panic!("runner `{}`: cannot finish from {other}", self.runner),
        }
    }

    /// Any state may close. Returns `false` when it was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == RunnerState::Closed {
            return false;
        }
        *state = RunnerState::Closed;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    pub result: Result<(), RunnerError>,
}

#[async_trait]
pub trait Runner: Send + Sync {
    fn uri(&self) -> &str;

    fn state(&self) -> RunnerState;

    /// Bind the stages to their channels and get them ready to run.
    async fn prepare(&self, stages: Vec<IRStage>) -> Result<(), RunnerError>;

    /// Run every prepared stage concurrently, one report per stage.
    async fn exec(&self) -> Vec<StageReport>;

    /// Release every resource. Safe to call in any state, more than once.
    async fn close(&self);
}

/// Everything a runner needs from its orchestrator.
#[derive(Clone, Debug)]
pub struct RunnerContext {
    pub broker: Broker,
    pub registry: ProcessorRegistry,
    pub retry: RetryPolicy,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl RunnerContext {
    pub fn new(broker: Broker, registry: ProcessorRegistry) -> Self {
        Self {
            broker,
            registry,
            retry: RetryPolicy::default(),
            handshake_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// Build the runner an IR runner declaration asks for.
pub fn create_runner(
    runner: &IRRunner,
    ctx: &RunnerContext,
    working_dir: Option<PathBuf>,
) -> Result<Arc<dyn Runner>, RunnerError> {
    match runner.runner_type {
        RunnerType::BuiltIn if is_builtin_uri(&runner.uri) => {
            Ok(Arc::new(BuiltInRunner::new(runner.uri.clone(), ctx.clone())))
        }
        RunnerType::BuiltIn => Err(RunnerError::UnsupportedRunnerType {
            uri: runner.uri.clone(),
            runner_type: runner.runner_type.to_string(),
        }),
        RunnerType::Remote => {
            if runner.address.is_none() && runner.entrypoint.is_none() {
                return Err(RunnerError::Misconfigured {
                    uri: runner.uri.clone(),
                    reason: "needs an address or an entrypoint".to_string(),
                });
            }
            Ok(Arc::new(RemoteRunner::new(runner.clone(), ctx.clone(), working_dir)))
        }
    }
}
