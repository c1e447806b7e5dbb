use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use rdfc_processor::arguments::Arguments;
use rdfc_processor::error::ProcessorError;
use rdfc_processor::ir::IRStage;
use rdfc_processor::processor::Processor;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::{Runner, RunnerContext, RunnerError, RunnerState, StageReport, StateCell};
use crate::broker::{BrokerBinder, SenderId};

struct PreparedStage {
    uri: String,
    processor: Box<dyn Processor>,
    senders: Vec<(String, SenderId)>,
}

/// Runs stages as tasks inside the orchestrator, wired straight to the broker.
pub struct BuiltInRunner {
    uri: String,
    ctx: RunnerContext,
    state: StateCell,
    prepared: Mutex<Vec<PreparedStage>>,
    /// Every sender this runner registered, released again on close.
    senders: Mutex<Vec<(String, SenderId)>>,
}

impl BuiltInRunner {
    pub fn new(uri: String, ctx: RunnerContext) -> Self {
        Self {
            state: StateCell::new(uri.clone()),
            uri,
            ctx,
            prepared: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        }
    }

    fn build(&self, stage: &IRStage) -> Result<PreparedStage, RunnerError> {
        let mut binder = BrokerBinder::new(&self.ctx.broker);
        let bound = Arguments::bind(stage, &mut binder);
        let senders = binder.into_senders();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(senders.iter().cloned());

        let processor = bound
            .and_then(|args| {
                self.ctx
                    .registry
                    .instantiate(&stage.processor.implementation, args)
            })
            .map_err(|e| match e {
                ProcessorError::UnknownProcessor(implementation) => RunnerError::UnknownProcessor {
                    stage: stage.uri.clone(),
                    implementation,
                },
                other => RunnerError::InvalidArguments {
                    stage: stage.uri.clone(),
                    reason: other.to_string(),
                },
            })?;

        Ok(PreparedStage {
            uri: stage.uri.clone(),
            processor,
            senders,
        })
    }
}

#[async_trait]
impl Runner for BuiltInRunner {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn state(&self) -> RunnerState {
        self.state.get()
    }

    async fn prepare(&self, stages: Vec<IRStage>) -> Result<(), RunnerError> {
        self.state.transition(RunnerState::Created, RunnerState::Initializing);
        for stage in &stages {
            match self.build(stage) {
                Ok(prepared) => {
                    debug!(runner = %self.uri, stage = %stage.uri, "stage prepared");
                    self.prepared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(prepared);
                }
                Err(e) => {
                    self.state.finish(false);
                    return Err(e);
                }
            }
        }
        self.state.transition(RunnerState::Initializing, RunnerState::Ready);
        Ok(())
    }

    async fn exec(&self) -> Vec<StageReport> {
        self.state.transition(RunnerState::Ready, RunnerState::Running);
        let stages = std::mem::take(&mut *self.prepared.lock().unwrap_or_else(PoisonError::into_inner));
        let order: Vec<String> = stages.iter().map(|s| s.uri.clone()).collect();
        info!(runner = %self.uri, stages = order.len(), "executing stages");

        let mut set = JoinSet::new();
        for mut stage in stages {
            let broker = self.ctx.broker.clone();
            set.spawn(async move {
                let outcome = AssertUnwindSafe(stage.processor.exec()).catch_unwind().await;
                // a finished stage ends its channels, whatever the outcome
                for (uri, id) in &stage.senders {
                    broker.unregister(uri, *id);
                }
                let result = match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(RunnerError::StageFailed {
                        stage: stage.uri.clone(),
                        message: format!("{e:#}"),
                    }),
                    Err(_) => Err(RunnerError::StagePanicked {
                        stage: stage.uri.clone(),
                    }),
                };
                StageReport {
                    stage: stage.uri,
                    result,
                }
            });
        }

        let mut reports = Vec::with_capacity(order.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => {
                    if let Err(e) = &report.result {
                        error!(runner = %self.uri, stage = %report.stage, "{e}");
                    }
                    reports.push(report);
                }
                Err(e) => error!(runner = %self.uri, "stage task aborted: {e}"),
            }
        }
        // anything that did not report back was cancelled
        for uri in &order {
            if !reports.iter().any(|r| &r.stage == uri) {
                reports.push(StageReport {
                    stage: uri.clone(),
                    result: Err(RunnerError::StagePanicked { stage: uri.clone() }),
                });
            }
        }
        reports.sort_by_key(|r| order.iter().position(|u| u == &r.stage));

        self.state.finish(reports.iter().all(|r| r.result.is_ok()));
        reports
    }

    async fn close(&self) {
        if !self.state.close() {
            return;
        }
        self.prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let senders = std::mem::take(&mut *self.senders.lock().unwrap_or_else(PoisonError::into_inner));
        for (uri, id) in senders {
            self.ctx.broker.unregister(&uri, id);
        }
        debug!(runner = %self.uri, "closed");
    }
}
