//! Runner that hosts its stages in a worker process.
//!
//! Channel traffic crosses the connection as `channel` frames multiplexed by
//! URI. For every channel a stage reads, the runner registers one broker
//! receiver and forwards its messages to the worker, ending with a close
//! frame. Frames coming back are published on the broker under the senders
//! the runner registered for the stage writers. Data frames in both
//! directions are paced per channel by credits, and neither side's reading
//! loop ever waits on a single channel.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rdfc_processor::channel::Reader;
use rdfc_processor::ir::{IRRunner, IRStage};
use rdfc_processor::message::{ChannelFrame, ExecuteResult, FrameKind, Method, PingResult, PrepareParams};
use rdfc_processor::window::Windows;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::connection::Inbound;
use super::{Runner, RunnerContext, RunnerError, RunnerState, RpcConnection, StageReport, StateCell};
use crate::broker::{Broker, SenderId};
use crate::process::WorkerProcess;

const INBOUND_CAPACITY: usize = 16;

struct Session {
    conn: Arc<RpcConnection>,
    process: Option<WorkerProcess>,
}

pub struct RemoteRunner {
    uri: String,
    config: IRRunner,
    ctx: RunnerContext,
    working_dir: Option<PathBuf>,
    state: StateCell,
    session: AsyncMutex<Option<Session>>,
    stages: Mutex<Vec<String>>,
    readers: Mutex<HashMap<String, Reader>>,
    /// Broker senders per channel, one per writer argument of a stage here.
    senders: Arc<Mutex<HashMap<String, Vec<SenderId>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteRunner {
    pub fn new(config: IRRunner, ctx: RunnerContext, working_dir: Option<PathBuf>) -> Self {
        Self {
            uri: config.uri.clone(),
            state: StateCell::new(config.uri.clone()),
            config,
            ctx,
            working_dir,
            session: AsyncMutex::new(None),
            stages: Mutex::new(Vec::new()),
            readers: Mutex::new(HashMap::new()),
            senders: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn connect_error(&self, reason: impl ToString) -> RunnerError {
        RunnerError::Connect {
            runner: self.uri.clone(),
            reason: reason.to_string(),
        }
    }

    async fn connect_once(&self) -> Result<Session, RunnerError> {
        let session = if let Some(address) = &self.config.address {
            let stream = TcpStream::connect(address)
                .await
                .map_err(|e| self.connect_error(format!("{address}: {e}")))?;
            let (read, write) = stream.into_split();
            Session {
                conn: Arc::new(RpcConnection::start(&self.uri, read, write, INBOUND_CAPACITY)),
                process: None,
            }
        } else {
            let entrypoint = self
                .config
                .entrypoint
                .as_deref()
                .ok_or_else(|| self.connect_error("no entrypoint"))?;
            let directory = self.working_dir.as_deref().or(self.config.directory.as_deref());
            let (process, stdin, stdout) = WorkerProcess::spawn(&self.uri, entrypoint, directory)
                .map_err(|e| self.connect_error(format!("spawning `{entrypoint}`: {e}")))?;
            Session {
                conn: Arc::new(RpcConnection::start(&self.uri, stdout, stdin, INBOUND_CAPACITY)),
                process: Some(process),
            }
        };

        let handshake = timeout(self.ctx.handshake_timeout, session.conn.call(Method::Ping, None)).await;
        match handshake {
            Ok(Ok(value)) => {
                let version = serde_json::from_value::<PingResult>(value)
                    .map(|p| p.version)
                    .unwrap_or_else(|_| "unknown".to_string());
                info!(runner = %self.uri, %version, "worker connected");
                Ok(session)
            }
            Ok(Err(e)) => {
                self.discard(session).await;
                Err(self.connect_error(format!("handshake failed: {e}")))
            }
            Err(_) => {
                self.discard(session).await;
                Err(self.connect_error("handshake timed out"))
            }
        }
    }

    async fn discard(&self, session: Session) {
        session.conn.close();
        if let Some(process) = session.process {
            process.terminate(self.ctx.shutdown_grace).await;
        }
    }

    async fn connect(&self) -> Result<Arc<RpcConnection>, RunnerError> {
        let what = format!("connecting to runner {}", self.uri);
        let session = self
            .ctx
            .retry
            .run(&what, |_| self.connect_once(), RunnerError::is_retryable)
            .await?;
        let conn = Arc::clone(&session.conn);
        *self.session.lock().await = Some(session);
        Ok(conn)
    }

    async fn connection(&self) -> Option<Arc<RpcConnection>> {
        self.session.lock().await.as_ref().map(|s| Arc::clone(&s.conn))
    }

    fn wire(&self, stage: &IRStage) -> Result<(), RunnerError> {
        let broker = &self.ctx.broker;
        {
            let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
            for uri in stage.readers() {
                if !readers.contains_key(&uri) {
                    let reader = broker.register_receiver(&uri)?;
                    readers.insert(uri, reader);
                }
            }
        }
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        for uri in stage.writers() {
            let id = broker.register_sender(&uri)?;
            senders.entry(uri).or_default().push(id);
        }
        Ok(())
    }

    async fn prepare_stages(&self, stages: Vec<IRStage>) -> Result<(), RunnerError> {
        let conn = self.connect().await?;
        for stage in stages {
            self.wire(&stage)?;
            let params = serde_json::to_value(PrepareParams { stage: stage.clone() }).map_err(|e| {
                RunnerError::InvalidArguments {
                    stage: stage.uri.clone(),
                    reason: e.to_string(),
                }
            })?;
            conn.call(Method::Prepare, Some(params))
                .await
                .map_err(|e| match e {
                    RunnerError::Remote { message, .. } => RunnerError::PrepareRejected {
                        stage: stage.uri.clone(),
                        message,
                    },
                    other => other,
                })?;
            debug!(runner = %self.uri, stage = %stage.uri, "stage prepared");
            self.stages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(stage.uri);
        }
        Ok(())
    }

    fn release_senders(&self) {
        let senders = std::mem::take(&mut *self.senders.lock().unwrap_or_else(PoisonError::into_inner));
        for (uri, ids) in senders {
            for id in ids {
                self.ctx.broker.unregister(&uri, id);
            }
        }
    }

    fn spawn_reader_proxies(&self, conn: &Arc<RpcConnection>, windows: &Windows) {
        let readers = std::mem::take(&mut *self.readers.lock().unwrap_or_else(PoisonError::into_inner));
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (uri, mut reader) in readers {
            let conn = Arc::clone(conn);
            let windows = windows.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(msg) = reader.read().await {
                    if !windows.acquire(&uri).await {
                        return;
                    }
                    if conn.send_frame(ChannelFrame::data(&uri, &msg)).await.is_err() {
                        return;
                    }
                }
                let _ = conn.send_frame(ChannelFrame::close(&uri)).await;
            }));
        }
    }

    /// Drop the reader proxies so their broker receivers stop taking messages.
    fn stop_proxies(&self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        self.readers.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    async fn run_execute(&self, conn: Arc<RpcConnection>) -> Result<ExecuteResult, RunnerError> {
        let inbound = conn.take_inbound().ok_or_else(|| RunnerError::ConnectionLost {
            runner: self.uri.clone(),
        })?;
        let windows = Windows::new();
        // the worker must see `execute` before any frame that could fill its queues
        let pending = conn.request(Method::Execute, None).await?;
        self.spawn_reader_proxies(&conn, &windows);

        let pump = Pump {
            runner: self.uri.clone(),
            broker: self.ctx.broker.clone(),
            conn: Arc::clone(&conn),
            senders: Arc::clone(&self.senders),
            windows: windows.clone(),
            routes: HashMap::new(),
            publishers: JoinSet::new(),
        };
        let (done_tx, done_rx) = oneshot::channel();
        let mut pumping = tokio::spawn(pump.run(inbound, done_rx));

        let executed = tokio::select! {
            res = pending.response() => res,
            joined = &mut pumping => {
                // the pump only stops early on a broken connection
                let err = match joined {
                    Ok(Err(e)) => e,
                    _ => RunnerError::ConnectionLost { runner: self.uri.clone() },
                };
                windows.close();
                self.stop_proxies();
                conn.close();
                return Err(err);
            }
        };
        let _ = done_tx.send(());
        if executed.is_err() {
            // nothing will credit the proxies anymore, free whoever waits on them
            windows.close();
            self.stop_proxies();
        }

        let pumped = match pumping.await {
            Ok(res) => res,
            Err(e) => {
                error!(runner = %self.uri, "frame pump died: {e}");
                Ok(())
            }
        };
        let outcome: Result<ExecuteResult, RunnerError> = executed.and_then(|value| {
            pumped?;
            serde_json::from_value(value).map_err(|e| RunnerError::UnrecognizedRequest {
                runner: self.uri.clone(),
                message: format!("execute result: {e}"),
            })
        });
        if outcome.is_err() {
            windows.close();
            self.stop_proxies();
        }
        outcome
    }
}

/// Traffic of one channel waiting to be published on the broker.
enum Publish {
    Data(Vec<u8>),
    Close,
}

/// Demultiplexes worker frames onto one publisher task per channel, so a
/// channel whose readers are full never holds up the others.
struct Pump {
    runner: String,
    broker: Broker,
    conn: Arc<RpcConnection>,
    senders: Arc<Mutex<HashMap<String, Vec<SenderId>>>>,
    /// Credits for the frames our reader proxies send.
    windows: Windows,
    routes: HashMap<String, mpsc::UnboundedSender<Publish>>,
    publishers: JoinSet<()>,
}

impl Pump {
    /// Dispatch frames until the worker is done, then wait for every publisher.
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut done: oneshot::Receiver<()>,
    ) -> Result<(), RunnerError> {
        loop {
            tokio::select! {
                biased;
                next = inbound.recv() => match next {
                    Some(next) => self.dispatch(next)?,
                    None => return Err(self.lost()),
                },
                _ = &mut done => break,
            }
        }
        // the execute response trails every frame sent before it
        loop {
            match inbound.try_recv() {
                Ok(Inbound::Lost) | Err(_) => break,
                Ok(next) => self.dispatch(next)?,
            }
        }

        self.routes.clear();
        while let Some(joined) = self.publishers.join_next().await {
            if let Err(e) = joined {
                error!(runner = %self.runner, "publisher died: {e}");
            }
        }
        Ok(())
    }

    fn lost(&self) -> RunnerError {
        RunnerError::ConnectionLost {
            runner: self.runner.clone(),
        }
    }

    fn dispatch(&mut self, inbound: Inbound) -> Result<(), RunnerError> {
        let frame = match inbound {
            Inbound::Frame(frame) => frame,
            Inbound::Unrecognized(message) => {
                return Err(RunnerError::UnrecognizedRequest {
                    runner: self.runner.clone(),
                    message,
                });
            }
            Inbound::Lost => return Err(self.lost()),
        };
        match &frame.kind {
            FrameKind::Data { .. } => match frame.payload() {
                Some(Ok(payload)) => self.publish(&frame.uri, Publish::Data(payload)),
                _ => {
                    return Err(RunnerError::UnrecognizedRequest {
                        runner: self.runner.clone(),
                        message: format!("undecodable payload on `{}`", frame.uri),
                    });
                }
            },
            FrameKind::Close => self.publish(&frame.uri, Publish::Close),
            FrameKind::Credit { amount } => self.windows.grant(&frame.uri, *amount),
        }
        Ok(())
    }

    fn publish(&mut self, uri: &str, item: Publish) {
        if !self.routes.contains_key(uri) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.publishers.spawn(publish(
                self.runner.clone(),
                uri.to_string(),
                self.broker.clone(),
                Arc::clone(&self.conn),
                Arc::clone(&self.senders),
                rx,
            ));
            self.routes.insert(uri.to_string(), tx);
        }
        let delivered = self.routes.get(uri).is_some_and(|route| route.send(item).is_ok());
        if !delivered {
            debug!(runner = %self.runner, channel = %uri, "publisher gone, frame dropped");
        }
    }
}

/// Publish one channel's frames in order, returning a credit per message.
async fn publish(
    runner: String,
    uri: String,
    broker: Broker,
    conn: Arc<RpcConnection>,
    senders: Arc<Mutex<HashMap<String, Vec<SenderId>>>>,
    mut rx: mpsc::UnboundedReceiver<Publish>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Publish::Data(payload) => {
                if let Err(e) = broker.send(&uri, payload).await {
                    warn!(%runner, "dropping frame: {e}");
                }
                if conn.send_frame(ChannelFrame::credit(&uri, 1)).await.is_err() {
                    debug!(%runner, channel = %uri, "credit not delivered");
                }
            }
            Publish::Close => {
                let id = senders
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_mut(&uri)
                    .and_then(Vec::pop);
                match id {
                    Some(id) => broker.unregister(&uri, id),
                    None => debug!(%runner, channel = %uri, "close for channel without sender"),
                }
            }
        }
    }
}

#[async_trait]
impl Runner for RemoteRunner {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn state(&self) -> RunnerState {
        self.state.get()
    }

    async fn prepare(&self, stages: Vec<IRStage>) -> Result<(), RunnerError> {
        self.state.transition(RunnerState::Created, RunnerState::Initializing);
        match self.prepare_stages(stages).await {
            Ok(()) => {
                self.state.transition(RunnerState::Initializing, RunnerState::Ready);
                Ok(())
            }
            Err(e) => {
                self.state.finish(false);
                Err(e)
            }
        }
    }

    async fn exec(&self) -> Vec<StageReport> {
        self.state.transition(RunnerState::Ready, RunnerState::Running);
        let stages = self.stages.lock().unwrap_or_else(PoisonError::into_inner).clone();

        let outcome = match self.connection().await {
            Some(conn) => self.run_execute(conn).await,
            None => Err(RunnerError::ConnectionLost {
                runner: self.uri.clone(),
            }),
        };
        // whatever the worker left open ends here
        self.release_senders();

        let reports: Vec<StageReport> = match outcome {
            Ok(result) => stages
                .into_iter()
                .map(|stage| {
                    let reported = result.stages.iter().find(|r| r.stage == stage);
                    let result = match reported {
                        Some(r) => match &r.error {
                            None => Ok(()),
                            Some(message) => Err(RunnerError::StageFailed {
                                stage: stage.clone(),
                                message: message.clone(),
                            }),
                        },
                        None => Err(RunnerError::StageFailed {
                            stage: stage.clone(),
                            message: "worker did not report the stage".to_string(),
                        }),
                    };
                    StageReport { stage, result }
                })
                .collect(),
            Err(e) => {
                error!(runner = %self.uri, "execution failed: {e}");
                stages
                    .into_iter()
                    .map(|stage| StageReport {
                        stage,
                        result: Err(e.clone()),
                    })
                    .collect()
            }
        };

        self.state.finish(reports.iter().all(|r| r.result.is_ok()));
        reports
    }

    async fn close(&self) {
        if !self.state.close() {
            return;
        }
        let session = self.session.lock().await.take();
        if let Some(session) = &session {
            // a worker that stopped reading must not hold up the close
            let notified = timeout(self.ctx.shutdown_grace, session.conn.notify(Method::Shutdown, None)).await;
            if notified.is_err() {
                warn!(runner = %self.uri, "worker did not take the shutdown request");
            }
        }
        self.stop_proxies();
        self.release_senders();
        if let Some(session) = session {
            self.discard(session).await;
        }
        debug!(runner = %self.uri, "closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use rdfc_processor::processor::ProcessorRegistry;
    use std::time::Duration;

    #[tokio::test]
    async fn unreachable_worker_fails_after_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = IRRunner::remote("urn:remote");
        config.address = Some(address);
        let mut ctx = RunnerContext::new(Broker::default(), ProcessorRegistry::new());
        ctx.retry = RetryPolicy::new(2, Duration::from_millis(5));
        ctx.handshake_timeout = Duration::from_millis(500);

        let runner = RemoteRunner::new(config, ctx, None);
        let err = runner.prepare(vec![]).await.unwrap_err();
        assert!(matches!(err, RunnerError::Connect { .. }), "{err:?}");
        assert_eq!(runner.state(), RunnerState::Failed);
        runner.close().await;
        assert_eq!(runner.state(), RunnerState::Closed);
    }

    #[tokio::test]
    async fn missing_worker_binary_fails_to_connect() {
        let mut config = IRRunner::remote("urn:remote");
        config.entrypoint = Some("/nonexistent/rdfc-worker".into());
        let mut ctx = RunnerContext::new(Broker::default(), ProcessorRegistry::new());
        ctx.retry = RetryPolicy::none();

        let runner = RemoteRunner::new(config, ctx, None);
        assert!(matches!(
            runner.prepare(vec![]).await,
            Err(RunnerError::Connect { .. })
        ));
        runner.close().await;
    }
}
