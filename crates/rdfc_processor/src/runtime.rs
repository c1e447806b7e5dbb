//! Worker side of the runner protocol.
//!
//! A worker binary registers its processors and calls [`run`]. The loop reads
//! one JSON-RPC message per line, answers `ping`/`prepare`/`execute`, routes
//! inbound `channel` frames to local readers and emits `channel` frames for
//! every local writer. The read loop never waits on a reader queue: each
//! channel has its own forwarder, paced by the credits of [`crate::window`].
//! Stdout carries the protocol, so never log to stdout from a worker: use
//! [`init_logging`], which writes to stderr.
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::arguments::{Arguments, ChannelBinder};
use crate::channel::{self, ChannelSink, Reader, Writer};
use crate::error::ChannelError;
use crate::jsonrpc::{
    INVALID_PARAMS, INVALID_STATE, Id, METHOD_NOT_FOUND, Message, PARSE_ERROR, PREPARE_FAILED,
    Request, Response, to_line,
};
use crate::message::{ChannelFrame, ExecuteResult, FrameKind, Method, PingResult, PrepareParams, StageResult};
use crate::processor::{Processor, ProcessorRegistry};
use crate::window::Windows;

const OUTBOUND_CAPACITY: usize = 64;
const READER_CAPACITY: usize = 16;

/// Send `tracing` output of a worker to stderr.
pub fn init_logging(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::new(level))
        .try_init();
}

/// Serve the protocol on stdin/stdout until `shutdown` or end of input.
pub async fn run(registry: ProcessorRegistry) -> Result<()> {
    serve(registry, io::stdin(), io::stdout()).await
}

/// Serve the protocol over an arbitrary byte stream pair.
pub async fn serve<R, W>(registry: ProcessorRegistry, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    // ── 1. writer task: queue → output ──────────────────────────────────
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(async move {
        let mut w = BufWriter::new(output);
        while let Some(line) = rx.recv().await {
            if let Err(e) = w.write_all(line.as_bytes()).await {
                error!("protocol write error: {e}");
                break;
            }
            // flush per line, the peer waits on whole messages
            if w.flush().await.is_err() {
                error!("protocol flush error");
                break;
            }
        }
    });

    // ── 2. read requests, dispatch, answer through the same queue ───────
    let mut worker = Worker::new(registry, tx);
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(Message::Request(req)) => {
                if worker.handle(req).await == Flow::Stop {
                    break;
                }
            }
            Ok(Message::Response(rsp)) => debug!(id = ?rsp.id, "ignoring stray response"),
            Err(e) => {
                warn!("unparseable message: {e}");
                worker
                    .respond(Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(e.to_string()))))
                    .await;
            }
        }
    }

    worker.shutdown();
    drop(worker);
    let _ = writer.await;
    info!("worker loop finished");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct PreparedStage {
    uri: String,
    processor: Box<dyn Processor>,
    sinks: Vec<(String, Arc<FrameSink>)>,
}

/// What the read loop hands to the forwarder of one channel.
enum Routed {
    /// `None` when the payload could not be decoded, the credit is still due.
    Data(Option<Vec<u8>>),
    Close,
}

struct Worker {
    registry: ProcessorRegistry,
    out: mpsc::Sender<String>,
    /// Local reader queues per channel, several stages may read the same URI.
    readers: HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
    /// Forwarders of channels that already carried traffic.
    routes: HashMap<String, mpsc::UnboundedSender<Routed>>,
    forwarders: JoinSet<()>,
    /// Credits for frames our writers emit.
    windows: Windows,
    prepared: Vec<PreparedStage>,
    execution: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(registry: ProcessorRegistry, out: mpsc::Sender<String>) -> Self {
        Self {
            registry,
            out,
            readers: HashMap::new(),
            routes: HashMap::new(),
            forwarders: JoinSet::new(),
            windows: Windows::new(),
            prepared: Vec::new(),
            execution: None,
        }
    }

    fn respond(&self, rsp: Response) -> impl Future<Output = ()> + Send + 'static {
        let out = self.out.clone();
        async move {
            match to_line(&rsp) {
                Ok(line) => {
                    let _ = out.send(line).await;
                }
                Err(e) => error!("cannot encode response: {e}"),
            }
        }
    }

    async fn handle(&mut self, req: Request) -> Flow {
        let method = match req.method.parse::<Method>() {
            Ok(m) => m,
            Err(_) => {
                warn!(method = %req.method, "unknown method");
                if let Some(id) = req.id {
                    self.respond(Response::fail(id, METHOD_NOT_FOUND, "Method not found", Some(json!(req.method))))
                        .await;
                }
                return Flow::Continue;
            }
        };

        match (method, req.id) {
            (Method::Ping, Some(id)) => {
                let result = PingResult {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                };
                self.respond(Response::success(id, json!(result))).await;
            }
            (Method::Prepare, Some(id)) => {
                let rsp = self.prepare(id, req.params).await;
                self.respond(rsp).await;
            }
            (Method::Execute, Some(id)) => self.execute(id).await,
            (Method::Channel, _) => self.route(req.params),
            (Method::Shutdown, _) => {
                info!("shutdown requested");
                return Flow::Stop;
            }
            (method, None) => warn!(%method, "expected a call, got a notification"),
        }
        Flow::Continue
    }

    async fn prepare(&mut self, id: Id, params: Option<Value>) -> Response {
        if self.execution.is_some() {
            return Response::fail(id, INVALID_STATE, "stages already executing", None);
        }
        let params: PrepareParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(p)) => p,
            Ok(None) => return Response::fail(id, INVALID_PARAMS, "missing params", None),
            Err(e) => return Response::fail(id, INVALID_PARAMS, "Invalid params", Some(json!(e.to_string()))),
        };
        let stage = params.stage;

        let mut binder = WorkerBinder {
            out: self.out.clone(),
            windows: self.windows.clone(),
            readers: &mut self.readers,
            sinks: Vec::new(),
        };
        let built = Arguments::bind(&stage, &mut binder)
            .and_then(|args| self.registry.instantiate(&stage.processor.implementation, args));
        let sinks = binder.sinks;

        match built {
            Ok(processor) => {
                info!(stage = %stage.uri, implementation = %stage.processor.implementation, "stage prepared");
                self.prepared.push(PreparedStage {
                    uri: stage.uri,
                    processor,
                    sinks,
                });
                Response::success(id, Value::Null)
            }
            Err(e) => {
                error!(stage = %stage.uri, "prepare failed: {e}");
                Response::fail(id, PREPARE_FAILED, e.to_string(), None)
            }
        }
    }

    async fn execute(&mut self, id: Id) {
        if self.execution.is_some() {
            self.respond(Response::fail(id, INVALID_STATE, "execute called twice", None))
                .await;
            return;
        }
        let stages = std::mem::take(&mut self.prepared);
        let out = self.out.clone();
        self.execution = Some(tokio::spawn(async move {
            let result = execute_stages(stages).await;
            let rsp = Response::success(id, json!(result));
            match to_line(&rsp) {
                Ok(line) => {
                    let _ = out.send(line).await;
                }
                Err(e) => error!("cannot encode execute result: {e}"),
            }
        }));
    }

    /// Hand a frame to its channel without waiting on the channel's readers.
    fn route(&mut self, params: Option<Value>) {
        let frame: ChannelFrame = match params.map(serde_json::from_value).transpose() {
            Ok(Some(f)) => f,
            Ok(None) => {
                warn!("channel notification without frame");
                return;
            }
            Err(e) => {
                warn!("malformed channel frame: {e}");
                return;
            }
        };

        match &frame.kind {
            FrameKind::Data { .. } => {
                let payload = match frame.payload() {
                    Some(Ok(p)) => Some(p),
                    _ => {
                        warn!(channel = %frame.uri, "undecodable payload");
                        None
                    }
                };
                let route = self.route_for(&frame.uri);
                if route.send(Routed::Data(payload)).is_err() {
                    debug!(channel = %frame.uri, "forwarder gone, frame dropped");
                }
            }
            FrameKind::Close => match self.routes.remove(&frame.uri) {
                Some(route) => {
                    let _ = route.send(Routed::Close);
                }
                None => {
                    // dropping the senders ends every local reader of the channel
                    if self.readers.remove(&frame.uri).is_some() {
                        debug!(channel = %frame.uri, "channel closed");
                    }
                }
            },
            FrameKind::Credit { amount } => self.windows.grant(&frame.uri, *amount),
        }
    }

    fn route_for(&mut self, uri: &str) -> mpsc::UnboundedSender<Routed> {
        if let Some(route) = self.routes.get(uri) {
            return route.clone();
        }
        let targets = self.readers.remove(uri).unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        self.forwarders
            .spawn(forward(uri.to_string(), targets, rx, self.out.clone()));
        self.routes.insert(uri.to_string(), tx.clone());
        tx
    }

    fn shutdown(&mut self) {
        self.readers.clear();
        self.routes.clear();
        self.forwarders.abort_all();
        self.windows.close();
        if let Some(handle) = self.execution.take() {
            handle.abort();
        }
    }
}

/// Feed one channel's local readers and return a credit per message.
async fn forward(
    uri: String,
    targets: Vec<mpsc::Sender<Vec<u8>>>,
    mut rx: mpsc::UnboundedReceiver<Routed>,
    out: mpsc::Sender<String>,
) {
    while let Some(routed) = rx.recv().await {
        match routed {
            Routed::Data(payload) => {
                if let Some(payload) = payload {
                    for tx in &targets {
                        // a reader that was dropped early just misses the message
                        let _ = tx.send(payload.clone()).await;
                    }
                }
                if emit(&out, ChannelFrame::credit(&uri, 1)).await.is_err() {
                    return;
                }
            }
            Routed::Close => break,
        }
    }
    debug!(channel = %uri, "channel closed");
}

async fn emit(out: &mpsc::Sender<String>, frame: ChannelFrame) -> Result<(), ChannelError> {
    let uri = frame.uri.clone();
    let note = Request::notification(Method::Channel, Some(json!(frame)));
    let line = to_line(&note).map_err(|e| ChannelError::Delivery {
        uri: uri.clone(),
        reason: e.to_string(),
    })?;
    out.send(line).await.map_err(|_| ChannelError::Delivery {
        uri,
        reason: "connection closed".to_string(),
    })
}

async fn execute_stages(stages: Vec<PreparedStage>) -> ExecuteResult {
    let mut set = JoinSet::new();
    let mut order = Vec::with_capacity(stages.len());
    for mut stage in stages {
        order.push(stage.uri.clone());
        set.spawn(async move {
            let outcome = AssertUnwindSafe(stage.processor.exec()).catch_unwind().await;
            // close whatever the processor left open
            for (uri, sink) in &stage.sinks {
                if let Err(e) = sink.close(uri).await {
                    warn!(channel = %uri, "closing writer failed: {e}");
                }
            }
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(_) => {
                    error!(stage = %stage.uri, "stage panicked");
                    Some("stage panicked".to_string())
                }
            };
            StageResult {
                stage: stage.uri,
                error,
            }
        });
    }

    let mut results: HashMap<String, StageResult> = HashMap::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => {
                results.insert(result.stage.clone(), result);
            }
            Err(e) => error!("stage task failed to join: {e}"),
        }
    }

    let stages = order
        .into_iter()
        .map(|uri| {
            results.remove(&uri).unwrap_or_else(|| StageResult {
                stage: uri,
                error: Some("stage did not report".to_string()),
            })
        })
        .collect();
    ExecuteResult { stages }
}

struct WorkerBinder<'a> {
    out: mpsc::Sender<String>,
    windows: Windows,
    readers: &'a mut HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
    sinks: Vec<(String, Arc<FrameSink>)>,
}

impl ChannelBinder for WorkerBinder<'_> {
    fn reader(&mut self, uri: &str) -> Result<Reader, ChannelError> {
        let (tx, reader) = channel::channel(uri, READER_CAPACITY);
        self.readers.entry(uri.to_string()).or_default().push(tx);
        Ok(reader)
    }

    fn writer(&mut self, uri: &str) -> Result<Writer, ChannelError> {
        let sink = Arc::new(FrameSink {
            out: self.out.clone(),
            windows: self.windows.clone(),
            closed: AtomicBool::new(false),
        });
        self.sinks.push((uri.to_string(), Arc::clone(&sink)));
        Ok(Writer::new(uri, sink))
    }
}

/// Writer sink that turns writes into outbound `channel` notifications.
struct FrameSink {
    out: mpsc::Sender<String>,
    windows: Windows,
    closed: AtomicBool,
}

#[async_trait]
impl ChannelSink for FrameSink {
    async fn send(&self, uri: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(uri.to_string()));
        }
        if !self.windows.acquire(uri).await {
            return Err(ChannelError::Delivery {
                uri: uri.to_string(),
                reason: "connection closed".to_string(),
            });
        }
        emit(&self.out, ChannelFrame::data(uri, &payload)).await
    }

    async fn close(&self, uri: &str) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        emit(&self.out, ChannelFrame::close(uri)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IRArgument, IRParameter, IRProcessor, IRStage, LiteralType};
    use crate::window::CHANNEL_WINDOW;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, DuplexStream, Lines};

    struct Upper {
        input: Reader,
        output: Writer,
    }

    #[async_trait]
    impl Processor for Upper {
        async fn exec(&mut self) -> anyhow::Result<()> {
            while let Some(msg) = self.input.read().await {
                self.output.write(msg.to_ascii_uppercase()).await?;
            }
            Ok(())
        }
    }

    /// Writes `count` messages, panicking afterwards when asked to.
    struct Flood {
        output: Writer,
        count: usize,
        panic: bool,
    }

    #[async_trait]
    impl Processor for Flood {
        async fn exec(&mut self) -> anyhow::Result<()> {
            for i in 0..self.count {
                self.output.write(format!("m{i}")).await?;
            }
            if self.panic {
                panic!("flood gave up");
            }
            Ok(())
        }
    }

    fn registry() -> ProcessorRegistry {
        let registry = ProcessorRegistry::new();
        registry.register("upper", |mut args| {
            Ok(Box::new(Upper {
                input: args.reader("input")?,
                output: args.writer("output")?,
            }) as Box<dyn Processor>)
        });
        registry.register("flood", |mut args| {
            Ok(Box::new(Flood {
                output: args.writer("output")?,
                count: args.get::<i32>("count")? as usize,
                panic: args.get::<bool>("panic")?,
            }) as Box<dyn Processor>)
        });
        registry
    }

    fn stage() -> IRStage {
        let mut arguments = BTreeMap::new();
        arguments.insert("input".into(), IRArgument::literal("urn:in"));
        arguments.insert("output".into(), IRArgument::literal("urn:out"));
        IRStage {
            uri: "urn:stage:upper".into(),
            runner: "urn:runner".into(),
            processor: IRProcessor {
                uri: "urn:proc:upper".into(),
                implementation: "upper".into(),
                parameters: vec![
                    IRParameter::literal("input", LiteralType::Reader),
                    IRParameter::literal("output", LiteralType::Writer),
                ],
                metadata: BTreeMap::new(),
            },
            arguments,
        }
    }

    fn flood_stage(count: usize, panic: bool) -> IRStage {
        let mut arguments = BTreeMap::new();
        arguments.insert("output".into(), IRArgument::literal("urn:out"));
        arguments.insert("count".into(), IRArgument::literal(count.to_string()));
        arguments.insert("panic".into(), IRArgument::literal(panic.to_string()));
        IRStage {
            uri: "urn:stage:flood".into(),
            runner: "urn:runner".into(),
            processor: IRProcessor {
                uri: "urn:proc:flood".into(),
                implementation: "flood".into(),
                parameters: vec![
                    IRParameter::literal("output", LiteralType::Writer),
                    IRParameter::literal("count", LiteralType::Int),
                    IRParameter::literal("panic", LiteralType::Boolean),
                ],
                metadata: BTreeMap::new(),
            },
            arguments,
        }
    }

    async fn prepare_and_execute(host_w: &mut DuplexStream, lines: &mut Lines<BufReader<DuplexStream>>, stage: IRStage) {
        let params = json!(PrepareParams { stage });
        send(host_w, Request::call(Id::Number(1), Method::Prepare, Some(params))).await;
        match next(lines).await {
            Message::Response(r) => assert!(r.error.is_none(), "{r:?}"),
            other => panic!("unexpected {other:?}"),
        }
        send(host_w, Request::call(Id::Number(2), Method::Execute, None)).await;
    }

    fn frame_of(msg: Message) -> Option<ChannelFrame> {
        match msg {
            Message::Request(req) => Some(serde_json::from_value(req.params.unwrap()).unwrap()),
            Message::Response(_) => None,
        }
    }

    async fn send(w: &mut DuplexStream, req: Request) {
        w.write_all(to_line(&req).unwrap().as_bytes()).await.unwrap();
    }

    async fn next(lines: &mut Lines<BufReader<DuplexStream>>) -> Message {
        let line = lines.next_line().await.unwrap().expect("worker closed output");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn serves_a_stage_end_to_end() {
        let (mut host_w, worker_r) = tokio::io::duplex(4096);
        let (worker_w, host_r) = tokio::io::duplex(4096);
        let worker = tokio::spawn(serve(registry(), worker_r, worker_w));
        let mut lines = BufReader::new(host_r).lines();

        send(&mut host_w, Request::call(Id::Number(1), Method::Ping, None)).await;
        assert!(matches!(next(&mut lines).await, Message::Response(r) if r.result.is_some()));

        let params = json!(PrepareParams { stage: stage() });
        send(&mut host_w, Request::call(Id::Number(2), Method::Prepare, Some(params))).await;
        match next(&mut lines).await {
            Message::Response(r) => assert!(r.error.is_none(), "{r:?}"),
            other => panic!("unexpected {other:?}"),
        }

        send(&mut host_w, Request::call(Id::Number(3), Method::Execute, None)).await;
        let data = Request::notification(Method::Channel, Some(json!(ChannelFrame::data("urn:in", b"hello"))));
        send(&mut host_w, data).await;
        let close = Request::notification(Method::Channel, Some(json!(ChannelFrame::close("urn:in"))));
        send(&mut host_w, close).await;

        let mut frames = Vec::new();
        let mut credits = Vec::new();
        let result = loop {
            match next(&mut lines).await {
                Message::Request(req) => {
                    let frame: ChannelFrame = serde_json::from_value(req.params.unwrap()).unwrap();
                    match frame.kind {
                        FrameKind::Credit { .. } => credits.push(frame),
                        _ => frames.push(frame),
                    }
                }
                Message::Response(rsp) => break rsp,
            }
        };
        assert_eq!(frames, vec![ChannelFrame::data("urn:out", b"HELLO"), ChannelFrame::close("urn:out")]);
        assert_eq!(credits, vec![ChannelFrame::credit("urn:in", 1)]);

        let result: ExecuteResult = serde_json::from_value(result.result.unwrap()).unwrap();
        assert_eq!(result.stages, vec![StageResult { stage: "urn:stage:upper".into(), error: None }]);

        send(&mut host_w, Request::notification(Method::Shutdown, None)).await;
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejects_unknown_processor_and_method() {
        let (mut host_w, worker_r) = tokio::io::duplex(4096);
        let (worker_w, host_r) = tokio::io::duplex(4096);
        let worker = tokio::spawn(serve(ProcessorRegistry::new(), worker_r, worker_w));
        let mut lines = BufReader::new(host_r).lines();

        let params = json!(PrepareParams { stage: stage() });
        send(&mut host_w, Request::call(Id::Number(1), Method::Prepare, Some(params))).await;
        match next(&mut lines).await {
            Message::Response(r) => assert_eq!(r.error.unwrap().code, PREPARE_FAILED),
            other => panic!("unexpected {other:?}"),
        }

        host_w.write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"bogus\",\"id\":7}\n").await.unwrap();
        match next(&mut lines).await {
            Message::Response(r) => assert_eq!(r.error.unwrap().code, METHOD_NOT_FOUND),
            other => panic!("unexpected {other:?}"),
        }

        drop(host_w);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn writers_stop_at_the_window_until_credited() {
        let (mut host_w, worker_r) = tokio::io::duplex(1 << 16);
        let (worker_w, host_r) = tokio::io::duplex(1 << 16);
        let worker = tokio::spawn(serve(registry(), worker_r, worker_w));
        let mut lines = BufReader::new(host_r).lines();

        let total = CHANNEL_WINDOW + 4;
        prepare_and_execute(&mut host_w, &mut lines, flood_stage(total, false)).await;

        for i in 0..CHANNEL_WINDOW {
            let frame = frame_of(next(&mut lines).await).unwrap();
            assert_eq!(frame, ChannelFrame::data("urn:out", format!("m{i}").as_bytes()));
        }
        // window exhausted, nothing more until we hand out credits
        let idle = tokio::time::timeout(std::time::Duration::from_millis(100), lines.next_line()).await;
        assert!(idle.is_err(), "worker exceeded its window");

        let credit = Request::notification(Method::Channel, Some(json!(ChannelFrame::credit("urn:out", 4))));
        send(&mut host_w, credit).await;
        for i in CHANNEL_WINDOW..total {
            let frame = frame_of(next(&mut lines).await).unwrap();
            assert_eq!(frame, ChannelFrame::data("urn:out", format!("m{i}").as_bytes()));
        }
        assert_eq!(frame_of(next(&mut lines).await), Some(ChannelFrame::close("urn:out")));
        assert!(frame_of(next(&mut lines).await).is_none());

        drop(host_w);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicking_stage_still_closes_its_writers() {
        let (mut host_w, worker_r) = tokio::io::duplex(4096);
        let (worker_w, host_r) = tokio::io::duplex(4096);
        let worker = tokio::spawn(serve(registry(), worker_r, worker_w));
        let mut lines = BufReader::new(host_r).lines();

        prepare_and_execute(&mut host_w, &mut lines, flood_stage(1, true)).await;

        assert_eq!(frame_of(next(&mut lines).await), Some(ChannelFrame::data("urn:out", b"m0")));
        assert_eq!(frame_of(next(&mut lines).await), Some(ChannelFrame::close("urn:out")));
        let result = match next(&mut lines).await {
            Message::Response(rsp) => serde_json::from_value::<ExecuteResult>(rsp.result.unwrap()).unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(result.stages[0].error.as_deref(), Some("stage panicked"));

        drop(host_w);
        worker.await.unwrap().unwrap();
    }
}
