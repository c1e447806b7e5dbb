//! Line-delimited JSON-RPC client used to drive a worker.
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use rdfc_processor::jsonrpc::{Id, Message, Request, Response, to_line};
use rdfc_processor::message::{ChannelFrame, Method};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::RunnerError;

const OUTBOUND_CAPACITY: usize = 32;

/// Traffic the worker initiates.
#[derive(Debug)]
pub enum Inbound {
    Frame(ChannelFrame),
    Unrecognized(String),
    Lost,
}

pub struct RpcConnection {
    runner: String,
    out: mpsc::Sender<String>,
    inflight: Arc<DashMap<String, oneshot::Sender<Response>>>,
    lost: Arc<AtomicBool>,
    next_id: AtomicI64,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcConnection {
    /// Start the reader and writer tasks over a byte stream pair.
    pub fn start<R, W>(runner: impl Into<String>, input: R, output: W, inbound_capacity: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let runner = runner.into();
        let (out, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let inflight: Arc<DashMap<String, oneshot::Sender<Response>>> = Arc::new(DashMap::new());
        let lost = Arc::new(AtomicBool::new(false));

        // ── queue → worker ───────────────────────────────────────────
        let writer = {
            let runner = runner.clone();
            let mut output = output;
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if output.write_all(line.as_bytes()).await.is_err() || output.flush().await.is_err() {
                        warn!(%runner, "worker stopped accepting input");
                        break;
                    }
                }
            })
        };

        // ── worker → responses | channel frames ──────────────────────
        let reader = {
            let runner = runner.clone();
            let inflight = Arc::clone(&inflight);
            let lost = Arc::clone(&lost);
            tokio::spawn(async move {
                let mut lines = BufReader::new(input).lines();
                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            error!(%runner, "read from worker failed: {e}");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let inbound = match serde_json::from_str::<Message>(&line) {
                        Ok(Message::Response(rsp)) => {
                            if let Some((_, tx)) = inflight.remove(&rsp.id.key()) {
                                let _ = tx.send(rsp);
                            } else {
                                warn!(%runner, id = ?rsp.id, "response for unknown request");
                            }
                            continue;
                        }
                        Ok(Message::Request(req)) => match decode_frame(&req) {
                            Some(frame) => Inbound::Frame(frame),
                            None => Inbound::Unrecognized(line),
                        },
                        Err(_) => Inbound::Unrecognized(line),
                    };
                    if inbound_tx.send(inbound).await.is_err() {
                        debug!(%runner, "inbound queue dropped");
                    }
                }
                lost.store(true, Ordering::SeqCst);
                // dropping the responders fails every pending call
                inflight.clear();
                let _ = inbound_tx.send(Inbound::Lost).await;
                debug!(%runner, "worker output closed");
            })
        };

        Self {
            runner,
            out,
            inflight,
            lost,
            next_id: AtomicI64::new(1),
            inbound: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(vec![writer, reader]),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn lost_error(&self) -> RunnerError {
        RunnerError::ConnectionLost {
            runner: self.runner.clone(),
        }
    }

    /// Hand out the inbound frame queue. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Queue a call. The request is on its way once this returns.
    pub async fn request(&self, method: Method, params: Option<Value>) -> Result<PendingCall, RunnerError> {
        let id = Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let key = id.key();
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(key.clone(), tx);
        if self.is_lost() {
            self.inflight.remove(&key);
            return Err(self.lost_error());
        }

        let line = to_line(&Request::call(id, method, params)).map_err(|e| RunnerError::UnrecognizedRequest {
            runner: self.runner.clone(),
            message: e.to_string(),
        })?;
        if self.out.send(line).await.is_err() {
            self.inflight.remove(&key);
            return Err(self.lost_error());
        }
        Ok(PendingCall {
            runner: self.runner.clone(),
            rx,
        })
    }

    pub async fn call(&self, method: Method, params: Option<Value>) -> Result<Value, RunnerError> {
        self.request(method, params).await?.response().await
    }

    pub async fn notify(&self, method: Method, params: Option<Value>) -> Result<(), RunnerError> {
        if self.is_lost() {
            return Err(self.lost_error());
        }
        let line = to_line(&Request::notification(method, params)).map_err(|e| {
            RunnerError::UnrecognizedRequest {
                runner: self.runner.clone(),
                message: e.to_string(),
            }
        })?;
        self.out.send(line).await.map_err(|_| self.lost_error())
    }

    pub async fn send_frame(&self, frame: ChannelFrame) -> Result<(), RunnerError> {
        let params = serde_json::to_value(&frame).map_err(|e| RunnerError::UnrecognizedRequest {
            runner: self.runner.clone(),
            message: e.to_string(),
        })?;
        self.notify(Method::Channel, Some(params)).await
    }

    /// Stop both I/O tasks, which also closes the worker's input.
    pub fn close(&self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        self.inflight.clear();
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// A call whose request went out and whose response is still due.
pub struct PendingCall {
    runner: String,
    rx: oneshot::Receiver<Response>,
}

impl PendingCall {
    pub async fn response(self) -> Result<Value, RunnerError> {
        let rsp = self.rx.await.map_err(|_| RunnerError::ConnectionLost {
            runner: self.runner.clone(),
        })?;
        match (rsp.error, rsp.result) {
            (Some(err), _) => Err(RunnerError::Remote {
                runner: self.runner,
                code: err.code,
                message: err.message,
            }),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }
}

fn decode_frame(req: &Request) -> Option<ChannelFrame> {
    if req.method.parse::<Method>().ok()? != Method::Channel {
        return None;
    }
    serde_json::from_value(req.params.clone()?).ok()
}
