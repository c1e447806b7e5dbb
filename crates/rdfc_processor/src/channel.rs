//! Reader and Writer capabilities handed to processors.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// Where a [`Writer`] delivers its messages.
///
/// In the orchestrator this is the broker, inside a worker it is the RPC
/// connection back to the orchestrator.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send(&self, uri: &str, payload: Vec<u8>) -> Result<(), ChannelError>;
    async fn close(&self, uri: &str) -> Result<(), ChannelError>;
}

pub struct Writer {
    uri: String,
    sink: Arc<dyn ChannelSink>,
    closed: AtomicBool,
}

impl Writer {
    pub fn new(uri: impl Into<String>, sink: Arc<dyn ChannelSink>) -> Self {
        Self {
            uri: uri.into(),
            sink,
            closed: AtomicBool::new(false),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Deliver one message. Waits while downstream readers are full.
    pub async fn write(&self, payload: impl Into<Vec<u8>>) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.uri.clone()));
        }
        self.sink.send(&self.uri, payload.into()).await
    }

    /// Release this writer. Only the first call reaches the sink.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sink.close(&self.uri).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("uri", &self.uri)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving end of a channel. `read` yields `None` once every sender is gone.
#[derive(Debug)]
pub struct Reader {
    uri: String,
    rx: mpsc::Receiver<Vec<u8>>,
    ended: bool,
}

impl Reader {
    pub fn new(uri: impl Into<String>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            uri: uri.into(),
            rx,
            ended: false,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub async fn read(&mut self) -> Option<Vec<u8>> {
        if self.ended {
            return None;
        }
        let next = self.rx.recv().await;
        if next.is_none() {
            self.ended = true;
        }
        next
    }

    /// Read the stream to its end.
    pub async fn collect(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(msg) = self.read().await {
            out.push(msg);
        }
        out
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

/// Bounded queue feeding a [`Reader`]. A capacity of zero is bumped to one.
pub fn channel(uri: impl Into<String>, capacity: usize) -> (mpsc::Sender<Vec<u8>>, Reader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Reader::new(uri, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        closes: Mutex<usize>,
    }

    #[async_trait]
    impl ChannelSink for RecordingSink {
        async fn send(&self, uri: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
            self.sent.lock().await.push((uri.to_string(), payload));
            Ok(())
        }

        async fn close(&self, _uri: &str) -> Result<(), ChannelError> {
            *self.closes.lock().await += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn writer_close_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let writer = Writer::new("urn:ch", sink.clone());

        writer.write("a").await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(*sink.closes.lock().await, 1);
        assert_eq!(writer.write("b").await, Err(ChannelError::Closed("urn:ch".into())));
        assert_eq!(sink.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn reader_stays_ended() {
        let (tx, mut reader) = channel("urn:ch", 4);
        tx.send(b"x".to_vec()).await.unwrap();
        drop(tx);

        assert_eq!(reader.read().await, Some(b"x".to_vec()));
        assert_eq!(reader.read().await, None);
        assert_eq!(reader.read().await, None);
        assert!(reader.is_ended());
    }
}
