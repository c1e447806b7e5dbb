//! Many-to-many message channels keyed by URI.
//!
//! Every channel keeps its set of registered senders and one bounded queue per
//! receiver. A message is delivered to every receiver in registration order
//! and a send only completes once each receiver queue accepted it, which is
//! what gives the pipeline its back-pressure. When the last sender of a
//! channel unregisters, the receiver queues are dropped so each reader sees
//! the end of the stream exactly once, after everything already queued.
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use rdfc_processor::arguments::ChannelBinder;
use rdfc_processor::channel::{self, ChannelSink, Reader, Writer};
use rdfc_processor::error::ChannelError;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

pub const DEFAULT_CAPACITY: usize = 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("no registered sender on channel `{uri}`")]
    NoRegisteredSender { uri: String },

    #[error("channel `{uri}` is already closed")]
    ChannelClosed { uri: String },
}

/// Handle returned by [`Broker::register_sender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(u64);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender#{}", self.0)
    }
}

enum Slot {
    Open {
        senders: HashSet<SenderId>,
        receivers: Vec<mpsc::Sender<Vec<u8>>>,
        /// Serializes deliveries so every receiver sees the same order.
        gate: Arc<Mutex<()>>,
    },
    Closed,
}

impl Slot {
    fn open() -> Self {
        Slot::Open {
            senders: HashSet::new(),
            receivers: Vec::new(),
            gate: Arc::new(Mutex::new(())),
        }
    }
}

struct Inner {
    channels: DashMap<String, Slot>,
    next_id: AtomicU64,
    capacity: usize,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("channels", &self.channels())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl Broker {
    /// `capacity` bounds each receiver queue, zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn register_sender(&self, uri: &str) -> Result<SenderId, BrokerError> {
        let mut slot = self.inner.channels.entry(uri.to_string()).or_insert_with(Slot::open);
        match &mut *slot {
            Slot::Open { senders, .. } => {
                let id = SenderId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
                senders.insert(id);
                debug!(channel = uri, %id, "sender registered");
                Ok(id)
            }
            Slot::Closed => Err(BrokerError::ChannelClosed { uri: uri.to_string() }),
        }
    }

    pub fn register_receiver(&self, uri: &str) -> Result<Reader, BrokerError> {
        let mut slot = self.inner.channels.entry(uri.to_string()).or_insert_with(Slot::open);
        match &mut *slot {
            Slot::Open { receivers, .. } => {
                let (tx, reader) = channel::channel(uri, self.inner.capacity);
                receivers.push(tx);
                debug!(channel = uri, receivers = receivers.len(), "receiver registered");
                Ok(reader)
            }
            Slot::Closed => Err(BrokerError::ChannelClosed { uri: uri.to_string() }),
        }
    }

    /// Deliver `payload` to every receiver of `uri`, waiting for queue space.
    pub async fn send(&self, uri: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        // snapshot under the shard lock, deliver without it
        let (gate, targets) = {
            let slot = self
                .inner
                .channels
                .get(uri)
                .ok_or_else(|| BrokerError::NoRegisteredSender { uri: uri.to_string() })?;
            match &*slot {
                Slot::Open {
                    senders,
                    receivers,
                    gate,
                } if !senders.is_empty() => (Arc::clone(gate), receivers.clone()),
                _ => return Err(BrokerError::NoRegisteredSender { uri: uri.to_string() }),
            }
        };

        if targets.is_empty() {
            debug!(channel = uri, bytes = payload.len(), "no receivers, message dropped");
            return Ok(());
        }

        let _order = gate.lock().await;
        for tx in &targets {
            if tx.send(payload.clone()).await.is_err() {
                debug!(channel = uri, "receiver dropped, skipping");
            }
        }
        Ok(())
    }

    /// Remove `sender` from `uri`. The last sender leaving closes the channel.
    /// Unknown channels or senders are ignored.
    pub fn unregister(&self, uri: &str, sender: SenderId) {
        let Some(mut slot) = self.inner.channels.get_mut(uri) else {
            return;
        };
        let now_empty = match &mut *slot {
            Slot::Open { senders, .. } => {
                if !senders.remove(&sender) {
                    return;
                }
                senders.is_empty()
            }
            Slot::Closed => return,
        };
        if now_empty {
            // dropping the queue senders ends every reader
            *slot = Slot::Closed;
            info!(channel = uri, "channel closed");
        } else {
            debug!(channel = uri, %sender, "sender unregistered");
        }
    }

    /// Close every channel that has readers but no sender, returning their URIs.
    pub fn close_orphans(&self) -> Vec<String> {
        let mut closed = Vec::new();
        for mut entry in self.inner.channels.iter_mut() {
            let orphan = matches!(
                &*entry,
                Slot::Open { senders, receivers, .. } if senders.is_empty() && !receivers.is_empty()
            );
            if orphan {
                closed.push(entry.key().clone());
                *entry.value_mut() = Slot::Closed;
            }
        }
        closed.sort();
        for uri in &closed {
            info!(channel = %uri, "closing channel without senders");
        }
        closed
    }

    pub fn channels(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.inner.channels.iter().map(|e| e.key().clone()).collect();
        uris.sort();
        uris
    }

    pub fn is_closed(&self, uri: &str) -> bool {
        self.inner
            .channels
            .get(uri)
            .is_some_and(|slot| matches!(&*slot, Slot::Closed))
    }

    pub fn sender_count(&self, uri: &str) -> usize {
        match self.inner.channels.get(uri).as_deref() {
            Some(Slot::Open { senders, .. }) => senders.len(),
            _ => 0,
        }
    }

    /// Register a sender and wrap it in a [`Writer`] whose close unregisters it.
    pub fn writer(&self, uri: &str) -> Result<(Writer, SenderId), BrokerError> {
        let id = self.register_sender(uri)?;
        let sink = BrokerSink {
            broker: self.clone(),
            sender: id,
        };
        Ok((Writer::new(uri, Arc::new(sink)), id))
    }
}

/// [`ChannelSink`] backed by one registered broker sender.
pub struct BrokerSink {
    broker: Broker,
    sender: SenderId,
}

#[async_trait]
impl ChannelSink for BrokerSink {
    async fn send(&self, uri: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.broker
            .send(uri, payload)
            .await
            .map_err(|e| ChannelError::Delivery {
                uri: uri.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self, uri: &str) -> Result<(), ChannelError> {
        self.broker.unregister(uri, self.sender);
        Ok(())
    }
}

/// Binds stage channels straight onto the broker and remembers every sender
/// it registered, so the owner can release them when the stage ends.
pub struct BrokerBinder<'a> {
    broker: &'a Broker,
    senders: Vec<(String, SenderId)>,
}

impl<'a> BrokerBinder<'a> {
    pub fn new(broker: &'a Broker) -> Self {
        Self {
            broker,
            senders: Vec::new(),
        }
    }

    pub fn into_senders(self) -> Vec<(String, SenderId)> {
        self.senders
    }
}

impl ChannelBinder for BrokerBinder<'_> {
    fn reader(&mut self, uri: &str) -> Result<Reader, ChannelError> {
        self.broker.register_receiver(uri).map_err(|e| ChannelError::Bind {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
    }

    fn writer(&mut self, uri: &str) -> Result<Writer, ChannelError> {
        let (writer, id) = self.broker.writer(uri).map_err(|e| ChannelError::Bind {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        self.senders.push((uri.to_string(), id));
        Ok(writer)
    }
}
