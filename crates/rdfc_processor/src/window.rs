//! Per-channel send windows for frames multiplexed over one connection.
//!
//! A side may only put a data frame on the wire while it holds a credit for
//! that channel. The peer hands a credit back once the message left its
//! demultiplexer, so neither connection loop ever waits for a single
//! channel's readers and at most [`CHANNEL_WINDOW`] messages per channel are
//! buffered in between.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::Semaphore;

/// Credits each side starts with, per channel.
pub const CHANNEL_WINDOW: usize = 16;

#[derive(Clone, Default)]
pub struct Windows {
    channels: Arc<DashMap<String, Arc<Semaphore>>>,
    closed: Arc<AtomicBool>,
}

impl Windows {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, uri: &str) -> Arc<Semaphore> {
        let entry = self.channels.entry(uri.to_string()).or_insert_with(|| {
            let window = Semaphore::new(CHANNEL_WINDOW);
            if self.closed.load(Ordering::SeqCst) {
                window.close();
            }
            Arc::new(window)
        });
        Arc::clone(&entry)
    }

    /// Take one credit for `uri`, waiting for the peer if none is left.
    /// Returns `false` once the windows were closed.
    pub async fn acquire(&self, uri: &str) -> bool {
        match self.window(uri).acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Credits returned by the peer.
    pub fn grant(&self, uri: &str, amount: u32) {
        let window = self.window(uri);
        let room = Semaphore::MAX_PERMITS.saturating_sub(window.available_permits());
        window.add_permits((amount as usize).min(room));
    }

    /// Wake every waiter with a failure, the connection is gone.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.channels.iter() {
            entry.value().close();
        }
    }

    pub fn available(&self, uri: &str) -> usize {
        self.window(uri).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sender_waits_for_credit() {
        let windows = Windows::new();
        for _ in 0..CHANNEL_WINDOW {
            assert!(windows.acquire("urn:a").await);
        }
        assert_eq!(windows.available("urn:a"), 0);
        // another channel has its own window
        assert_eq!(windows.available("urn:b"), CHANNEL_WINDOW);

        let waiting = {
            let windows = windows.clone();
            tokio::spawn(async move { windows.acquire("urn:a").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        windows.grant("urn:a", 1);
        assert!(waiting.await.unwrap());
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let windows = Windows::new();
        for _ in 0..CHANNEL_WINDOW {
            windows.acquire("urn:a").await;
        }
        let waiting = {
            let windows = windows.clone();
            tokio::spawn(async move { windows.acquire("urn:a").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        windows.close();
        assert!(!waiting.await.unwrap());
        assert!(!windows.acquire("urn:later").await);
    }
}
