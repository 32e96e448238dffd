//! Topic subscriptions for notifications.
//!
//! Neovim delivers events as `[2, method, params]` notifications, usually
//! produced by `vim.rpcnotify(channel, method, ...)`. The method string is the
//! topic. Each subscription owns a bounded channel; the dispatcher waits for
//! room in it, so a slow consumer throttles the connection instead of losing
//! events.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::value::Value;

type Subscribers = Vec<(u64, mpsc::Sender<Value>)>;

#[derive(Debug, Default)]
pub struct NotificationRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: u64,
    topics: HashMap<String, Subscribers>,
    closed: bool,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `topic` with a channel of `capacity` payloads.
    ///
    /// After [`close_all`](Self::close_all) the returned subscription is
    /// already ended.
    pub fn subscribe(self: &Arc<Self>, topic: impl Into<String>, capacity: usize) -> Subscription {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        if inner.closed {
            debug!("Subscription to {:?} created after close", topic);
        } else {
            inner.topics.entry(topic.clone()).or_default().push((id, tx));
        }

        Subscription {
            topic,
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Delivery handles for every live subscription to `topic`.
    ///
    /// The handles are cloned out so the caller can wait on them without
    /// holding the registry lock.
    pub fn senders(&self, topic: &str) -> Subscribers {
        self.lock().topics.get(topic).cloned().unwrap_or_default()
    }

    /// Remove one subscription. Returns whether it was registered.
    pub fn unsubscribe(&self, topic: &str, id: u64) -> bool {
        let mut inner = self.lock();
        let Some(subscribers) = inner.topics.get_mut(topic) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            inner.topics.remove(topic);
        }
        removed
    }

    /// Close every subscription and refuse new ones. Consumers still
    /// receive what is already buffered, then their sequence ends.
    pub fn close_all(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        inner.topics.drain().map(|(_, subs)| subs.len()).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }
}

/// A live subscription to one topic.
///
/// Yields payloads in arrival order until the connection closes or the
/// subscription is dropped, either through [`next`](Self::next) or as a
/// [`Stream`]. Dropping it unregisters the topic interest, and a
/// dispatcher blocked on this subscription's full channel is released.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<Value>,
    registry: Weak<NotificationRegistry>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next payload. Returns `None` once the subscription has
    /// been closed and everything buffered has been consumed.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Take a buffered payload without waiting.
    pub fn try_next(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving notifications for this topic.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.topic, self.id);
        }
    }
}
