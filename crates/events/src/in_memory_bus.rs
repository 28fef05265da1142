//! Process-local bus backed by `std::sync::mpsc` channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};
use crate::event::Event;

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    #[error("subscriber list lock poisoned")]
    Poisoned,
}

/// Synchronous in-process fan-out. Subscriptions that were dropped are
/// forgotten on the next publish.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
    published: AtomicU64,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Events accepted since the bus was created, listened to or not.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
        }
    }
}

impl<M: Event> EventBus<M> for InMemoryEventBus<M> {
    type Error = InMemoryBusError;

    fn publish(&self, event: M) -> Result<usize, Self::Error> {
        let mut subscribers = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(subscribers.len())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        // Poisoned: the subscription stays silent.
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        Subscription::new(rx)
    }
}
