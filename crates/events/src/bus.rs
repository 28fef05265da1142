//! Stock event fan-out.
//!
//! The ledger and the movement table are the source of truth; the bus only
//! tells interested parties (notifiers, dashboards) that something committed.
//! The engine publishes after commit, so a failed publish never loses stock
//! state. Subscribers must tolerate gaps: an event published while nobody is
//! subscribed is gone.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::event::Event;

/// Receiving end of a bus. Sees every event published after it was created,
/// in publish order.
///
/// ```ignore
/// let alerts = bus.subscribe();
/// loop {
///     match alerts.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) if event.event_type() == "stock.alert.low_stock" => notify(event),
///         Ok(_) | Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M: Event> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Next queued event, if one is already waiting.
    pub fn try_next(&self) -> Option<M> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything queued so far.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }

    /// Queued events of one type; events of other types are discarded.
    pub fn drain_of_type(&self, event_type: &str) -> Vec<M> {
        self.receiver
            .try_iter()
            .filter(|event| event.event_type() == event_type)
            .collect()
    }
}

/// Publish/subscribe contract for [`Event`]s.
///
/// `publish` reports how many subscriptions the event reached. Zero is not an
/// error. Implementations are shared across request handlers, hence
/// `Send + Sync`.
pub trait EventBus<M: Event>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn publish(&self, event: M) -> Result<usize, Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    M: Event,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, event: M) -> Result<usize, Self::Error> {
        (**self).publish(event)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
