//! Live progress and log events fanned out over a broadcast channel.
//!
//! Only subscribers present at publish time receive an event; nothing is
//! queued for late joiners. [`Event::Shutdown`] is the last event a
//! subscriber should expect.

use serde::Serialize;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::RecvError;

/// Default buffer size for the event channel.
///
/// Subscribers that fall further behind lose the oldest events.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// One event on the bus, serialized as `{"type": "<kebab-case>", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    Log {
        line: String,
        ts: i64,
    },
    SyncStart {
        trove: bool,
    },
    SyncComplete {
        ts: i64,
        assets: usize,
    },
    SyncFailed {
        error: String,
    },
    DownloadStart {
        done: usize,
        total: usize,
    },
    DownloadProgress {
        done: usize,
        total: usize,
        skipped: usize,
        failed: usize,
        file: String,
    },
    DownloadComplete {
        ts: i64,
        done: usize,
        total: usize,
        skipped: usize,
        failed: usize,
    },
    DownloadFailed {
        error: String,
    },
    Shutdown,
}

/// Publish side of the event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes to every current subscriber and returns how many there were.
    pub fn publish(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Registers a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receive side for one consumer.
///
/// Usable from async code through [`Subscriber::recv`] and from plain
/// threads through [`Subscriber::blocking_recv`].
#[derive(Debug)]
pub struct Subscriber {
    rx: broadcast::Receiver<Event>,
}

impl Subscriber {
    /// Waits for the next event; `None` once every publisher is gone.
    ///
    /// Lagging behind the buffer drops the missed events and keeps going.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => log::warn!("Event subscriber missed {n} events"),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Blocking form of [`Subscriber::recv`] for threads outside the runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.blocking_recv() {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => log::warn!("Event subscriber missed {n} events"),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Unwraps the underlying broadcast receiver.
    #[must_use]
    pub fn into_inner(self) -> broadcast::Receiver<Event> {
        self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.publish(Event::Shutdown), 2);
        assert_eq!(a.recv().await, Some(Event::Shutdown));
        assert_eq!(b.recv().await, Some(Event::Shutdown));
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::default();
        assert_eq!(
            bus.publish(Event::SyncFailed {
                error: "x".into()
            }),
            0
        );
        let mut late = bus.subscribe();
        bus.publish(Event::Shutdown);
        assert_eq!(late.recv().await, Some(Event::Shutdown));
    }

    #[tokio::test]
    async fn lagging_subscriber_keeps_receiving() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for done in 0..5 {
            bus.publish(Event::DownloadStart { done, total: 5 });
        }
        assert_eq!(
            sub.recv().await,
            Some(Event::DownloadStart { done: 3, total: 5 })
        );
    }

    #[tokio::test]
    async fn closed_bus_ends_stream() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn blocking_subscriber_on_plain_thread() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        let reader = std::thread::spawn(move || sub.blocking_recv());
        bus.publish(Event::Shutdown);
        assert_eq!(reader.join().unwrap(), Some(Event::Shutdown));
    }

    #[test]
    fn events_serialize_with_kebab_case_type() {
        let json = serde_json::to_value(Event::DownloadProgress {
            done: 1,
            total: 3,
            skipped: 0,
            failed: 1,
            file: "a.pdf".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "download-progress");
        assert_eq!(json["failed"], 1);
        assert_eq!(
            serde_json::to_value(Event::Shutdown).unwrap(),
            serde_json::json!({"type": "shutdown"})
        );
    }
}
