//! Bounded MPSC hand-off between allocating threads and the printer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::event::Event;

/// Producer side. Cheap to clone; never blocks.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Outcome of one [`EventReceiver::poll`].
#[derive(Debug)]
pub enum Polled {
    Event(Event),
    /// Nothing arrived within the timeout.
    Idle,
    /// Every producer is gone and the queue is empty.
    Closed,
}

/// Consumer side, owned by the printer thread.
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

/// Create a queue holding at most `capacity` events.
pub fn event_queue(capacity: usize) -> (EventQueue, EventReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventQueue {
            tx,
            dropped: Arc::clone(&dropped),
        },
        EventReceiver { rx, dropped },
    )
}

impl EventQueue {
    /// Enqueue without blocking. Returns false if the event was dropped.
    #[inline]
    pub fn offer(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Events dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl EventReceiver {
    /// Wait up to `timeout` for the next event.
    pub fn poll(&self, timeout: Duration) -> Polled {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Polled::Event(event),
            Err(RecvTimeoutError::Timeout) => Polled::Idle,
            Err(RecvTimeoutError::Disconnected) => Polled::Closed,
        }
    }

    /// Take everything currently queued without waiting.
    pub fn drain(&self) -> impl Iterator<Item = Event> + '_ {
        self.rx.try_iter()
    }

    /// Discard everything currently queued. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
