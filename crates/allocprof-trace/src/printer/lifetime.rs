use std::fmt::Write as _;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::event::{Event, EventFormatter};
use crate::queue::EventReceiver;

use super::{Output, Printer};

/// The host's young-generation collection counter.
pub trait CollectionCounter: Send + Sync {
    fn collection_count(&self) -> u64;
}

/// Counter advanced explicitly by the host.
///
/// Hosts without a tracing collector call [`advance`](Self::advance) at
/// whatever point they consider an epoch boundary (end of a request, an
/// arena reset, ...).
#[derive(Debug, Default)]
pub struct ManualCollectionCounter(AtomicU64);

impl ManualCollectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter; returns the new value.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl CollectionCounter for ManualCollectionCounter {
    fn collection_count(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Buffers events for one collection epoch and writes the survivors when
/// the epoch ends.
pub struct LifetimePrinter {
    output: Output,
    counter: Arc<dyn CollectionCounter>,
    epoch: u64,
    buffer: Vec<Event>,
    formatter: EventFormatter,
    line: String,
}

impl std::fmt::Debug for LifetimePrinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifetimePrinter")
            .field("output", &self.output)
            .field("epoch", &self.epoch)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl LifetimePrinter {
    pub fn new(config: &SessionConfig, counter: Arc<dyn CollectionCounter>) -> Result<Self> {
        let output = Output::create(&config.output_path)?;
        let epoch = counter.collection_count();
        Ok(Self {
            output,
            counter,
            epoch,
            buffer: Vec::new(),
            formatter: EventFormatter::new(config.verbosity, config.internal_prefix.clone()),
            line: String::with_capacity(256),
        })
    }

    /// Write `#GC <epoch>` and every buffered event still alive, then clear.
    fn flush_epoch(&mut self) {
        self.line.clear();
        let _ = writeln!(self.line, "#GC {}", self.epoch);
        for event in self.buffer.drain(..).filter(Event::is_alive) {
            self.formatter.write_to(event.sample(), &mut self.line);
        }
        self.output.write_str(&self.line);
        self.output.flush();
    }
}

impl Printer for LifetimePrinter {
    fn print(&mut self, event: Event) {
        self.buffer.push(event);
    }

    fn tick(&mut self, rx: &EventReceiver) {
        let count = self.counter.collection_count();
        if count <= self.epoch {
            return;
        }
        self.flush_epoch();
        let discarded = rx.clear();
        if discarded > 0 {
            tracing::trace!(discarded, "discarded events queued during epoch flush");
        }
        self.epoch = count;
    }

    fn close(&mut self) -> io::Result<()> {
        self.output.close()
    }
}
