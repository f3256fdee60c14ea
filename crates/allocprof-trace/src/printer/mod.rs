//! Background consumers of the event queue.
//!
//! One printer thread runs per session. It polls the queue with a short
//! timeout so that time-driven work (file rotation, collection-epoch flushes)
//! still happens when no events arrive.

mod flame;
mod lifetime;

pub use flame::FlamePrinter;
pub use lifetime::{CollectionCounter, LifetimePrinter, ManualCollectionCounter};

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::queue::{EventReceiver, Polled};

/// How long one queue poll waits before the printer ticks anyway.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1);

pub trait Printer: Send {
    /// Consume one event.
    fn print(&mut self, event: Event);

    /// Called after every poll, whether or not an event arrived.
    fn tick(&mut self, rx: &EventReceiver);

    /// Flush and close the output.
    fn close(&mut self) -> io::Result<()>;
}

/// Drain `rx` into `printer` until `stop` is raised or every producer is gone.
pub fn run(mut printer: Box<dyn Printer>, rx: EventReceiver, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::Acquire) {
            for event in rx.drain() {
                printer.print(event);
            }
            break;
        }
        match rx.poll(POLL_TIMEOUT) {
            Polled::Event(event) => printer.print(event),
            Polled::Idle => {}
            Polled::Closed => break,
        }
        printer.tick(&rx);
    }

    let dropped = rx.dropped();
    if dropped > 0 {
        tracing::debug!(dropped, "events dropped on a full queue");
    }
    if let Err(e) = printer.close() {
        tracing::warn!(error = %e, "failed to close allocation output");
    }
}

/// Buffered output file that shuts itself off after the first write error.
#[derive(Debug)]
pub(crate) struct Output {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl Output {
    /// Create (truncating) `path`. Failure here is a startup error.
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|source| Error::Output {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn write_str(&mut self, text: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writer.write_all(text.as_bytes()) {
            self.disable(e);
        }
    }

    pub(crate) fn flush(&mut self) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writer.flush() {
            self.disable(e);
        }
    }

    pub(crate) fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }

    fn disable(&mut self, error: io::Error) {
        tracing::warn!(
            path = %self.path.display(),
            error = %error,
            "write failed, disabling allocation output"
        );
        self.writer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Sample;
    use crate::queue::event_queue;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        seen: Arc<Mutex<Vec<u64>>>,
        ticks: u64,
        closed: Arc<AtomicBool>,
    }

    impl Printer for Collecting {
        fn print(&mut self, event: Event) {
            self.seen.lock().unwrap().push(event.sample().size);
        }

        fn tick(&mut self, _rx: &EventReceiver) {
            self.ticks += 1;
        }

        fn close(&mut self) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(size: u64) -> Event {
        Event::Allocation(Sample {
            size,
            type_name: Arc::from("T"),
            trace: Vec::new(),
        })
    }

    #[test]
    fn stop_drains_backlog_then_closes() {
        let (queue, rx) = event_queue(16);
        for size in 0..4 {
            queue.offer(event(size));
        }
        let printer = Collecting::default();
        let seen = Arc::clone(&printer.seen);
        let closed = Arc::clone(&printer.closed);
        let stop = Arc::new(AtomicBool::new(true));

        run(Box::new(printer), rx, stop);

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn exits_when_producers_disconnect() {
        let (queue, rx) = event_queue(16);
        queue.offer(event(9));
        drop(queue);
        let printer = Collecting::default();
        let seen = Arc::clone(&printer.seen);

        run(Box::new(printer), rx, Arc::new(AtomicBool::new(false)));

        assert_eq!(*seen.lock().unwrap(), vec![9]);
    }

    #[test]
    fn output_writes_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut output = Output::create(&path).unwrap();
        output.write_str("a;b;T 1\n");
        output.close().unwrap();
        assert!(!output.is_enabled());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a;b;T 1\n");
    }

    #[test]
    fn output_create_failure_is_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Output::create(&dir.path().join("missing").join("out.txt")).unwrap_err();
        assert!(matches!(err, Error::Output { .. }));
    }
}
