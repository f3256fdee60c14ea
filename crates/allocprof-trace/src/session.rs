//! A running tracing session: recorder on the hot path, printer thread
//! behind the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::{RecorderKind, SessionConfig, StrategyKind};
use crate::context::ThreadContext;
use crate::error::{Error, Result};
use crate::event::ObjectRef;
use crate::printer::{self, CollectionCounter, FlamePrinter, LifetimePrinter, ManualCollectionCounter, Printer};
use crate::queue::event_queue;
use crate::recorder::Recorder;
use crate::sample::{AllocationCountSampler, Clock, PeriodicSampler, SampleStrategy, SystemClock};
use crate::size_cache::{ShallowSizeMeasurer, SizeMeasurer};
use crate::stack::{NativeStackWalker, StackWalker};

/// Runtime primitives the session needs from its host.
#[derive(Clone)]
pub struct Host {
    pub measurer: Arc<dyn SizeMeasurer>,
    pub walker: Arc<dyn StackWalker>,
    pub collections: Arc<dyn CollectionCounter>,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            measurer: Arc::new(ShallowSizeMeasurer),
            walker: Arc::new(NativeStackWalker::default()),
            collections: Arc::new(ManualCollectionCounter::new()),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    recorder: Arc<Recorder>,
    stop: Arc<AtomicBool>,
    printer: Option<JoinHandle<()>>,
}

impl Session {
    /// Start a session with the default host primitives.
    pub fn start(config: SessionConfig) -> Result<Self> {
        Self::start_with(config, Host::default())
    }

    /// Validate `config`, open the output and spawn the printer thread.
    ///
    /// Errors here only mean tracing is off; the caller's program is
    /// unaffected.
    pub fn start_with(config: SessionConfig, host: Host) -> Result<Self> {
        config.validate()?;

        let printer: Box<dyn Printer> = match config.recorder {
            RecorderKind::Flame => Box::new(FlamePrinter::new(&config)?),
            RecorderKind::Lifetime => {
                Box::new(LifetimePrinter::new(&config, Arc::clone(&host.collections))?)
            }
        };

        let (queue, rx) = event_queue(config.queue_capacity);
        let recorder = Recorder::new(config.recorder, build_strategy(&config), queue)
            .with_measurer(host.measurer)
            .with_walker(host.walker)
            .with_size_cache_capacity(config.size_cache_capacity)
            .with_record_size(config.record_size);
        let recorder = Arc::new(recorder);

        let stop = Arc::new(AtomicBool::new(false));
        let thread_name = match config.recorder {
            RecorderKind::Flame => "allocprof-flame",
            RecorderKind::Lifetime => "allocprof-lifetime",
        };
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(thread_name.to_string())
                .spawn(move || printer::run(printer, rx, stop))
                .map_err(|e| Error::Spawn(e.to_string()))?
        };
        recorder.exclude_printer_thread(handle.thread().id());

        tracing::info!(
            recorder = ?config.recorder,
            strategy = ?config.strategy,
            output = %config.output_path.display(),
            "allocation tracing started"
        );

        Ok(Self {
            recorder,
            stop,
            printer: Some(handle),
        })
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// The allocation hook, using the calling thread's implicit context.
    #[inline]
    pub fn record_allocation(&self, count: i32, type_desc: &str, obj: &ObjectRef) {
        self.recorder.record_current(count, type_desc, obj);
    }

    /// The allocation hook with an explicit per-task context.
    #[inline]
    pub fn record(&self, cx: &mut ThreadContext, count: i32, type_desc: &str, obj: &ObjectRef) {
        self.recorder.record(cx, count, type_desc, obj);
    }

    /// Stop the printer, write out what is queued, and close the output.
    pub fn shutdown(mut self) {
        self.stop_printer();
    }

    fn stop_printer(&mut self) {
        let Some(handle) = self.printer.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            tracing::warn!("allocation printer thread panicked");
        }
        tracing::info!(dropped = self.recorder.dropped(), "allocation tracing stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_printer();
    }
}

fn build_strategy(config: &SessionConfig) -> Box<dyn SampleStrategy> {
    // Allocations are eligible from the start instant itself.
    let start_ms = SystemClock
        .now_millis()
        .saturating_add(config.start_delay.as_millis() as u64)
        .saturating_sub(1);
    let jitter = config.effective_jitter();
    match config.strategy {
        StrategyKind::AllocationCount => {
            Box::new(AllocationCountSampler::new(start_ms, config.sample_rate, jitter))
        }
        StrategyKind::Time => Box::new(PeriodicSampler::new(
            start_ms,
            config.sample_interval.as_millis() as u64,
            jitter,
        )),
    }
}
