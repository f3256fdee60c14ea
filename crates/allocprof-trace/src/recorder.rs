//! The allocation hook's synchronous half.
//!
//! [`Recorder::record`] runs inline on the allocating thread right after a
//! sampled allocation. It must stay cheap: one sampler decision, a size
//! lookup, a stack capture and a non-blocking enqueue. Everything else
//! happens on the printer thread.

use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use crate::config::RecorderKind;
use crate::context::{ThreadContext, with_thread_context};
use crate::event::{Event, ObjectRef, Sample};
use crate::queue::EventQueue;
use crate::sample::SampleStrategy;
use crate::size_cache::{ObjectSizeCache, ShallowSizeMeasurer, SizeMeasurer};
use crate::stack::{NativeStackWalker, StackWalker};

/// `count` value passed by the hook for a non-array allocation.
pub const SINGLE_OBJECT: i32 = -1;

pub struct Recorder {
    kind: RecorderKind,
    strategy: Box<dyn SampleStrategy>,
    sizes: ObjectSizeCache,
    measurer: Arc<dyn SizeMeasurer>,
    walker: Arc<dyn StackWalker>,
    queue: EventQueue,
    record_size: bool,
    printer_thread: OnceLock<ThreadId>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("kind", &self.kind)
            .field("record_size", &self.record_size)
            .field("cached_sizes", &self.sizes.len())
            .field("dropped", &self.queue.dropped())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    pub fn new(kind: RecorderKind, strategy: Box<dyn SampleStrategy>, queue: EventQueue) -> Self {
        Self {
            kind,
            strategy,
            sizes: ObjectSizeCache::new(crate::config::DEFAULT_SIZE_CACHE_CAPACITY),
            measurer: Arc::new(ShallowSizeMeasurer),
            walker: Arc::new(NativeStackWalker::default()),
            queue,
            record_size: true,
            printer_thread: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn with_measurer(mut self, measurer: Arc<dyn SizeMeasurer>) -> Self {
        self.measurer = measurer;
        self
    }

    #[must_use]
    pub fn with_walker(mut self, walker: Arc<dyn StackWalker>) -> Self {
        self.walker = walker;
        self
    }

    #[must_use]
    pub fn with_size_cache_capacity(mut self, capacity: usize) -> Self {
        self.sizes = ObjectSizeCache::new(capacity);
        self
    }

    /// When false, every sample is recorded with size 1.
    #[must_use]
    pub fn with_record_size(mut self, record_size: bool) -> Self {
        self.record_size = record_size;
        self
    }

    /// Exclude `id` from recording. Only the first call takes effect.
    pub fn exclude_printer_thread(&self, id: ThreadId) {
        let _ = self.printer_thread.set(id);
    }

    pub fn kind(&self) -> RecorderKind {
        self.kind
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Events waiting for the printer.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Record one allocation.
    ///
    /// `count` is [`SINGLE_OBJECT`] for plain objects and the element count
    /// (or dimension count) for arrays. Calls made while `cx` is already
    /// recording return immediately.
    pub fn record(&self, cx: &mut ThreadContext, count: i32, type_desc: &str, obj: &ObjectRef) {
        let Some(mut guard) = cx.enter() else {
            return;
        };
        if self.is_printer_thread() {
            return;
        }
        if !self.strategy.can_sample(guard.context()) {
            return;
        }

        let size = self.measure(count, obj);
        let sample = Sample {
            size,
            type_name: Arc::from(type_desc),
            trace: self.walker.capture(),
        };
        let event = match self.kind {
            RecorderKind::Flame => Event::Allocation(sample),
            RecorderKind::Lifetime => Event::Lifetime {
                sample,
                object: Arc::downgrade(obj),
            },
        };
        self.queue.offer(event);
    }

    /// [`Recorder::record`] against the calling thread's implicit context.
    pub fn record_current(&self, count: i32, type_desc: &str, obj: &ObjectRef) {
        with_thread_context(|cx| self.record(cx, count, type_desc, obj));
    }

    fn measure(&self, count: i32, obj: &ObjectRef) -> u64 {
        if !self.record_size {
            1
        } else if count < 0 {
            self.sizes.size_of(obj, self.measurer.as_ref())
        } else {
            self.measurer.object_size(obj)
        }
    }

    #[inline]
    fn is_printer_thread(&self) -> bool {
        self.printer_thread
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Frame;
    use crate::queue::{EventReceiver, event_queue};
    use crate::sample::AllocationCountSampler;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedWalker;

    impl StackWalker for FixedWalker {
        fn capture(&self) -> Vec<Frame> {
            vec![
                Frame::new("app::Cache", "fill", Some(3)),
                Frame::new("app::Main", "main", Some(1)),
            ]
        }
    }

    struct CountingMeasurer(AtomicU64);

    impl SizeMeasurer for CountingMeasurer {
        fn object_size(&self, _obj: &ObjectRef) -> u64 {
            self.0.fetch_add(1, Ordering::SeqCst);
            48
        }
    }

    fn every_call() -> Box<dyn SampleStrategy> {
        Box::new(AllocationCountSampler::new(0, 1, 0))
    }

    fn recorder(kind: RecorderKind) -> (Recorder, EventReceiver) {
        let (queue, rx) = event_queue(64);
        let recorder = Recorder::new(kind, every_call(), queue).with_walker(Arc::new(FixedWalker));
        (recorder, rx)
    }

    #[test]
    fn records_flame_event() {
        let (recorder, rx) = recorder(RecorderKind::Flame);
        let obj: ObjectRef = Arc::new(0u64);
        recorder.record(&mut ThreadContext::new(), SINGLE_OBJECT, "java/lang/Long", &obj);

        let events: Vec<Event> = rx.drain().collect();
        assert_eq!(events.len(), 1);
        let sample = events[0].sample();
        assert_eq!(sample.size, 8);
        assert_eq!(&*sample.type_name, "java/lang/Long");
        assert_eq!(sample.trace.len(), 2);
        assert!(matches!(events[0], Event::Allocation(_)));
    }

    #[test]
    fn lifetime_event_holds_weak_handle() {
        let (recorder, rx) = recorder(RecorderKind::Lifetime);
        let obj: ObjectRef = Arc::new(1u32);
        recorder.record(&mut ThreadContext::new(), SINGLE_OBJECT, "T", &obj);
        let event = rx.drain().next().unwrap();
        assert!(event.is_alive());
        drop(obj);
        assert!(!event.is_alive());
    }

    #[test]
    fn nested_call_on_recording_context_is_noop() {
        let (recorder, rx) = recorder(RecorderKind::Flame);
        let obj: ObjectRef = Arc::new(0u8);
        let mut cx = ThreadContext::new();
        cx.recording = true;
        recorder.record(&mut cx, SINGLE_OBJECT, "T", &obj);
        assert_eq!(rx.drain().count(), 0);
        assert!(cx.is_recording());
    }

    /// Measurer that allocates through the hook again, like a host whose
    /// size primitive is itself instrumented.
    struct ReentrantMeasurer {
        recorder: OnceLock<Weak<Recorder>>,
        inner_calls: AtomicU64,
    }

    impl SizeMeasurer for ReentrantMeasurer {
        fn object_size(&self, obj: &ObjectRef) -> u64 {
            self.inner_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(recorder) = self.recorder.get().and_then(Weak::upgrade) {
                recorder.record_current(SINGLE_OBJECT, "inner", obj);
            }
            1
        }
    }

    #[test]
    fn reentrant_hook_through_thread_context_is_noop() {
        let (queue, rx) = event_queue(64);
        let measurer = Arc::new(ReentrantMeasurer {
            recorder: OnceLock::new(),
            inner_calls: AtomicU64::new(0),
        });
        let recorder = Arc::new(
            Recorder::new(RecorderKind::Flame, every_call(), queue)
                .with_walker(Arc::new(FixedWalker))
                .with_measurer(measurer.clone()),
        );
        let _ = measurer.recorder.set(Arc::downgrade(&recorder));

        let obj: ObjectRef = Arc::new(0u8);
        recorder.record_current(0, "outer", &obj);

        let names: Vec<String> = rx
            .drain()
            .map(|e| e.sample().type_name.to_string())
            .collect();
        assert_eq!(names, vec!["outer".to_string()]);
        assert_eq!(measurer.inner_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn printer_thread_is_never_recorded() {
        let (recorder, rx) = recorder(RecorderKind::Flame);
        let recorder = Arc::new(recorder);
        let obj: ObjectRef = Arc::new(0u8);

        let printer = {
            let recorder = Arc::clone(&recorder);
            let obj = Arc::clone(&obj);
            thread::spawn(move || {
                recorder.exclude_printer_thread(thread::current().id());
                recorder.record(&mut ThreadContext::new(), SINGLE_OBJECT, "printer", &obj);
            })
        };
        printer.join().unwrap();
        recorder.record(&mut ThreadContext::new(), SINGLE_OBJECT, "app", &obj);

        let names: Vec<String> = rx
            .drain()
            .map(|e| e.sample().type_name.to_string())
            .collect();
        assert_eq!(names, vec!["app".to_string()]);
    }

    #[test]
    fn singles_use_cache_and_arrays_measure_directly() {
        let (queue, rx) = event_queue(64);
        let measurer = Arc::new(CountingMeasurer(AtomicU64::new(0)));
        let recorder = Recorder::new(RecorderKind::Flame, every_call(), queue)
            .with_walker(Arc::new(FixedWalker))
            .with_measurer(measurer.clone());
        let mut cx = ThreadContext::new();
        let obj: ObjectRef = Arc::new(0u64);

        recorder.record(&mut cx, SINGLE_OBJECT, "T", &obj);
        recorder.record(&mut cx, SINGLE_OBJECT, "T", &obj);
        assert_eq!(measurer.0.load(Ordering::SeqCst), 1);

        recorder.record(&mut cx, 10, "T", &obj);
        recorder.record(&mut cx, 10, "T", &obj);
        assert_eq!(measurer.0.load(Ordering::SeqCst), 3);
        assert!(rx.drain().all(|e| e.sample().size == 48));
    }

    #[test]
    fn size_recording_off_records_one() {
        let (queue, rx) = event_queue(64);
        let recorder = Recorder::new(RecorderKind::Flame, every_call(), queue)
            .with_walker(Arc::new(FixedWalker))
            .with_record_size(false);
        let obj: ObjectRef = Arc::new([0u8; 100]);
        recorder.record(&mut ThreadContext::new(), 100, "[B", &obj);
        assert_eq!(rx.drain().next().unwrap().sample().size, 1);
    }

    #[test]
    fn rejected_samples_enqueue_nothing() {
        let (queue, rx) = event_queue(64);
        let strategy = Box::new(AllocationCountSampler::new(u64::MAX, 1, 0));
        let recorder = Recorder::new(RecorderKind::Flame, strategy, queue);
        let obj: ObjectRef = Arc::new(0u8);
        recorder.record(&mut ThreadContext::new(), SINGLE_OBJECT, "T", &obj);
        assert_eq!(rx.drain().count(), 0);
    }
}
