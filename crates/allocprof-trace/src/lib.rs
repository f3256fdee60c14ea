//! In-process allocation sampling.
//!
//! This crate traces allocation behavior of a running program:
//! - **Injection**: [`inject::Injector`] rewrites loaded routines so every
//!   allocation calls the recording hook
//! - **Sampling**: count-based or periodic strategies bound the overhead
//! - **Recording**: the hook measures, captures the stack and enqueues an
//!   event without blocking
//! - **Printing**: one background thread writes flame lines or
//!   collection-epoch survivor lines
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use allocprof_trace::{Session, SessionConfig};
//!
//! let config = SessionConfig::default().with_output_path("/tmp/stacks.txt");
//! let session = Session::start(config)?;
//!
//! let obj: allocprof_trace::ObjectRef = Arc::new(vec![0u8; 64]);
//! session.record_allocation(allocprof_trace::SINGLE_OBJECT, "Vec<u8>", &obj);
//!
//! session.shutdown();
//! # Ok::<(), allocprof_trace::Error>(())
//! ```
//!
//! The resulting file is read by `allocprof collapse`.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod inject;
pub mod printer;
pub mod queue;
pub mod recorder;
pub mod sample;
pub mod session;
pub mod size_cache;
pub mod stack;

pub use config::{RecorderKind, SessionConfig, StrategyKind, Verbosity};
pub use context::ThreadContext;
pub use error::{Error, Result};
pub use event::{Event, Frame, ObjectRef, Sample, WeakObjectRef};
pub use printer::{CollectionCounter, ManualCollectionCounter};
pub use recorder::{Recorder, SINGLE_OBJECT};
pub use sample::{AllocationCountSampler, PeriodicSampler, SampleStrategy};
pub use session::{Host, Session};
pub use size_cache::{ShallowSizeMeasurer, SizeMeasurer};
pub use stack::{NativeStackWalker, StackWalker};
