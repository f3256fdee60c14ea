//! Sampled allocation events and their text encoding.

use std::any::Any;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use crate::config::Verbosity;

/// A managed object as seen by the hook.
pub type ObjectRef = Arc<dyn Any + Send + Sync>;

/// Weak handle used only to test whether an object is still reachable.
pub type WeakObjectRef = Weak<dyn Any + Send + Sync>;

/// One call-stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    pub class: Arc<str>,
    pub method: Arc<str>,
    pub line: Option<u32>,
}

impl Frame {
    pub fn new(class: impl Into<Arc<str>>, method: impl Into<Arc<str>>, line: Option<u32>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
            line,
        }
    }
}

/// Data common to every event: what was allocated, how big, and where.
#[derive(Debug, Clone)]
pub struct Sample {
    pub size: u64,
    pub type_name: Arc<str>,
    /// Innermost frame first.
    pub trace: Vec<Frame>,
}

#[derive(Debug, Clone)]
pub enum Event {
    Allocation(Sample),
    Lifetime {
        sample: Sample,
        object: WeakObjectRef,
    },
}

impl Event {
    pub fn sample(&self) -> &Sample {
        match self {
            Event::Allocation(sample) | Event::Lifetime { sample, .. } => sample,
        }
    }

    /// Lifetime events are alive while the object is; allocation events always are.
    pub fn is_alive(&self) -> bool {
        match self {
            Event::Allocation(_) => true,
            Event::Lifetime { object, .. } => object.strong_count() > 0,
        }
    }
}

/// Formats events as `outer;...;inner;<type> <size>\n`.
///
/// Frames are written outermost first. Once a frame whose class starts with
/// the internal prefix is reached, the rest of the stack (the tracer's own
/// frames and everything they call) is dropped. Whitespace and `;` inside
/// frame text become `_` and `,`, so a line always has exactly one space.
#[derive(Debug, Clone)]
pub struct EventFormatter {
    verbosity: Verbosity,
    internal_prefix: String,
}

impl EventFormatter {
    pub fn new(verbosity: Verbosity, internal_prefix: impl Into<String>) -> Self {
        Self {
            verbosity,
            internal_prefix: internal_prefix.into(),
        }
    }

    pub fn format(&self, sample: &Sample) -> String {
        let mut line = String::with_capacity(64 + sample.trace.len() * 32);
        self.write_to(sample, &mut line);
        line
    }

    pub fn write_to(&self, sample: &Sample, out: &mut String) {
        for frame in sample.trace.iter().rev() {
            if self.is_internal(&frame.class) {
                break;
            }
            match self.verbosity {
                Verbosity::MethodName => push_sanitized(out, &frame.method),
                Verbosity::MethodClassName => {
                    push_sanitized(out, &frame.class);
                    out.push('.');
                    push_sanitized(out, &frame.method);
                }
                Verbosity::MethodClassLineNumber => {
                    push_sanitized(out, &frame.class);
                    out.push('.');
                    push_sanitized(out, &frame.method);
                    let _ = write!(out, ":{}", frame.line.unwrap_or(0));
                }
            }
            out.push(';');
        }
        push_sanitized(out, &sample.type_name);
        let _ = writeln!(out, " {}", sample.size);
    }

    /// Trait-impl frames (`<path::Type as Trait>`) count by their self type.
    fn is_internal(&self, class: &str) -> bool {
        !self.internal_prefix.is_empty()
            && class.trim_start_matches('<').starts_with(&self.internal_prefix)
    }
}

fn push_sanitized(out: &mut String, text: &str) {
    out.extend(text.chars().map(|c| match c {
        ';' => ',',
        c if c.is_whitespace() => '_',
        c => c,
    }));
}
