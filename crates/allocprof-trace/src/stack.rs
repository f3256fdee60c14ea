//! Call-stack capture.

use std::sync::Arc;

use crate::event::Frame;

/// Max native frames captured per sample.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Host primitive that captures the calling thread's stack.
pub trait StackWalker: Send + Sync {
    /// Frames innermost first.
    fn capture(&self) -> Vec<Frame>;
}

/// Walks the native stack with `backtrace` and splits each demangled symbol
/// path into a class (`path::to`) and method (`fn`).
#[derive(Debug, Clone)]
pub struct NativeStackWalker {
    max_depth: usize,
}

impl Default for NativeStackWalker {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl NativeStackWalker {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }
}

impl StackWalker for NativeStackWalker {
    fn capture(&self) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(32);
        backtrace::trace(|frame| {
            if frames.len() >= self.max_depth {
                return false;
            }
            // One physical frame resolves to several symbols when callers
            // were inlined into it, innermost first.
            backtrace::resolve_frame(frame, |symbol| {
                if frames.len() >= self.max_depth {
                    return;
                }
                if let Some(raw) = symbol.name().and_then(|name| name.as_str()) {
                    frames.push(split_symbol(raw, symbol.lineno()));
                }
            });
            true
        });
        frames
    }
}

/// Demangle `raw` (hash suffix removed) and split at the last `::`.
pub(crate) fn split_symbol(raw: &str, line: Option<u32>) -> Frame {
    let demangled = format!("{:#}", rustc_demangle::demangle(raw));
    match split_path(&demangled) {
        Some((class, method)) => Frame::new(class, method, line),
        None => Frame::new(Arc::<str>::from(""), demangled, line),
    }
}

/// Split at the last top-level `::`, ignoring separators inside `<...>`.
fn split_path(path: &str) -> Option<(&str, &str)> {
    let bytes = path.as_bytes();
    let mut depth = 0usize;
    let mut split = None;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                split = Some(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    split.map(|idx| (&path[..idx], &path[idx + 2..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_paths() {
        let frame = split_symbol("app::cache::Cache::fill", Some(12));
        assert_eq!(&*frame.class, "app::cache::Cache");
        assert_eq!(&*frame.method, "fill");
        assert_eq!(frame.line, Some(12));
    }

    #[test]
    fn ignores_separators_inside_generics() {
        let frame = split_symbol("<app::Foo as core::fmt::Debug>::fmt", None);
        assert_eq!(&*frame.class, "<app::Foo as core::fmt::Debug>");
        assert_eq!(&*frame.method, "fmt");
    }

    #[test]
    fn demangles_and_drops_hash() {
        let frame = split_symbol("_ZN3app4main17h0123456789abcdefE", None);
        assert_eq!(&*frame.class, "app");
        assert_eq!(&*frame.method, "main");
    }

    #[test]
    fn bare_symbol_has_empty_class() {
        let frame = split_symbol("malloc", None);
        assert_eq!(&*frame.class, "");
        assert_eq!(&*frame.method, "malloc");
    }

    #[test]
    fn native_walker_sees_this_test() {
        let frames = NativeStackWalker::default().capture();
        assert!(!frames.is_empty());
        assert!(frames.len() <= DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn native_walker_reports_itself_as_internal() {
        let frames = NativeStackWalker::default().capture();
        let capture = frames
            .iter()
            .position(|f| f.class.contains("NativeStackWalker") && &*f.method == "capture")
            .unwrap();
        assert!(frames[capture].class.trim_start_matches('<').starts_with("allocprof_trace"));
        let test = frames
            .iter()
            .position(|f| &*f.method == "native_walker_reports_itself_as_internal")
            .unwrap();
        assert!(capture < test);
    }

    #[test]
    fn depth_limit_counts_inlined_symbols() {
        assert_eq!(NativeStackWalker::new(2).capture().len(), 2);
    }
}
