//! Merge sampled stacks into per-stack byte totals.
//!
//! Input lines are `<stack key> <bytes>` as written by the flame and
//! lifetime printers; `#` lines are headers and are skipped. Output is one
//! `<canonical key> <total>` line per distinct stack, the format flame
//! graph tooling reads.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::stacks;

/// How a method filter treats stacks that do not mention it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Keep them, squashed but not truncated.
    #[default]
    KeepUnmatched,
    /// Drop them.
    Exclusive,
}

/// A data line that could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    /// 1-based, counting comment lines.
    pub number: u64,
    pub text: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Fewer than two fields.
    Incomplete,
    /// Last field is not a byte count.
    BadSize,
}

#[derive(Debug, Default)]
pub struct Collapser {
    traces: BTreeMap<String, u64>,
    filter: Option<String>,
    mode: FilterMode,
    lines: u64,
    skipped: Vec<SkippedLine>,
}

impl Collapser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Truncate matching stacks at the first frame containing `filter`
    /// (case-insensitive).
    pub fn with_filter(mut self, filter: &str, mode: FilterMode) -> Self {
        self.filter = Some(filter.to_lowercase());
        self.mode = mode;
        self
    }

    /// Canonical form of `key` under the current filter. Empty means the
    /// stack is dropped.
    pub fn canonicalize(&self, key: &str) -> String {
        match &self.filter {
            None => stacks::squash(key),
            Some(filter) if stacks::matches_filter(key, filter) => {
                stacks::truncate_and_squash(key, filter)
            }
            Some(_) => match self.mode {
                FilterMode::KeepUnmatched => stacks::squash(key),
                FilterMode::Exclusive => String::new(),
            },
        }
    }

    /// Account one input line.
    pub fn add_line(&mut self, line: &str) {
        self.lines += 1;
        if line.starts_with('#') {
            return;
        }

        // The byte count is the last field; the key is everything before it.
        let Some((key, size)) = line
            .trim()
            .rsplit_once(char::is_whitespace)
            .map(|(key, size)| (key.trim_end(), size))
            .filter(|(key, _)| !key.is_empty())
        else {
            self.skip(line, SkipReason::Incomplete);
            return;
        };
        let Ok(size) = size.parse::<u64>() else {
            self.skip(line, SkipReason::BadSize);
            return;
        };

        let key = self.canonicalize(key);
        if key.trim().is_empty() {
            return;
        }
        let total = self.traces.entry(key).or_insert(0);
        *total = total.saturating_add(size);
    }

    fn skip(&mut self, line: &str, reason: SkipReason) {
        self.skipped.push(SkippedLine {
            number: self.lines,
            text: line.to_string(),
            reason,
        });
    }

    pub fn read_from(&mut self, reader: impl BufRead) -> io::Result<()> {
        for line in reader.lines() {
            self.add_line(&line?);
        }
        Ok(())
    }

    /// Read every line of the file at `path`.
    pub fn collapse_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::InputNotFound(path.to_path_buf()),
            _ => Error::Read {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        self.read_from(BufReader::new(file)).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write `<key> <total>` lines in key order; returns the number written.
    pub fn write_to(&self, mut out: impl Write) -> io::Result<u64> {
        for (key, total) in &self.traces {
            writeln!(out, "{key} {total}")?;
        }
        out.flush()?;
        Ok(self.traces.len() as u64)
    }

    pub fn write_file(&self, path: &Path) -> Result<u64> {
        let write_err = |source| Error::Write {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(write_err)?;
        self.write_to(BufWriter::new(file)).map_err(write_err)
    }

    /// Input lines seen, comments included.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Distinct canonical stacks.
    pub fn keys(&self) -> usize {
        self.traces.len()
    }

    pub fn total(&self, key: &str) -> Option<u64> {
        self.traces.get(key).copied()
    }

    pub fn skipped(&self) -> &[SkippedLine] {
        &self.skipped
    }

    /// The `n` stacks with the most bytes, heaviest first.
    pub fn top(&self, n: usize) -> Vec<(&str, u64)> {
        let mut entries: Vec<(&str, u64)> = self
            .traces
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries.truncate(n);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collapse(collapser: &mut Collapser, input: &str) -> String {
        collapser.read_from(input.as_bytes()).unwrap();
        let mut out = Vec::new();
        collapser.write_to(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn squashes_recursion() {
        let mut c = Collapser::new();
        assert_eq!(collapse(&mut c, "a;a;a;b 10\n"), "a;b; 10\n");
    }

    #[test]
    fn sums_identical_stacks() {
        let mut c = Collapser::new();
        assert_eq!(collapse(&mut c, "a;b 100\na;b 50\n"), "a;b; 150\n");
        assert_eq!(c.lines(), 2);
        assert_eq!(c.keys(), 1);
    }

    #[test]
    fn filter_truncates_matching_and_keeps_others() {
        let mut c = Collapser::new().with_filter("B", FilterMode::KeepUnmatched);
        let out = collapse(&mut c, "a;b;c 5\nx;y;z 7\n");
        assert_eq!(out, "b;c; 5\nx;y;z; 7\n");
    }

    #[test]
    fn exclusive_filter_drops_unmatched() {
        let mut c = Collapser::new().with_filter("b", FilterMode::Exclusive);
        let out = collapse(&mut c, "a;b;c 5\nx;y;z 7\n");
        assert_eq!(out, "b;c; 5\n");
    }

    #[test]
    fn skips_comments_and_malformed_lines() {
        let mut c = Collapser::new();
        let out = collapse(
            &mut c,
            "# allocprof flame samples\nonlyonefield\na;b 1\na;b lots\n#GC 3\n",
        );
        assert_eq!(out, "a;b; 1\n");
        assert_eq!(c.lines(), 5);
        assert_eq!(
            c.skipped(),
            [
                SkippedLine {
                    number: 2,
                    text: "onlyonefield".into(),
                    reason: SkipReason::Incomplete,
                },
                SkippedLine {
                    number: 4,
                    text: "a;b lots".into(),
                    reason: SkipReason::BadSize,
                },
            ]
        );
    }

    #[test]
    fn size_is_taken_from_the_last_field() {
        let mut c = Collapser::new();
        let out = collapse(
            &mut c,
            "std::rt::lang_start;<app::Job as core::ops::function::FnOnce<()>>::call_once.x;app.main;T 8\n",
        );
        assert!(c.skipped().is_empty());
        assert_eq!(
            out,
            "std::rt::lang_start;<app::Job as core::ops::function::FnOnce<()>>::call_once.x;app.main;T; 8\n"
        );
    }

    #[test]
    fn empty_keys_are_dropped() {
        let mut c = Collapser::new();
        assert_eq!(collapse(&mut c, "; 4\n;; 8\n"), "");
        assert_eq!(c.keys(), 0);
    }

    #[test]
    fn top_orders_by_bytes() {
        let mut c = Collapser::new();
        collapse(&mut c, "a 1\nb 30\nc 20\nb 5\n");
        assert_eq!(c.top(2), vec![("b;", 35), ("c;", 20)]);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Collapser::new()
            .collapse_file(&dir.path().join("stacks.txt"))
            .unwrap_err();
        assert!(matches!(err, Error::InputNotFound(_)));
    }
}
