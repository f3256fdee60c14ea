use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::event::{Event, EventFormatter};
use crate::queue::EventReceiver;

use super::{Output, Printer};

/// Minimum time between two checks of the control file.
const CONTROL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Writes one line per event to `<output><index>`, rotating to the next
/// index on a fixed interval.
#[derive(Debug)]
pub struct FlamePrinter {
    base: PathBuf,
    next_index: u64,
    output: Output,
    opened_at: Instant,
    rotate_every: Option<Duration>,
    gate: Option<ControlGate>,
    formatter: EventFormatter,
    line: String,
}

impl FlamePrinter {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let base = config.output_path.clone();
        let output = open_indexed(&base, 0)?;
        Ok(Self {
            base,
            next_index: 1,
            output,
            opened_at: Instant::now(),
            rotate_every: config.rotate_interval,
            gate: config.control_file.clone().map(ControlGate::new),
            formatter: EventFormatter::new(config.verbosity, config.internal_prefix.clone()),
            line: String::with_capacity(256),
        })
    }

    /// Path of the file currently written.
    pub fn current_path(&self) -> &Path {
        self.output.path()
    }

    fn rotate_if_due(&mut self, now: Instant) {
        let Some(every) = self.rotate_every else {
            return;
        };
        if now.duration_since(self.opened_at) < every || !self.output.is_enabled() {
            return;
        }
        if let Err(e) = self.output.close() {
            tracing::warn!(path = %self.output.path().display(), error = %e, "failed to close rotated output");
        }
        match open_indexed(&self.base, self.next_index) {
            Ok(output) => {
                tracing::debug!(path = %output.path().display(), "rotated flame output");
                self.output = output;
            }
            Err(e) => tracing::warn!(error = %e, "flame output rotation failed, output disabled"),
        }
        self.next_index += 1;
        self.opened_at = now;
    }
}

impl Printer for FlamePrinter {
    fn print(&mut self, event: Event) {
        if let Some(gate) = self.gate.as_mut()
            && !gate.is_open(Instant::now())
        {
            return;
        }
        self.line.clear();
        self.formatter.write_to(event.sample(), &mut self.line);
        self.output.write_str(&self.line);
    }

    fn tick(&mut self, _rx: &EventReceiver) {
        self.rotate_if_due(Instant::now());
    }

    fn close(&mut self) -> io::Result<()> {
        self.output.close()
    }
}

fn open_indexed(base: &Path, index: u64) -> Result<Output> {
    let mut name = OsString::from(base.as_os_str());
    name.push(index.to_string());
    let mut output = Output::create(Path::new(&name))?;
    output.write_str(&format!(
        "# allocprof flame samples, opened {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    Ok(output)
}

/// Emission is allowed only while the control file exists.
#[derive(Debug)]
struct ControlGate {
    path: PathBuf,
    open: bool,
    checked_at: Option<Instant>,
}

impl ControlGate {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            open: false,
            checked_at: None,
        }
    }

    fn is_open(&mut self, now: Instant) -> bool {
        let stale = self
            .checked_at
            .is_none_or(|at| now.duration_since(at) >= CONTROL_CHECK_INTERVAL);
        if stale {
            self.open = self.path.exists();
            self.checked_at = Some(now);
        }
        self.open
    }
}
