use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

pub const RECORDER_PROPERTY: &str = "recorder";
pub const RECORD_SIZE_PROPERTY: &str = "record.size";
pub const OUTPUT_PATH_PROPERTY: &str = "output.file";
pub const VERBOSITY_LEVEL_PROPERTY: &str = "stack.trace.verbosity";
pub const SAMPLE_STRATEGY_PROPERTY: &str = "sample.strategy";
pub const DELAY_SECS_PROPERTY: &str = "sample.delay.secs";
pub const SAMPLE_RATE_PROPERTY: &str = "sample.rate";
pub const SAMPLE_INTERVAL_PROPERTY: &str = "sample.interval.ms";
pub const JITTER_PROPERTY: &str = "sample.jitter";
pub const ROTATE_PROPERTY: &str = "output.rotate";
pub const CONTROL_FILE_PROPERTY: &str = "control.file";
pub const QUEUE_CAPACITY_PROPERTY: &str = "queue.capacity";
pub const SIZE_CACHE_CAPACITY_PROPERTY: &str = "size.cache.capacity";

pub const DEFAULT_OUTPUT_PATH: &str = "/tmp/stacks.txt";
pub const DEFAULT_SAMPLE_RATE: u64 = 10_000;
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 2048;
pub const DEFAULT_SIZE_CACHE_CAPACITY: usize = 100_000;
pub const DEFAULT_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Frames whose class starts with this prefix belong to the tracer itself.
pub const DEFAULT_INTERNAL_PREFIX: &str = "allocprof_trace";

/// Which printer consumes the session's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderKind {
    /// Aggregated call stacks for flame graphs.
    Flame,
    /// Per-object survival across young collections.
    Lifetime,
}

impl FromStr for RecorderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flame" => Ok(RecorderKind::Flame),
            "lifetime" => Ok(RecorderKind::Lifetime),
            other => Err(Error::Config(format!("Unknown recorder '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Every Nth allocation per thread.
    AllocationCount,
    /// At most one allocation per interval, process wide.
    Time,
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allocationCount" => Ok(StrategyKind::AllocationCount),
            "time" => Ok(StrategyKind::Time),
            other => Err(Error::Config(format!("Unknown sample strategy '{other}'"))),
        }
    }
}

/// How much of each frame is written to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// `method`
    MethodName,
    /// `class.method`
    #[default]
    MethodClassName,
    /// `class.method:line`
    MethodClassLineNumber,
}

impl FromStr for Verbosity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "methodName" => Ok(Verbosity::MethodName),
            "methodClassName" => Ok(Verbosity::MethodClassName),
            "methodClassLineNumber" => Ok(Verbosity::MethodClassLineNumber),
            other => Err(Error::invalid(
                VERBOSITY_LEVEL_PROPERTY,
                other,
                "expected methodName, methodClassName or methodClassLineNumber",
            )),
        }
    }
}

/// Settings for one tracing session, supplied once at startup.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub recorder: RecorderKind,
    pub strategy: StrategyKind,
    /// Desired allocations between samples (count strategy).
    pub sample_rate: u64,
    /// Minimum time between samples (time strategy).
    pub sample_interval: Duration,
    /// Jitter applied to rate or interval; `None` uses the rate/interval itself.
    pub jitter: Option<u64>,
    /// Delay after session start before anything is sampled.
    pub start_delay: Duration,
    pub output_path: PathBuf,
    /// Record measured sizes; when false every sample counts as 1 byte.
    pub record_size: bool,
    pub verbosity: Verbosity,
    /// Flame mode only: start a new output file after this long.
    pub rotate_interval: Option<Duration>,
    /// Flame mode only: emit only while this file exists.
    pub control_file: Option<PathBuf>,
    pub queue_capacity: usize,
    pub size_cache_capacity: usize,
    pub internal_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recorder: RecorderKind::Flame,
            strategy: StrategyKind::AllocationCount,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
            jitter: None,
            start_delay: Duration::ZERO,
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            record_size: true,
            verbosity: Verbosity::default(),
            rotate_interval: Some(DEFAULT_ROTATE_INTERVAL),
            control_file: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            size_cache_capacity: DEFAULT_SIZE_CACHE_CAPACITY,
            internal_prefix: DEFAULT_INTERNAL_PREFIX.to_string(),
        }
    }
}

impl SessionConfig {
    /// Load a properties file. An empty path means "use defaults".
    pub fn load(path: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            tracing::info!("No properties file specified, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_properties(&text)
    }

    /// Parse `key=value` / `key: value` lines; `#` and `!` start comments.
    pub fn from_properties(text: &str) -> Result<Self> {
        let props = parse_properties(text);
        let mut config = Self::default();

        for (key, value) in &props {
            match key.as_str() {
                RECORDER_PROPERTY => config.recorder = value.parse()?,
                SAMPLE_STRATEGY_PROPERTY => config.strategy = value.parse()?,
                SAMPLE_RATE_PROPERTY => config.sample_rate = parse_u64(key, value)?,
                SAMPLE_INTERVAL_PROPERTY => {
                    config.sample_interval = Duration::from_millis(parse_u64(key, value)?)
                }
                JITTER_PROPERTY => config.jitter = Some(parse_u64(key, value)?),
                DELAY_SECS_PROPERTY => {
                    config.start_delay = Duration::from_secs(parse_u64(key, value)?)
                }
                OUTPUT_PATH_PROPERTY => config.output_path = PathBuf::from(value),
                RECORD_SIZE_PROPERTY => config.record_size = parse_bool(value),
                VERBOSITY_LEVEL_PROPERTY => config.verbosity = value.parse()?,
                ROTATE_PROPERTY => config.rotate_interval = parse_rotation(key, value)?,
                CONTROL_FILE_PROPERTY => {
                    config.control_file = (!value.is_empty()).then(|| PathBuf::from(value))
                }
                QUEUE_CAPACITY_PROPERTY => {
                    config.queue_capacity = parse_u64(key, value)? as usize
                }
                SIZE_CACHE_CAPACITY_PROPERTY => {
                    config.size_cache_capacity = parse_u64(key, value)? as usize
                }
                other => tracing::debug!(key = other, "ignoring unknown property"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.strategy == StrategyKind::AllocationCount && self.sample_rate == 0 {
            return Err(Error::invalid(SAMPLE_RATE_PROPERTY, "0", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::invalid(
                QUEUE_CAPACITY_PROPERTY,
                "0",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Jitter for the active strategy. Defaults to the rate or interval itself.
    pub fn effective_jitter(&self) -> u64 {
        self.jitter.unwrap_or(match self.strategy {
            StrategyKind::AllocationCount => self.sample_rate,
            StrategyKind::Time => self.sample_interval.as_millis() as u64,
        })
    }

    #[must_use]
    pub fn with_recorder(mut self, recorder: RecorderKind) -> Self {
        self.recorder = recorder;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_sample_rate(mut self, rate: u64) -> Self {
        self.sample_rate = rate;
        self
    }

    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: u64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    #[must_use]
    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    #[must_use]
    pub fn with_record_size(mut self, record_size: bool) -> Self {
        self.record_size = record_size;
        self
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_rotate_interval(mut self, interval: Option<Duration>) -> Self {
        self.rotate_interval = interval;
        self
    }

    #[must_use]
    pub fn with_control_file(mut self, path: Option<PathBuf>) -> Self {
        self.control_file = path;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let split = line.find(['=', ':']);
        let (key, value) = match split {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (line, ""),
        };
        props.insert(key.trim().to_string(), value.trim().to_string());
    }
    props
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|e: std::num::ParseIntError| Error::invalid(key, value, e.to_string()))
}

/// Only a case-insensitive "true" is true; anything else is false.
fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

fn parse_rotation(key: &str, value: &str) -> Result<Option<Duration>> {
    if value.eq_ignore_ascii_case("off") || value.eq_ignore_ascii_case("never") {
        return Ok(None);
    }
    humantime::parse_duration(value)
        .map(Some)
        .map_err(|e| Error::invalid(key, value, e.to_string()))
}
