//! Value types shared by the threadwatch capturer, runtime and CLI.
//!
//! Everything here derives [`Facet`] so events and descriptors can be written
//! as JSON lines by the reporter and read back from probe configuration.

use facet::Facet;
use std::error::Error;
use std::fmt;

/// Stack depth used when a probe does not configure one.
pub const DEFAULT_MAX_STACK_DEPTH: u32 = 15;

/// Upper bound on frames captured for an [`MaxStackDepth::Unbounded`] probe.
pub const HARD_FRAME_CEILING: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    EmptyField(&'static str),
    FramesExceedDepth { frames: usize, max: usize },
    ConflictingFields {
        first: &'static str,
        second: &'static str,
    },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
            Self::FramesExceedDepth { frames, max } => {
                write!(f, "event carries {frames} frames, probe allows at most {max}")
            }
            Self::ConflictingFields { first, second } => {
                write!(f, "{first} and {second} cannot both be set")
            }
        }
    }
}

impl Error for InvariantError {}

/// Unique name of a probe, e.g. `pool.addWorker`.
#[derive(Facet, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct ProbeId(String);

impl ProbeId {
    pub fn new(value: impl Into<String>) -> Result<Self, InvariantError> {
        let value = value.into();
        if value.is_empty() {
            return Err(InvariantError::EmptyField("probe_id"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Symbolic name of the code point that activates a probe, in whatever
/// addressing scheme the host uses (`ThreadPoolExecutor.addWorker`,
/// `std::thread::Builder::spawn`, ...).
#[derive(Facet, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct TriggerLocation(String);

impl TriggerLocation {
    pub fn new(value: impl Into<String>) -> Result<Self, InvariantError> {
        let value = value.into();
        if value.is_empty() {
            return Err(InvariantError::EmptyField("trigger_location"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TriggerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum MaxStackDepth {
    Bounded(u32),
    Unbounded,
}

impl MaxStackDepth {
    /// Number of frames an event for this probe may carry.
    pub fn frame_limit(self) -> usize {
        match self {
            Self::Bounded(depth) => (depth as usize).min(HARD_FRAME_CEILING),
            Self::Unbounded => HARD_FRAME_CEILING,
        }
    }
}

impl Default for MaxStackDepth {
    fn default() -> Self {
        Self::Bounded(DEFAULT_MAX_STACK_DEPTH)
    }
}

impl fmt::Display for MaxStackDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(depth) => write!(f, "{depth}"),
            Self::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// Configuration-time description of a probe. Everything except `enabled`
/// is fixed once the probe is registered.
#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct ProbeDescriptor {
    pub id: ProbeId,
    pub trigger_location: TriggerLocation,
    pub enabled: bool,
    pub max_stack_depth: MaxStackDepth,
}

impl ProbeDescriptor {
    pub fn new(
        id: impl Into<String>,
        trigger_location: impl Into<String>,
    ) -> Result<Self, InvariantError> {
        Ok(Self {
            id: ProbeId::new(id)?,
            trigger_location: TriggerLocation::new(trigger_location)?,
            enabled: true,
            max_stack_depth: MaxStackDepth::default(),
        })
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_stack_depth(mut self, max_stack_depth: MaxStackDepth) -> Self {
        self.max_stack_depth = max_stack_depth;
        self
    }
}

/// One frame of a captured call chain.
#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    pub qualified_name: String,
    #[facet(skip_unless_truthy)]
    pub source_location: Option<String>,
}

impl StackFrame {
    pub fn new(qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            source_location: None,
        }
    }

    pub fn with_source_location(mut self, location: impl Into<String>) -> Self {
        self.source_location = Some(location.into());
        self
    }
}

/// One observed firing of an enabled probe.
///
/// `frames` is ordered innermost first: `frames[0]` is the code that reached
/// the trigger point, the last entry is the outermost caller that was kept.
#[derive(Facet, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub probe_id: ProbeId,
    /// Wall-clock nanoseconds since the UNIX epoch.
    pub timestamp_nanos: u64,
    pub message: String,
    #[facet(skip_unless_truthy)]
    pub thread_name: Option<String>,
    pub frames: Vec<StackFrame>,
    pub truncated: bool,
}

impl Event {
    /// Builds an event, rejecting frame lists longer than `max_stack_depth`.
    pub fn new(
        probe_id: ProbeId,
        timestamp_nanos: u64,
        message: impl Into<String>,
        frames: Vec<StackFrame>,
        truncated: bool,
        max_stack_depth: MaxStackDepth,
    ) -> Result<Self, InvariantError> {
        let max = max_stack_depth.frame_limit();
        if frames.len() > max {
            return Err(InvariantError::FramesExceedDepth {
                frames: frames.len(),
                max,
            });
        }
        Ok(Self {
            probe_id,
            timestamp_nanos,
            message: message.into(),
            thread_name: None,
            frames,
            truncated,
        })
    }

    pub fn with_thread_name(mut self, thread_name: Option<String>) -> Self {
        self.thread_name = thread_name;
        self
    }
}
