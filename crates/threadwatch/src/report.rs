//! Rendering events for a sink.
//!
//! Text blocks have a fixed shape that downstream tooling can rely on:
//!
//! ```text
//! >>> pool.addWorker: called [thread=worker-1] [ts=1718000000000000000] [frames=2]
//!     at app::pool::Pool::add_worker (src/pool.rs:41)
//!     at app::main (src/main.rs:12)
//! -------------------------------------
//! ```
//!
//! The `[thread=...]` field is omitted for unnamed threads and ` [truncated]`
//! is appended to the header when the call chain was cut at the probe's
//! depth. JSON-lines output is one object per event and has no separator.

use crate::sink::{Sink, SinkWriteError};
use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::sync::Arc;
use threadwatch_types::Event;

pub const SEPARATOR: &str = "-------------------------------------";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportFormat {
    #[default]
    Text,
    JsonLines,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" | "jsonl" => Ok(Self::JsonLines),
            other => Err(format!("unknown report format {other:?}, expected text or json")),
        }
    }
}

#[derive(Debug)]
pub enum ReportError {
    Sink(SinkWriteError),
    Encode(String),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sink(err) => write!(f, "{err}"),
            Self::Encode(err) => write!(f, "failed to encode event: {err}"),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sink(err) => Some(err),
            Self::Encode(_) => None,
        }
    }
}

impl From<SinkWriteError> for ReportError {
    fn from(value: SinkWriteError) -> Self {
        Self::Sink(value)
    }
}

/// Renders events and hands each one to its sink as a single block.
#[derive(Clone)]
pub struct Reporter {
    format: ReportFormat,
    sink: Arc<dyn Sink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            format: ReportFormat::Text,
            sink,
        }
    }

    pub fn with_format(mut self, format: ReportFormat) -> Self {
        self.format = format;
        self
    }

    pub fn format(&self) -> ReportFormat {
        self.format
    }

    pub fn report(&self, event: &Event) -> Result<(), ReportError> {
        let block = match self.format {
            ReportFormat::Text => render_text(event),
            ReportFormat::JsonLines => render_json_line(event)?,
        };
        self.sink.write_block(&block)?;
        Ok(())
    }
}

pub fn render_text(event: &Event) -> String {
    let mut out = String::with_capacity(128 + event.frames.len() * 96);
    let _ = write!(
        out,
        ">>> {}: {}",
        event.probe_id,
        single_line(&event.message)
    );
    if let Some(thread_name) = &event.thread_name {
        let _ = write!(out, " [thread={}]", single_line(thread_name));
    }
    let _ = write!(
        out,
        " [ts={}] [frames={}]",
        event.timestamp_nanos,
        event.frames.len()
    );
    if event.truncated {
        out.push_str(" [truncated]");
    }
    out.push('\n');

    for frame in &event.frames {
        let _ = write!(out, "    at {}", single_line(&frame.qualified_name));
        if let Some(location) = &frame.source_location {
            let _ = write!(out, " ({})", single_line(location));
        }
        out.push('\n');
    }

    out.push_str(SEPARATOR);
    out.push('\n');
    out
}

pub fn render_json_line(event: &Event) -> Result<String, ReportError> {
    let mut line = facet_json::to_string(event).map_err(|e| ReportError::Encode(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

fn single_line(text: &str) -> std::borrow::Cow<'_, str> {
    if text.contains(['\n', '\r']) {
        text.replace('\r', "\\r").replace('\n', "\\n").into()
    } else {
        text.into()
    }
}
