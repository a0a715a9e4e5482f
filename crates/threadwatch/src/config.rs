//! Probe configuration, loaded once at startup.
//!
//! ```json
//! {
//!   "sink": "stdout",
//!   "format": "text",
//!   "write_timeout_ms": 100,
//!   "probes": [
//!     { "id": "pool.addWorker", "trigger_location": "ThreadPoolExecutor.addWorker",
//!       "max_stack_depth": 15, "enabled": true }
//!   ]
//! }
//! ```
//!
//! Per probe, `max_stack_depth` defaults to 15 and `enabled` defaults to
//! true. `unbounded_stack: true` removes the cap and cannot be combined with
//! `max_stack_depth`.

use crate::dispatch::Dispatcher;
use crate::preset::thread_creation_preset;
use crate::registry::{ProbeRegistry, RegistryError};
use crate::report::{ReportFormat, Reporter};
use crate::sink::{DEFAULT_WRITE_TIMEOUT, SinkSpec};
use facet::Facet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use threadwatch_types::{InvariantError, MaxStackDepth, ProbeDescriptor};
use tracing::warn;

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(String),
    InvalidProbe {
        index: usize,
        source: InvariantError,
    },
    InvalidSink(String),
    InvalidFormat(String),
    Registry(RegistryError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
            Self::InvalidProbe { index, source } => {
                write!(f, "probe #{index} is invalid: {source}")
            }
            Self::InvalidSink(err) => write!(f, "{err}"),
            Self::InvalidFormat(err) => write!(f, "{err}"),
            Self::Registry(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::InvalidProbe { source, .. } => Some(source),
            Self::Registry(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RegistryError> for ConfigError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub id: String,
    pub trigger_location: String,
    #[facet(default)]
    pub max_stack_depth: Option<u32>,
    #[facet(default)]
    pub unbounded_stack: bool,
    #[facet(default)]
    pub enabled: Option<bool>,
}

impl ProbeConfig {
    pub fn to_descriptor(&self) -> Result<ProbeDescriptor, InvariantError> {
        if self.unbounded_stack && self.max_stack_depth.is_some() {
            return Err(InvariantError::ConflictingFields {
                first: "max_stack_depth",
                second: "unbounded_stack",
            });
        }
        let depth = if self.unbounded_stack {
            MaxStackDepth::Unbounded
        } else {
            self.max_stack_depth
                .map(MaxStackDepth::Bounded)
                .unwrap_or_default()
        };
        Ok(ProbeDescriptor::new(&self.id, &self.trigger_location)?
            .with_enabled(self.enabled.unwrap_or(true))
            .with_max_stack_depth(depth))
    }
}

impl From<&ProbeDescriptor> for ProbeConfig {
    fn from(descriptor: &ProbeDescriptor) -> Self {
        let (max_stack_depth, unbounded_stack) = match descriptor.max_stack_depth {
            MaxStackDepth::Bounded(depth) => (Some(depth), false),
            MaxStackDepth::Unbounded => (None, true),
        };
        Self {
            id: descriptor.id.as_str().to_owned(),
            trigger_location: descriptor.trigger_location.as_str().to_owned(),
            max_stack_depth,
            unbounded_stack,
            enabled: Some(descriptor.enabled),
        }
    }
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ObserverConfig {
    #[facet(default)]
    pub sink: Option<String>,
    #[facet(default)]
    pub format: Option<String>,
    #[facet(default)]
    pub write_timeout_ms: Option<u64>,
    pub probes: Vec<ProbeConfig>,
}

impl ObserverConfig {
    /// The built-in thread-creation probes, reported as text on stdout.
    pub fn preset() -> Self {
        Self {
            sink: None,
            format: None,
            write_timeout_ms: None,
            probes: thread_creation_preset().iter().map(ProbeConfig::from).collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        facet_json::from_slice(json.as_bytes()).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn sink_spec(&self) -> Result<SinkSpec, ConfigError> {
        self.sink
            .as_deref()
            .unwrap_or("stdout")
            .parse()
            .map_err(|e: crate::sink::SinkSpecError| ConfigError::InvalidSink(e.to_string()))
    }

    pub fn report_format(&self) -> Result<ReportFormat, ConfigError> {
        self.format
            .as_deref()
            .unwrap_or("text")
            .parse()
            .map_err(ConfigError::InvalidFormat)
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WRITE_TIMEOUT)
    }

    pub fn descriptors(&self) -> Result<Vec<ProbeDescriptor>, ConfigError> {
        self.probes
            .iter()
            .enumerate()
            .map(|(index, probe)| {
                probe
                    .to_descriptor()
                    .map_err(|source| ConfigError::InvalidProbe { index, source })
            })
            .collect()
    }

    /// Registers every probe. A duplicate id or trigger aborts loading.
    pub fn build_registry(&self) -> Result<ProbeRegistry, ConfigError> {
        let registry = ProbeRegistry::new();
        for descriptor in self.descriptors()? {
            registry.register(descriptor)?;
        }
        if !registry.is_empty() && registry.descriptors().iter().all(|d| !d.enabled) {
            warn!("no probe is enabled; nothing will be reported until one is toggled on");
        }
        Ok(registry)
    }

    /// Registry, sink and reporter wired into a dispatcher.
    pub fn build_dispatcher(&self) -> Result<Dispatcher, ConfigError> {
        let registry = Arc::new(self.build_registry()?);
        let sink = self
            .sink_spec()?
            .open(self.write_timeout())
            .map_err(|e| ConfigError::InvalidSink(format!("failed to open sink: {e}")))?;
        let reporter = Reporter::new(sink).with_format(self.report_format()?);
        Ok(Dispatcher::new(registry, reporter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_omitted_fields() {
        let config = ObserverConfig::from_json(
            r#"{"probes":[{"id":"pool.addWorker","trigger_location":"ThreadPoolExecutor.addWorker"}]}"#,
        )
        .unwrap();
        let descriptors = config.descriptors().unwrap();
        assert_eq!(descriptors.len(), 1);
        assert!(descriptors[0].enabled);
        assert_eq!(descriptors[0].max_stack_depth, MaxStackDepth::Bounded(15));
        assert_eq!(config.sink_spec().unwrap(), SinkSpec::Stdout);
        assert_eq!(config.report_format().unwrap(), ReportFormat::Text);
        assert_eq!(config.write_timeout(), DEFAULT_WRITE_TIMEOUT);
    }

    #[test]
    fn explicit_fields_are_honored() {
        let config = ObserverConfig::from_json(
            r#"{
                "sink": "ring:16",
                "format": "json",
                "write_timeout_ms": 5,
                "probes": [
                    {"id":"thread.start","trigger_location":"Thread.start","enabled":false,"max_stack_depth":3},
                    {"id":"thread.init","trigger_location":"Thread.<init>","unbounded_stack":true}
                ]
            }"#,
        )
        .unwrap();
        let descriptors = config.descriptors().unwrap();
        assert!(!descriptors[0].enabled);
        assert_eq!(descriptors[0].max_stack_depth, MaxStackDepth::Bounded(3));
        assert_eq!(descriptors[1].max_stack_depth, MaxStackDepth::Unbounded);
        assert_eq!(config.sink_spec().unwrap(), SinkSpec::Ring(16));
        assert_eq!(config.report_format().unwrap(), ReportFormat::JsonLines);
        assert_eq!(config.write_timeout(), Duration::from_millis(5));
    }

    #[test]
    fn duplicate_id_is_fatal_to_loading() {
        let config = ObserverConfig::from_json(
            r#"{"probes":[
                {"id":"p","trigger_location":"A.run"},
                {"id":"p","trigger_location":"B.run"}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            config.build_registry(),
            Err(ConfigError::Registry(RegistryError::DuplicateProbe { .. }))
        ));
    }

    #[test]
    fn empty_id_is_reported_with_its_index() {
        let config = ObserverConfig::from_json(
            r#"{"probes":[{"id":"ok","trigger_location":"A.run"},{"id":"","trigger_location":"B.run"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            config.descriptors(),
            Err(ConfigError::InvalidProbe { index: 1, .. })
        ));
    }

    #[test]
    fn depth_and_unbounded_together_are_rejected() {
        let config = ObserverConfig::from_json(
            r#"{"probes":[
                {"id":"thread.init","trigger_location":"Thread.<init>",
                 "max_stack_depth":20,"unbounded_stack":true}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            config.descriptors(),
            Err(ConfigError::InvalidProbe {
                index: 0,
                source: InvariantError::ConflictingFields { .. }
            })
        ));
        assert!(config.build_dispatcher().is_err());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            ObserverConfig::from_json("{\"probes\": ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn preset_survives_conversion_to_config() {
        let config = ObserverConfig::preset();
        assert_eq!(config.descriptors().unwrap(), thread_creation_preset());
    }

    #[test]
    fn unknown_sink_is_rejected() {
        let config = ObserverConfig {
            sink: Some("syslog".into()),
            ..ObserverConfig::preset()
        };
        assert!(matches!(
            config.build_dispatcher(),
            Err(ConfigError::InvalidSink(_))
        ));
    }
}
