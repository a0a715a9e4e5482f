use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use threadwatch_types::{MaxStackDepth, ProbeDescriptor, ProbeId, TriggerLocation};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateProbe {
        id: String,
    },
    DuplicateTrigger {
        trigger_location: String,
        existing: String,
    },
    UnknownProbe {
        id: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateProbe { id } => write!(f, "probe {id:?} is already registered"),
            Self::DuplicateTrigger {
                trigger_location,
                existing,
            } => write!(
                f,
                "trigger location {trigger_location:?} is already bound to probe {existing:?}"
            ),
            Self::UnknownProbe { id } => write!(f, "no probe registered with id {id:?}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// A probe as held by the registry. Only the enabled flag changes after
/// registration.
#[derive(Debug)]
pub struct RegisteredProbe {
    id: ProbeId,
    trigger_location: TriggerLocation,
    max_stack_depth: MaxStackDepth,
    enabled: AtomicBool,
}

impl RegisteredProbe {
    fn new(descriptor: ProbeDescriptor) -> Self {
        Self {
            id: descriptor.id,
            trigger_location: descriptor.trigger_location,
            max_stack_depth: descriptor.max_stack_depth,
            enabled: AtomicBool::new(descriptor.enabled),
        }
    }

    pub fn id(&self) -> &ProbeId {
        &self.id
    }

    pub fn trigger_location(&self) -> &TriggerLocation {
        &self.trigger_location
    }

    pub fn max_stack_depth(&self) -> MaxStackDepth {
        self.max_stack_depth
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn descriptor(&self) -> ProbeDescriptor {
        ProbeDescriptor {
            id: self.id.clone(),
            trigger_location: self.trigger_location.clone(),
            enabled: self.is_enabled(),
            max_stack_depth: self.max_stack_depth,
        }
    }
}

#[derive(Default)]
struct Tables {
    by_trigger: HashMap<String, Arc<RegisteredProbe>>,
    by_id: HashMap<String, Arc<RegisteredProbe>>,
    order: Vec<Arc<RegisteredProbe>>,
}

/// Process-lifetime set of probes, keyed by id and by trigger location.
///
/// Lookups take a shared lock for the duration of one hash probe and never
/// allocate. Registration takes the exclusive lock. Toggling only flips the
/// probe's atomic flag, so readers are never blocked by it.
#[derive(Default)]
pub struct ProbeRegistry {
    tables: RwLock<Tables>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a probe. Fails without touching the registry if the id or the
    /// trigger location is already taken.
    pub fn register(
        &self,
        descriptor: ProbeDescriptor,
    ) -> Result<Arc<RegisteredProbe>, RegistryError> {
        let mut tables = self.tables.write();
        if tables.by_id.contains_key(descriptor.id.as_str()) {
            return Err(RegistryError::DuplicateProbe {
                id: descriptor.id.as_str().to_owned(),
            });
        }
        if let Some(existing) = tables.by_trigger.get(descriptor.trigger_location.as_str()) {
            return Err(RegistryError::DuplicateTrigger {
                trigger_location: descriptor.trigger_location.as_str().to_owned(),
                existing: existing.id.as_str().to_owned(),
            });
        }

        let probe = Arc::new(RegisteredProbe::new(descriptor));
        tables
            .by_id
            .insert(probe.id.as_str().to_owned(), Arc::clone(&probe));
        tables.by_trigger.insert(
            probe.trigger_location.as_str().to_owned(),
            Arc::clone(&probe),
        );
        tables.order.push(Arc::clone(&probe));
        drop(tables);

        info!(
            probe = %probe.id,
            trigger = %probe.trigger_location,
            enabled = probe.is_enabled(),
            max_stack_depth = %probe.max_stack_depth,
            "registered probe"
        );
        Ok(probe)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        let tables = self.tables.read();
        let Some(probe) = tables.by_id.get(id) else {
            return Err(RegistryError::UnknownProbe { id: id.to_owned() });
        };
        let previous = probe.enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(probe = %probe.id, enabled, "toggled probe");
        }
        Ok(())
    }

    /// The enabled probe bound to `trigger_location`, if any.
    #[inline]
    pub fn lookup(&self, trigger_location: &str) -> Option<Arc<RegisteredProbe>> {
        self.tables
            .read()
            .by_trigger
            .get(trigger_location)
            .filter(|probe| probe.is_enabled())
            .cloned()
    }

    /// The probe registered under `id`, enabled or not.
    pub fn probe(&self, id: &str) -> Option<Arc<RegisteredProbe>> {
        self.tables.read().by_id.get(id).cloned()
    }

    /// Snapshot of every descriptor, in registration order.
    pub fn descriptors(&self) -> Vec<ProbeDescriptor> {
        self.tables
            .read()
            .order
            .iter()
            .map(|probe| probe.descriptor())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
