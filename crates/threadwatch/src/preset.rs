//! Built-in probe set for tracking down unexpected thread creation.

use threadwatch_types::ProbeDescriptor;

pub const FACTORY_NEW_THREAD: &str = "Executors$DefaultThreadFactory.newThread";
pub const HEALTHCHECK_RUN: &str = "HealthcheckController.run";
pub const POOL_ADD_WORKER: &str = "ThreadPoolExecutor.addWorker";
pub const THREAD_INIT: &str = "Thread.<init>";
pub const THREAD_START: &str = "Thread.start";

/// Pool worker creation, the default thread factory and the healthcheck
/// entry point are live. Thread construction and start are registered but
/// disabled: they fire for every thread in the process and are turned on
/// only when the narrower probes are not enough.
pub fn thread_creation_preset() -> Vec<ProbeDescriptor> {
    [
        ("factory.newThread", FACTORY_NEW_THREAD, true),
        ("healthcheck.run", HEALTHCHECK_RUN, true),
        ("pool.addWorker", POOL_ADD_WORKER, true),
        ("thread.init", THREAD_INIT, false),
        ("thread.start", THREAD_START, false),
    ]
    .into_iter()
    .filter_map(|(id, trigger, enabled)| {
        ProbeDescriptor::new(id, trigger)
            .ok()
            .map(|descriptor| descriptor.with_enabled(enabled))
    })
    .collect()
}
