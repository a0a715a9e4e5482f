//! A toy worker pool whose thread creation goes through the observed factory.

use std::sync::Arc;
use threadwatch::Dispatcher;
use threadwatch::preset::{HEALTHCHECK_RUN, POOL_ADD_WORKER};
use threadwatch::thread::{ObservedThreadFactory, ThreadFactory};
use tracing::debug;

struct WorkerPool<F> {
    name: &'static str,
    factory: F,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl<F: ThreadFactory> WorkerPool<F> {
    fn new(name: &'static str, factory: F) -> Self {
        Self {
            name,
            factory,
            workers: Vec::new(),
        }
    }

    fn add_worker(&mut self, first_task: fn()) -> Result<(), String> {
        threadwatch::fire_with(POOL_ADD_WORKER, || {
            format!("{}.addWorker() called", self.name)
        });
        let thread_name = format!("{}-thread-{}", self.name, self.workers.len() + 1);
        let handle = self
            .factory
            .new_thread(&thread_name, Box::new(first_task))
            .map_err(|e| format!("failed to spawn {thread_name}: {e}"))?;
        self.workers.push(handle);
        Ok(())
    }

    fn shutdown(self) -> Result<(), String> {
        for handle in self.workers {
            handle
                .join()
                .map_err(|_| format!("a {} worker panicked", self.name))?;
        }
        Ok(())
    }
}

fn healthcheck_run() {
    threadwatch::fire(HEALTHCHECK_RUN, "HealthcheckController.run() called");
    debug!("healthcheck ok");
}

pub fn run(dispatcher: &Arc<Dispatcher>, workers: u32) -> Result<(), String> {
    let mut pool = WorkerPool::new("pool-1", ObservedThreadFactory::new(dispatcher.clone()));
    for _ in 0..workers {
        pool.add_worker(healthcheck_run)?;
    }
    pool.shutdown()
}
