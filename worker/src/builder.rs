use comms::{ClientEndpoint, DeviceLock};
use model::ModelCache;

use crate::{Sparsifier, Trainer, Worker};

/// Assembles a `Worker` from its endpoint, its trainer and optional parts.
pub struct WorkerBuilder {
    endpoint: ClientEndpoint,
    trainer: Box<dyn Trainer>,
    sparsifier: Option<Box<dyn Sparsifier>>,
    cache: ModelCache,
    device_lock: Option<DeviceLock>,
    distribute_init_parameters: bool,
}

impl WorkerBuilder {
    pub fn new(endpoint: ClientEndpoint, trainer: Box<dyn Trainer>) -> Self {
        Self {
            endpoint,
            trainer,
            sparsifier: None,
            cache: ModelCache::default(),
            device_lock: None,
            distribute_init_parameters: false,
        }
    }

    pub fn sparsifier(mut self, sparsifier: Box<dyn Sparsifier>) -> Self {
        self.sparsifier = Some(sparsifier);
        self
    }

    pub fn cache(mut self, cache: ModelCache) -> Self {
        self.cache = cache;
        self
    }

    /// Shares a device lock with other roles, a private one is used otherwise.
    pub fn device_lock(mut self, device_lock: DeviceLock) -> Self {
        self.device_lock = Some(device_lock);
        self
    }

    pub fn distribute_init_parameters(mut self, enabled: bool) -> Self {
        self.distribute_init_parameters = enabled;
        self
    }

    pub fn build(self) -> Worker {
        Worker::new(
            self.endpoint,
            self.trainer,
            self.sparsifier,
            self.cache,
            self.device_lock.unwrap_or_else(comms::device_lock),
            self.distribute_init_parameters,
        )
    }
}
