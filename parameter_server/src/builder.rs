use comms::{DeviceLock, ServerEndpoint};

use crate::{Aggregator, ClientSelector, Evaluator, FedAvg, Server, ServerConfig};

/// Assembles a `Server`, plain FedAvg over every worker unless told otherwise.
pub struct ServerBuilder {
    endpoint: ServerEndpoint,
    evaluator: Box<dyn Evaluator>,
    aggregator: Box<dyn Aggregator>,
    selector: Option<ClientSelector>,
    device_lock: Option<DeviceLock>,
    config: ServerConfig,
}

impl ServerBuilder {
    /// Creates a new `ServerBuilder`.
    ///
    /// # Arguments
    /// * `endpoint` - The server's view of the topology.
    /// * `evaluator` - Scores every aggregate and provides the initial parameters.
    /// * `round` - The amount of rounds to train.
    pub fn new(endpoint: ServerEndpoint, evaluator: Box<dyn Evaluator>, round: u64) -> Self {
        Self {
            endpoint,
            evaluator,
            aggregator: Box::new(FedAvg),
            selector: None,
            device_lock: None,
            config: ServerConfig {
                round,
                distribute_init_parameters: false,
                metric_name: "accuracy".into(),
            },
        }
    }

    pub fn aggregator(mut self, aggregator: Box<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn selector(mut self, selector: ClientSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn device_lock(mut self, device_lock: DeviceLock) -> Self {
        self.device_lock = Some(device_lock);
        self
    }

    pub fn distribute_init_parameters(mut self, enabled: bool) -> Self {
        self.config.distribute_init_parameters = enabled;
        self
    }

    pub fn metric_name(mut self, name: impl Into<String>) -> Self {
        self.config.metric_name = name.into();
        self
    }

    pub fn build(self) -> Server {
        let worker_num = self.endpoint.worker_num();

        Server::new(
            self.endpoint,
            self.aggregator,
            self.evaluator,
            self.selector.unwrap_or_else(|| ClientSelector::all(worker_num)),
            self.device_lock.unwrap_or_else(comms::device_lock),
            self.config,
        )
    }
}
