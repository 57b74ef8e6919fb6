use std::{
    collections::{BTreeMap, BTreeSet},
    mem,
    sync::Arc,
};

use comms::{
    DeviceLock, ServerEndpoint,
    msg::{Payload, RoundResult, Upload},
};
use log::{debug, info, warn};
use model::{Metrics, ParameterDict};

use crate::{
    Aggregator, ClientSelector, Evaluator, Result, ServerErr,
    aggregation::{RoundContext, ShapleyValues, Updates, WorkerUpdate},
};

/// Where the server is in its round cycle.
#[derive(Debug)]
pub enum ServerState {
    Initializing,
    CollectingUpdates,
    /// Holds the collected updates of the current round.
    Aggregating(BTreeMap<usize, WorkerUpdate>),
    Broadcasting,
    Terminated,
}

/// Round independent server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The amount of rounds to train.
    pub round: u64,
    pub distribute_init_parameters: bool,
    pub metric_name: String,
}

/// What a server hands back once training is over.
#[derive(Debug, Clone)]
pub struct ServerReport {
    /// The post aggregation evaluation of every round.
    pub performance: BTreeMap<u64, Metrics>,
    pub shapley_values: Option<ShapleyValues>,
    /// The last trained round.
    pub round_number: u64,
    pub parameters: Arc<ParameterDict>,
}

/// The central aggregator of a federation.
pub struct Server {
    endpoint: ServerEndpoint,
    aggregator: Box<dyn Aggregator>,
    evaluator: Box<dyn Evaluator>,
    selector: ClientSelector,
    device_lock: DeviceLock,
    config: ServerConfig,
    state: ServerState,
    round_number: u64,
    global: Arc<ParameterDict>,
    performance: BTreeMap<u64, Metrics>,
}

impl Server {
    /// Creates a new `Server`, prefer `ServerBuilder`.
    ///
    /// The initial global parameters are taken from `evaluator`.
    pub fn new(
        endpoint: ServerEndpoint,
        aggregator: Box<dyn Aggregator>,
        evaluator: Box<dyn Evaluator>,
        selector: ClientSelector,
        device_lock: DeviceLock,
        config: ServerConfig,
    ) -> Self {
        let global = Arc::new(evaluator.parameter_dict());

        Self {
            endpoint,
            aggregator,
            evaluator,
            selector,
            device_lock,
            config,
            state: ServerState::Initializing,
            round_number: 1,
            global,
            performance: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn round_number(&self) -> u64 {
        self.round_number
    }

    pub fn performance(&self) -> &BTreeMap<u64, Metrics> {
        &self.performance
    }

    /// Runs every round, then waits for the workers to close.
    ///
    /// Any failure aborts the whole topology so no worker is left waiting.
    pub async fn run(mut self) -> Result<ServerReport> {
        debug!(workers = self.endpoint.worker_num(), rounds = self.config.round; "server started");

        if let Err(e) = self.drive().await {
            warn!(round = self.round_number; "server failed: {e}");
            self.endpoint.abort();
            return Err(e);
        }

        let discarded = self.endpoint.wait_close().await.inspect_err(|_| self.endpoint.abort())?;
        debug!(discarded = discarded; "server stopped");

        Ok(ServerReport {
            shapley_values: self.aggregator.shapley_values().cloned(),
            performance: self.performance,
            round_number: self.round_number,
            parameters: self.global,
        })
    }

    async fn drive(&mut self) -> Result<()> {
        while !matches!(self.state, ServerState::Terminated) {
            self.step().await?;
        }

        Ok(())
    }

    /// Advances the state machine by one transition.
    ///
    /// A failed transition leaves the server `Terminated`.
    pub async fn step(&mut self) -> Result<()> {
        let state = mem::replace(&mut self.state, ServerState::Terminated);

        self.state = match state {
            ServerState::Initializing => self.initialize().await?,
            ServerState::CollectingUpdates => self.collect().await?,
            ServerState::Aggregating(updates) => self.aggregate(updates)?,
            ServerState::Broadcasting => self.broadcast().await?,
            ServerState::Terminated => ServerState::Terminated,
        };

        Ok(())
    }

    async fn initialize(&mut self) -> Result<ServerState> {
        if self.config.distribute_init_parameters {
            let selected = self.selector.select();
            self.send_round(&selected).await?;
        }

        Ok(ServerState::CollectingUpdates)
    }

    /// Takes exactly one message of the current round from every worker.
    async fn collect(&mut self) -> Result<ServerState> {
        let mut updates = BTreeMap::new();

        for worker_id in 0..self.endpoint.worker_num() {
            let upload = self.endpoint.get(worker_id).await?;

            let got = upload.round_number();
            if got != self.round_number {
                return Err(ServerErr::RoundMismatch {
                    worker_id,
                    expected: self.round_number,
                    got,
                });
            }

            let Upload::Update(msg) = upload else {
                debug!(worker_id = worker_id, round = self.round_number; "worker skipped");
                continue;
            };

            let parameter = match msg.payload {
                Payload::Parameter(parameter) => parameter,
                Payload::ParameterDiff(diff) => self.global.apply(&diff)?,
            };

            updates.insert(
                worker_id,
                WorkerUpdate {
                    parameter,
                    dataset_size: msg.dataset_size,
                },
            );
        }

        Ok(ServerState::Aggregating(updates))
    }

    fn aggregate(&mut self, updates: BTreeMap<usize, WorkerUpdate>) -> Result<ServerState> {
        let round = self.round_number;
        let skipped = self.endpoint.worker_num() - updates.len();
        let updates: Updates = updates.iter().map(|(id, update)| (*id, update)).collect();

        let _device = self.device_lock.lock();

        let mut ctx = RoundContext {
            round_number: round,
            previous: &self.global,
            evaluator: self.evaluator.as_mut(),
            metric_name: &self.config.metric_name,
        };

        let aggregated = self.aggregator.aggregate(&mut ctx, &updates)?;
        let metrics = self
            .evaluator
            .evaluate(&aggregated)
            .map_err(ServerErr::Evaluator)?;

        info!(round = round, updates = updates.len(), skipped = skipped; "aggregated round: {metrics:?}");

        self.performance.insert(round, metrics);
        self.global = Arc::new(aggregated);

        Ok(ServerState::Broadcasting)
    }

    async fn broadcast(&mut self) -> Result<ServerState> {
        if self.round_number >= self.config.round {
            debug!(round = self.round_number; "round budget exhausted");
            self.endpoint.broadcast(RoundResult::EndTraining, None).await?;
            return Ok(ServerState::Terminated);
        }

        self.round_number += 1;
        let selected = self.selector.select();
        self.send_round(&selected).await?;

        Ok(ServerState::CollectingUpdates)
    }

    /// Sends the global parameters of the current round to `selected` and a
    /// skip to everyone else.
    async fn send_round(&self, selected: &BTreeSet<usize>) -> Result<()> {
        let result = RoundResult::Parameter {
            parameter: Arc::clone(&self.global),
            round_number: self.round_number,
        };

        self.endpoint.broadcast(result, Some(selected)).await?;

        let skipped: BTreeSet<usize> = (0..self.endpoint.worker_num())
            .filter(|id| !selected.contains(id))
            .collect();

        if !skipped.is_empty() {
            self.endpoint.broadcast(RoundResult::Skip, Some(&skipped)).await?;
        }

        Ok(())
    }
}
