use std::{mem, sync::Arc, time::Instant};

use comms::{
    ClientEndpoint, DeviceLock,
    msg::{Payload, RoundMessage, RoundResult, Upload},
};
use log::{debug, info, warn};
use model::{ModelCache, ModelErr, ParameterDict};

use crate::{Result, Sparsifier, Trainer, WorkerErr, WorkerMetrics};

/// Where a worker is in its round cycle.
#[derive(Debug)]
pub enum WorkerState {
    AwaitingInitialParameters,
    Training,
    /// Holds the freshly trained parameters until they are sent.
    Sending(ParameterDict),
    AwaitingAggregate,
    Stopped,
}

/// One federated participant.
///
/// Drives its local trainer through train, send and await cycles until the
/// server ends the training.
pub struct Worker {
    endpoint: ClientEndpoint,
    trainer: Box<dyn Trainer>,
    sparsifier: Option<Box<dyn Sparsifier>>,
    cache: ModelCache,
    device_lock: DeviceLock,
    state: WorkerState,
    round_number: u64,
    metrics: WorkerMetrics,
}

impl Worker {
    /// Creates a new `Worker`, prefer `WorkerBuilder`.
    ///
    /// # Arguments
    /// * `endpoint` - This worker's view of the topology.
    /// * `trainer` - The local training capability.
    /// * `sparsifier` - Applied to every diff before it is sent.
    /// * `cache` - Holds the global parameters of each round.
    /// * `device_lock` - Held while training.
    /// * `distribute_init_parameters` - Whether to wait for the server's
    ///   initial parameters before training.
    pub fn new(
        endpoint: ClientEndpoint,
        trainer: Box<dyn Trainer>,
        sparsifier: Option<Box<dyn Sparsifier>>,
        cache: ModelCache,
        device_lock: DeviceLock,
        distribute_init_parameters: bool,
    ) -> Self {
        let state = if distribute_init_parameters {
            WorkerState::AwaitingInitialParameters
        } else {
            WorkerState::Training
        };

        Self {
            endpoint,
            trainer,
            sparsifier,
            cache,
            device_lock,
            state,
            round_number: 1,
            metrics: WorkerMetrics::default(),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.endpoint.worker_id()
    }

    /// The round this worker will train or skip next.
    pub fn round_number(&self) -> u64 {
        self.round_number
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn trainer(&self) -> &dyn Trainer {
        self.trainer.as_ref()
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Runs the worker until the server ends the training.
    ///
    /// On failure the worker closes its own channels so the server notices,
    /// the rest of the topology is left alone.
    ///
    /// # Returns
    /// The worker's counters on graceful completion.
    pub async fn run(mut self) -> Result<WorkerMetrics> {
        let worker_id = self.worker_id();
        debug!(worker_id = worker_id; "worker started");

        if let Err(e) = self.drive().await {
            warn!(worker_id = worker_id, round = self.round_number; "worker failed: {e}");

            if let Err(close_err) = self.endpoint.close() {
                debug!(worker_id = worker_id; "close after failure: {close_err}");
            }

            return Err(e);
        }

        self.endpoint.close()?;
        self.cache.clear()?;

        info!(
            worker_id = worker_id,
            rounds_trained = self.metrics.rounds_trained,
            rounds_skipped = self.metrics.rounds_skipped,
            bandwidth_ratio = self.metrics.bandwidth_ratio();
            "worker stopped"
        );

        Ok(self.metrics)
    }

    async fn drive(&mut self) -> Result<()> {
        while !matches!(self.state, WorkerState::Stopped) {
            self.step().await?;
        }

        Ok(())
    }

    /// Advances the state machine by one transition.
    ///
    /// A failed transition leaves the worker `Stopped`.
    pub async fn step(&mut self) -> Result<()> {
        let state = mem::replace(&mut self.state, WorkerState::Stopped);

        self.state = match state {
            WorkerState::AwaitingInitialParameters | WorkerState::AwaitingAggregate => {
                self.await_parameters().await?
            }
            WorkerState::Training => self.train()?,
            WorkerState::Sending(trained) => self.send_update(trained).await?,
            WorkerState::Stopped => WorkerState::Stopped,
        };

        Ok(())
    }

    /// Waits for the parameters of the current round, skipping every round
    /// this worker takes no part in.
    async fn await_parameters(&mut self) -> Result<WorkerState> {
        loop {
            let start = Instant::now();
            let result = self.endpoint.get().await?;
            self.metrics.recv_time += start.elapsed();

            match result {
                RoundResult::EndTraining => {
                    debug!(worker_id = self.worker_id(), round = self.round_number; "received end of training");
                    return Ok(WorkerState::Stopped);
                }
                RoundResult::Parameter {
                    parameter,
                    round_number,
                } if round_number == self.round_number => {
                    let parameter = Arc::unwrap_or_clone(parameter);
                    self.trainer.set_parameter_dict(parameter.clone());
                    self.cache.insert(round_number, parameter)?;

                    // Diffs are only ever taken against the latest baseline.
                    let discarded = self.cache.discard_before(round_number)?;
                    if discarded > 0 {
                        debug!(worker_id = self.worker_id(), round = round_number, discarded = discarded; "dropped old baselines");
                    }

                    return Ok(WorkerState::Training);
                }
                other => {
                    self.skip(other).await?;
                }
            }
        }
    }

    async fn skip(&mut self, result: RoundResult) -> Result<()> {
        warn!(
            worker_id = self.worker_id(),
            round = self.round_number,
            received = result.kind();
            "skip round"
        );

        self.timed_send(Upload::Skip {
            round_number: self.round_number,
        })
        .await?;

        self.metrics.bump_skipped();
        self.round_number += 1;
        Ok(())
    }

    fn train(&mut self) -> Result<WorkerState> {
        let start = Instant::now();

        let (trained, metrics) = {
            let _device = self.device_lock.lock();
            self.trainer.train_one_round().map_err(WorkerErr::Trainer)?
        };

        self.metrics.compute_time += start.elapsed();
        self.metrics.bump_trained();

        debug!(worker_id = self.worker_id(), round = self.round_number; "trained round: {metrics:?}");
        self.metrics.last_train_metrics = metrics;

        Ok(WorkerState::Sending(trained))
    }

    async fn send_update(&mut self, trained: ParameterDict) -> Result<WorkerState> {
        let total = trained.numel();

        let payload = match self.cache.diff(self.round_number, &trained) {
            Ok(mut diff) => {
                if let Some(sparsifier) = self.sparsifier.as_mut() {
                    sparsifier.sparsify(self.round_number, &mut diff);
                }
                Payload::ParameterDiff(diff)
            }
            Err(ModelErr::MissingRound { .. }) => Payload::Parameter(trained),
            Err(e) => return Err(e.into()),
        };

        let sent = payload.parameters().count_nonzero();
        self.metrics.add_bandwidth(sent, total);
        debug!(
            worker_id = self.worker_id(),
            round = self.round_number,
            sent_elements = sent,
            total_elements = total;
            "bandwidth"
        );

        self.timed_send(Upload::Update(RoundMessage {
            payload,
            dataset_size: self.trainer.dataset_size(),
            round_number: self.round_number,
        }))
        .await?;

        // Nothing is read from the cache until the next result arrives.
        self.cache.offload()?;

        self.round_number += 1;
        Ok(WorkerState::AwaitingAggregate)
    }

    async fn timed_send(&mut self, upload: Upload) -> Result<()> {
        let start = Instant::now();
        self.endpoint.send(upload).await?;
        self.metrics.send_time += start.elapsed();
        Ok(())
    }
}

