pub mod algorithms;
pub mod configs;
pub mod error;
mod pool;
mod practitioner;
pub mod resources;
mod result;
mod task;
mod unit;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use comms::{ClientEndpoint, ServerEndpoint, Topology};
use log::{debug, info};
use model::ModelCache;
use parameter_server::ServerBuilder;
use worker::{Worker, WorkerBuilder};

pub use configs::{Algorithm, AlgorithmKwargs, CacheConfig, TrainingConfig};
pub use error::{OrchestratorError, Result, RoleError};
pub use pool::{ProcessPool, ThreadPool, UnitJob, UnitOutcome};
pub use practitioner::{EvaluatorFactory, Practitioner};
pub use result::{ParticipantStats, TrainingResult, remap_worker_ids};
pub use task::{Task, TaskId, TaskStore};
pub use unit::{ExecutionUnit, UnitReport, worker_map};

/// Runs federated training tasks over a set of registered practitioners.
pub struct Orchestrator {
    practitioners: BTreeMap<u64, Arc<dyn Practitioner>>,
    evaluators: Box<dyn EvaluatorFactory>,
    tasks: TaskStore,
}

impl Orchestrator {
    /// Creates a new `Orchestrator`.
    ///
    /// # Arguments
    /// * `evaluators` - Builds the server side evaluator of every task.
    pub fn new<E: EvaluatorFactory + 'static>(evaluators: E) -> Self {
        Self {
            practitioners: BTreeMap::new(),
            evaluators: Box::new(evaluators),
            tasks: TaskStore::new(),
        }
    }

    /// Registers a practitioner, replacing any previous one with the same id.
    pub fn add_practitioner<P: Practitioner + 'static>(&mut self, practitioner: P) {
        self.practitioners.insert(practitioner.id(), Arc::new(practitioner));
    }

    pub fn practitioner_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.practitioners.keys().copied()
    }

    /// The amount of started tasks whose result wasn't retrieved yet.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Starts a training task.
    ///
    /// # Arguments
    /// * `config` - The task's settings.
    /// * `non_blocking` - Whether to return as soon as every execution unit started.
    /// * `practitioner_ids` - Who takes part, the first `worker_number` registered ones if unset.
    ///
    /// # Returns
    /// The task's id if `non_blocking`, nothing once training is over otherwise.
    pub fn train(
        &self,
        config: TrainingConfig,
        non_blocking: bool,
        practitioner_ids: Option<&BTreeSet<u64>>,
    ) -> Result<Option<TaskId>> {
        if !non_blocking {
            self.train_blocking(config, practitioner_ids)?;
            return Ok(None);
        }

        let task = self.start(config, practitioner_ids)?;
        let id = self.tasks.insert(task);
        info!("task {id} registered");

        Ok(Some(id))
    }

    /// Runs a training task to completion.
    ///
    /// # Returns
    /// The merged result of every execution unit.
    pub fn train_blocking(
        &self,
        config: TrainingConfig,
        practitioner_ids: Option<&BTreeSet<u64>>,
    ) -> Result<TrainingResult> {
        let task = self.start(config, practitioner_ids)?;
        task.pool.wait(None);

        let result = result::merge(task.pool.stop(), &task.practitioner_ids)?;
        info!(
            "task {} finished after {} {:?} rounds: {:?}",
            task.id, task.config.round, task.config.algorithm, result.metrics
        );

        Ok(result)
    }

    /// Polls a task started in non-blocking mode.
    ///
    /// A task's result can be retrieved once, the task is forgotten afterwards.
    ///
    /// # Arguments
    /// * `task_id` - The id `train` returned.
    /// * `timeout` - How long to wait for the task, forever if unset.
    ///
    /// # Returns
    /// `None` if the task is still running once `timeout` elapsed.
    pub fn get_training_result(&self, task_id: TaskId, timeout: Option<Duration>) -> Result<Option<TrainingResult>> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(OrchestratorError::UnknownTask(task_id))?;

        if !task.pool.wait(timeout) {
            debug!("task {task_id} still running");
            return Ok(None);
        }

        let task = self
            .tasks
            .remove(&task_id)
            .ok_or(OrchestratorError::UnknownTask(task_id))?;

        let result = result::merge(task.pool.stop(), &task.practitioner_ids)?;
        info!(
            "task {task_id} retrieved after {} {:?} rounds: {:?}",
            task.config.round, task.config.algorithm, result.metrics
        );

        Ok(Some(result))
    }

    /// The practitioners of a task in ascending id order, one per worker.
    fn resolve_practitioners(
        &self,
        config: &TrainingConfig,
        practitioner_ids: Option<&BTreeSet<u64>>,
    ) -> Result<Vec<Arc<dyn Practitioner>>> {
        let ids: Vec<u64> = match practitioner_ids {
            Some(ids) => ids.iter().copied().collect(),
            None => self.practitioners.keys().copied().take(config.worker_number).collect(),
        };

        if ids.len() != config.worker_number {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{} practitioners for {} workers",
                ids.len(),
                config.worker_number
            )));
        }

        ids.into_iter()
            .map(|id| {
                self.practitioners
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| OrchestratorError::InvalidConfig(format!("unknown practitioner {id}")))
            })
            .collect()
    }

    /// Builds every role of a task and schedules its execution units.
    fn start(&self, config: TrainingConfig, practitioner_ids: Option<&BTreeSet<u64>>) -> Result<Task> {
        config.validate()?;
        resources::check_open_files(config.min_open_files)?;

        let practitioners = self.resolve_practitioners(&config, practitioner_ids)?;
        let id = TaskId::new();

        let topology = Arc::new(Topology::new(config.worker_number, config.channel_capacity));
        let device_lock = comms::device_lock();

        let mut workers = Vec::with_capacity(practitioners.len());
        for (worker_id, practitioner) in practitioners.iter().enumerate() {
            let endpoint = ClientEndpoint::new(Arc::clone(&topology), worker_id)?;
            let save_dir = config
                .cache
                .save_dir
                .as_ref()
                .map(|dir| dir.join(id.to_string()).join(format!("worker_{worker_id}")));

            let mut builder = WorkerBuilder::new(endpoint, practitioner.create_trainer())
                .cache(ModelCache::new(config.cache.capacity, save_dir))
                .device_lock(Arc::clone(&device_lock))
                .distribute_init_parameters(config.distribute_init_parameters);

            if let Some(sparsifier) = algorithms::sparsifier(&config, worker_id)? {
                builder = builder.sparsifier(sparsifier);
            }

            workers.push(builder.build());
        }

        let server = ServerBuilder::new(
            ServerEndpoint::new(Arc::clone(&topology)),
            self.evaluators.create_evaluator(),
            config.round,
        )
        .aggregator(algorithms::aggregator(&config))
        .selector(algorithms::selector(&config))
        .device_lock(device_lock)
        .distribute_init_parameters(config.distribute_init_parameters)
        .metric_name(config.metric_name.clone())
        .build();

        let pool: Box<dyn ProcessPool> = Box::new(ThreadPool::new());
        spawn_units(pool.as_ref(), &config, &topology, server, workers)?;

        Ok(Task {
            id,
            pool,
            practitioner_ids: practitioners.iter().map(|p| p.id()).collect(),
            config,
        })
    }
}

/// Schedules one execution unit per chunk of `worker_map`, the server goes to unit 0.
///
/// If a unit can't be started the topology is aborted and every started unit joined.
fn spawn_units(
    pool: &dyn ProcessPool,
    config: &TrainingConfig,
    topology: &Arc<Topology>,
    server: parameter_server::Server,
    workers: Vec<Worker>,
) -> Result<()> {
    let mut server = Some(server);
    let mut workers = workers.into_iter();

    for (unit, range) in worker_map(config.worker_number, config.parallel_number)
        .into_iter()
        .enumerate()
    {
        let execution_unit = ExecutionUnit::new(
            unit,
            server.take(),
            workers.by_ref().take(range.len()).collect(),
            Arc::clone(topology),
        );

        if let Err(e) = pool.exec(unit, Box::new(move || execution_unit.run())) {
            topology.abort();
            pool.stop();
            return Err(e);
        }
    }

    Ok(())
}
