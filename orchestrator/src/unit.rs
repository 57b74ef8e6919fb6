use std::{ops::Range, sync::Arc};

use comms::Topology;
use futures::future::{self, LocalBoxFuture};
use log::debug;
use parameter_server::{Server, ServerReport};
use tokio::runtime;
use worker::{Worker, WorkerMetrics};

use crate::error::RoleError;

/// What one execution unit hands back once every role it hosted finished.
#[derive(Debug, Default)]
pub struct UnitReport {
    pub unit: usize,
    pub server: Option<ServerReport>,
    pub workers: Vec<(usize, WorkerMetrics)>,
}

enum RoleReport {
    Server(ServerReport),
    Worker(usize, WorkerMetrics),
}

/// The roles assigned to one execution unit.
pub struct ExecutionUnit {
    unit: usize,
    server: Option<Server>,
    workers: Vec<Worker>,
    topology: Arc<Topology>,
}

impl ExecutionUnit {
    pub fn new(unit: usize, server: Option<Server>, workers: Vec<Worker>, topology: Arc<Topology>) -> Self {
        Self {
            unit,
            server,
            workers,
            topology,
        }
    }

    /// Runs every role concurrently on a single threaded runtime until all
    /// of them finished.
    ///
    /// The first failing role aborts the topology so roles of other units
    /// don't wait forever.
    ///
    /// # Returns
    /// The unit's report, or the first error that wasn't caused by the abort.
    pub fn run(self) -> Result<UnitReport, RoleError> {
        let Self {
            unit,
            server,
            workers,
            topology,
        } = self;

        debug!(unit = unit, workers = workers.len(), server = server.is_some(); "running execution unit");

        let runtime = runtime::Builder::new_current_thread()
            .build()
            .map_err(RoleError::Runtime)?;

        let mut roles: Vec<LocalBoxFuture<'_, Result<RoleReport, RoleError>>> = Vec::new();

        if let Some(server) = server {
            roles.push(Box::pin(async move {
                server.run().await.map(RoleReport::Server).map_err(RoleError::Server)
            }));
        }

        for worker in workers {
            let worker_id = worker.worker_id();
            roles.push(Box::pin(async move {
                worker
                    .run()
                    .await
                    .map(|metrics| RoleReport::Worker(worker_id, metrics))
                    .map_err(|source| RoleError::Worker { worker_id, source })
            }));
        }

        let roles = roles.into_iter().map(|role| {
            let topology = Arc::clone(&topology);
            async move {
                let res = role.await;
                if res.is_err() {
                    topology.abort();
                }
                res
            }
        });

        let results = runtime.block_on(future::join_all(roles));

        let mut report = UnitReport {
            unit,
            ..Default::default()
        };
        let mut errors = Vec::new();

        for res in results {
            match res {
                Ok(RoleReport::Server(server)) => report.server = Some(server),
                Ok(RoleReport::Worker(worker_id, metrics)) => report.workers.push((worker_id, metrics)),
                Err(e) => errors.push(e),
            }
        }

        let root = errors
            .iter()
            .position(|e| !e.is_aborted())
            .unwrap_or_default();

        if !errors.is_empty() {
            return Err(errors.swap_remove(root));
        }

        Ok(report)
    }
}

/// Splits `worker_number` workers over at most `parallel_number` units in
/// contiguous, near equal chunks. Earlier units get the extra workers.
pub fn worker_map(worker_number: usize, parallel_number: usize) -> Vec<Range<usize>> {
    let units = parallel_number.clamp(1, worker_number.max(1));
    let (chunk, extra) = (worker_number / units, worker_number % units);

    let mut start = 0;
    (0..units)
        .map(|unit| {
            let len = chunk + usize::from(unit < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}
