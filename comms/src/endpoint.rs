use std::{collections::BTreeSet, sync::Arc};

use crate::{
    CommsErr, Result, Topology,
    msg::{RoundResult, Upload},
};

/// The server's view of the topology, it can address any worker.
#[derive(Clone)]
pub struct ServerEndpoint {
    topology: Arc<Topology>,
}

impl ServerEndpoint {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }

    pub fn worker_num(&self) -> usize {
        self.topology.worker_num()
    }

    pub fn has_data(&self, worker_id: usize) -> bool {
        self.topology.worker_has_data(worker_id)
    }

    pub async fn get(&self, worker_id: usize) -> Result<Upload> {
        self.topology.get_from_worker(worker_id).await
    }

    pub async fn send(&self, data: RoundResult, worker_id: usize) -> Result<()> {
        self.topology.send_to_worker(data, worker_id).await
    }

    /// Sends `data` to each addressed worker, one send at a time.
    ///
    /// # Arguments
    /// * `data` - The message to fan out.
    /// * `worker_ids` - The addressed workers, every worker if `None`. Ids
    ///   outside the topology are ignored.
    pub async fn broadcast(&self, data: RoundResult, worker_ids: Option<&BTreeSet<usize>>) -> Result<()> {
        let worker_num = self.worker_num();

        let addressed: Vec<usize> = match worker_ids {
            Some(ids) => ids.iter().copied().filter(|id| *id < worker_num).collect(),
            None => (0..worker_num).collect(),
        };

        for worker_id in addressed {
            self.send(data.clone(), worker_id).await?;
        }

        Ok(())
    }

    /// Waits for every worker to close, see `Topology::wait_close`.
    pub async fn wait_close(&self) -> Result<usize> {
        self.topology.wait_close().await
    }

    /// Tears down the whole topology after a fatal error.
    pub fn abort(&self) {
        self.topology.abort();
    }
}

/// A single worker's view of the topology, it can only address the server.
pub struct ClientEndpoint {
    topology: Arc<Topology>,
    worker_id: usize,
}

impl ClientEndpoint {
    /// Creates a new `ClientEndpoint`.
    ///
    /// # Returns
    /// An `UnknownWorker` error if `worker_id` is outside the topology.
    pub fn new(topology: Arc<Topology>, worker_id: usize) -> Result<Self> {
        let worker_num = topology.worker_num();
        if worker_id >= worker_num {
            return Err(CommsErr::UnknownWorker {
                worker_id,
                worker_num,
            });
        }

        Ok(Self {
            topology,
            worker_id,
        })
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub async fn get(&self) -> Result<RoundResult> {
        self.topology.get_from_server(self.worker_id).await
    }

    pub fn has_data(&self) -> bool {
        self.topology.server_has_data(self.worker_id)
    }

    pub async fn send(&self, data: Upload) -> Result<()> {
        self.topology.send_to_server(self.worker_id, data).await
    }

    pub fn close(&self) -> Result<()> {
        self.topology.close(self.worker_id)
    }

    pub fn abort(&self) {
        self.topology.abort();
    }
}
