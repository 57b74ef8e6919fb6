use std::collections::BTreeSet;

use rand::{SeedableRng, rngs::StdRng, seq::index};

/// Picks the workers addressed in each round.
#[derive(Debug)]
pub struct ClientSelector {
    worker_num: usize,
    client_number: Option<usize>,
    rng: StdRng,
}

impl ClientSelector {
    /// Creates a new `ClientSelector`.
    ///
    /// # Arguments
    /// * `worker_num` - The amount of workers in the federation.
    /// * `client_number` - How many workers to pick each round, all of them if `None`.
    /// * `seed` - Seeds the selection, taken from entropy if `None`.
    pub fn new(worker_num: usize, client_number: Option<usize>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            worker_num,
            client_number,
            rng,
        }
    }

    /// Every worker, every round.
    pub fn all(worker_num: usize) -> Self {
        Self::new(worker_num, None, Some(0))
    }

    pub fn select(&mut self) -> BTreeSet<usize> {
        match self.client_number {
            Some(amount) if amount < self.worker_num => {
                index::sample(&mut self.rng, self.worker_num, amount)
                    .into_iter()
                    .collect()
            }
            _ => (0..self.worker_num).collect(),
        }
    }
}
