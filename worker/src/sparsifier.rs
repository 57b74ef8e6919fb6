use model::ParameterDict;
use rand::{Rng, SeedableRng, distr::Bernoulli, rngs::StdRng};

use crate::{Result, WorkerErr};

/// Reduces the amount of elements a worker transmits.
pub trait Sparsifier: Send {
    /// Sparsifies a parameter diff in place before it is sent for `round`.
    fn sparsify(&mut self, round: u64, diff: &mut ParameterDict);
}

/// Zeroes every element of the diff independently with probability `rate`.
///
/// Rounds from `dense_from_round` on are sent unmasked.
#[derive(Debug)]
pub struct Dropout {
    rate: f64,
    mask: Bernoulli,
    dense_from_round: Option<u64>,
    rng: StdRng,
}

impl Dropout {
    /// Creates a new `Dropout` sparsifier.
    ///
    /// # Arguments
    /// * `rate` - The probability of dropping each element, in `[0, 1)`.
    /// * `seed` - Seeds the mask generator, taken from entropy if `None`.
    ///
    /// # Returns
    /// An `InvalidDropoutRate` error if `rate` is out of range.
    pub fn new(rate: f64, seed: Option<u64>) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(WorkerErr::InvalidDropoutRate(rate));
        }

        let mask = Bernoulli::new(rate).map_err(|_| WorkerErr::InvalidDropoutRate(rate))?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Self {
            rate,
            mask,
            dense_from_round: None,
            rng,
        })
    }

    /// Disables masking starting at `round`.
    pub fn dense_from(mut self, round: u64) -> Self {
        self.dense_from_round = Some(round);
        self
    }

    fn is_dense(&self, round: u64) -> bool {
        self.dense_from_round.is_some_and(|from| round >= from)
    }
}

impl Sparsifier for Dropout {
    fn sparsify(&mut self, round: u64, diff: &mut ParameterDict) {
        if self.rate == 0.0 || self.is_dense(round) {
            return;
        }

        let Self { mask, rng, .. } = self;
        for (_, tensor) in diff.iter_mut() {
            tensor.mapv_inplace(|x| if rng.sample(*mask) { 0.0 } else { x });
        }
    }
}
