mod fed_avg;
mod shapley;

use std::collections::BTreeMap;

use model::ParameterDict;

use crate::{Evaluator, Result};

pub use fed_avg::FedAvg;
pub use shapley::{MAX_PLAYERS, MultiRoundShapleyValue, ShapleyAggregator, ShapleyState, ShapleyValues};

/// A worker's resolved contribution to a round, diffs already applied.
#[derive(Debug, Clone)]
pub struct WorkerUpdate {
    pub parameter: ParameterDict,
    pub dataset_size: usize,
}

/// The updates of one round keyed by worker id.
///
/// Ordered by id so every aggregation is independent of arrival order.
pub type Updates<'a> = BTreeMap<usize, &'a WorkerUpdate>;

/// What an aggregator may look at besides the updates.
pub struct RoundContext<'a> {
    pub round_number: u64,
    /// The global parameters the workers trained from.
    pub previous: &'a ParameterDict,
    pub evaluator: &'a mut dyn Evaluator,
    /// The metric models are ranked by.
    pub metric_name: &'a str,
}

/// Turns a round's worker updates into the next global parameters.
pub trait Aggregator: Send {
    /// Aggregates `updates`.
    ///
    /// # Arguments
    /// * `ctx` - The round being aggregated.
    /// * `updates` - The updates of every worker that took part.
    ///
    /// # Returns
    /// The new global parameters.
    fn aggregate(&mut self, ctx: &mut RoundContext<'_>, updates: &Updates<'_>) -> Result<ParameterDict>;

    /// The per round worker attributions, if this aggregator computes them.
    fn shapley_values(&self) -> Option<&ShapleyValues> {
        None
    }
}

impl<A: Aggregator + ?Sized> Aggregator for Box<A> {
    fn aggregate(&mut self, ctx: &mut RoundContext<'_>, updates: &Updates<'_>) -> Result<ParameterDict> {
        (**self).aggregate(ctx, updates)
    }

    fn shapley_values(&self) -> Option<&ShapleyValues> {
        (**self).shapley_values()
    }
}
