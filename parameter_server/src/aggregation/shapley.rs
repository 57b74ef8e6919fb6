use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use model::ParameterDict;

use super::{Aggregator, RoundContext, Updates};
use crate::{Result, ServerErr, evaluator::metric_of};

/// The most workers an exact per round estimate is computed for.
pub const MAX_PLAYERS: usize = 16;

/// `{round → {worker id → shapley value}}`.
pub type ShapleyValues = BTreeMap<u64, BTreeMap<usize, f64>>;

/// Everything the estimator has computed so far, it only ever grows.
#[derive(Debug, Default, Clone)]
pub struct ShapleyState {
    pub shapley_values: ShapleyValues,
    /// `{round → {subset → metric(subset) - metric of the previous round}}`.
    pub subset_values: BTreeMap<u64, BTreeMap<BTreeSet<usize>, f64>>,
    /// The best scoring subset of each round, possibly empty.
    pub best_subsets: BTreeMap<u64, BTreeSet<usize>>,
}

/// Multi round Shapley value estimator.
///
/// Every round is a separate cooperative game whose value function is the
/// metric gain of a subset's aggregate over the previous round's model. The
/// round values are exact, so the cost is `2^n` evaluations for `n`
/// contributing workers.
#[derive(Debug, Clone)]
pub struct MultiRoundShapleyValue {
    worker_number: usize,
    last_round_metric: f64,
    state: ShapleyState,
}

impl MultiRoundShapleyValue {
    /// Creates a new `MultiRoundShapleyValue`.
    ///
    /// # Arguments
    /// * `worker_number` - The amount of workers in the federation.
    /// * `last_round_metric` - The metric of the initial global model.
    pub fn new(worker_number: usize, last_round_metric: f64) -> Self {
        Self {
            worker_number,
            last_round_metric,
            state: ShapleyState::default(),
        }
    }

    pub fn state(&self) -> &ShapleyState {
        &self.state
    }

    pub fn last_round_metric(&self) -> f64 {
        self.last_round_metric
    }

    /// Computes the Shapley values of `round`.
    ///
    /// # Arguments
    /// * `round` - The round being attributed.
    /// * `players` - The workers that contributed an update, in ascending order.
    /// * `metric` - Scores the aggregate of a non-empty subset of `players`.
    ///
    /// # Returns
    /// The best scoring subset, or an error if there are too many players or
    /// `metric` fails.
    pub fn compute<F>(&mut self, round: u64, players: &[usize], mut metric: F) -> Result<BTreeSet<usize>>
    where
        F: FnMut(&BTreeSet<usize>) -> Result<f64>,
    {
        let n = players.len();
        if n > MAX_PLAYERS {
            return Err(ServerErr::TooManyWorkers {
                players: n,
                max: MAX_PLAYERS,
            });
        }

        let subset_count = 1usize << n;
        let mut values = vec![0.0; subset_count];
        let mut table = BTreeMap::from([(BTreeSet::new(), 0.0)]);

        for mask in 1..subset_count {
            let subset: BTreeSet<usize> = players
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1usize << i) != 0)
                .map(|(_, id)| *id)
                .collect();

            let value = metric(&subset)? - self.last_round_metric;
            values[mask] = value;
            table.insert(subset, value);
        }

        let weights: Vec<f64> = (0..n)
            .map(|size| factorial(size) * factorial(n - size - 1) / factorial(n))
            .collect();

        let mut round_values: BTreeMap<usize, f64> = (0..self.worker_number).map(|id| (id, 0.0)).collect();

        for (i, player) in players.iter().enumerate() {
            let bit = 1usize << i;
            let value: f64 = (0..subset_count)
                .filter(|mask| mask & bit == 0)
                .map(|mask| weights[mask.count_ones() as usize] * (values[mask | bit] - values[mask]))
                .sum();

            round_values.insert(*player, value);
        }

        let best = best_subset(&table);
        debug!(round = round; "shapley values: {round_values:?}");

        self.state.shapley_values.insert(round, round_values);
        self.state.subset_values.insert(round, table);
        self.state.best_subsets.insert(round, best.clone());

        Ok(best)
    }

    /// Closes `round`, the metric of `used` becomes the baseline of the next round.
    pub fn finish_round(&mut self, round: u64, used: &BTreeSet<usize>) {
        let gain = self
            .state
            .subset_values
            .get(&round)
            .and_then(|table| table.get(used))
            .copied();

        if let Some(gain) = gain {
            self.last_round_metric += gain;
        }
    }
}

/// The argmax of `table`, ties go to the larger subset, then to the smaller
/// one in lexicographic order.
fn best_subset(table: &BTreeMap<BTreeSet<usize>, f64>) -> BTreeSet<usize> {
    let mut best: Option<(&BTreeSet<usize>, f64)> = None;

    for (subset, value) in table {
        let better = match best {
            None => true,
            Some((current, current_value)) => {
                *value > current_value || (*value == current_value && subset.len() > current.len())
            }
        };

        if better {
            best = Some((subset, *value));
        }
    }

    best.map(|(subset, _)| subset.clone()).unwrap_or_default()
}

fn factorial(n: usize) -> f64 {
    (1..=n).map(|x| x as f64).product()
}

/// Wraps an aggregator with multi round Shapley value attribution and,
/// optionally, best subset selection.
pub struct ShapleyAggregator<A> {
    base: A,
    worker_number: usize,
    choose_best_subset: bool,
    estimator: Option<MultiRoundShapleyValue>,
}

impl<A: Aggregator> ShapleyAggregator<A> {
    /// Creates a new `ShapleyAggregator`.
    ///
    /// # Arguments
    /// * `base` - Aggregates every evaluated subset and the final one.
    /// * `worker_number` - The amount of workers in the federation.
    /// * `choose_best_subset` - Whether each round only aggregates its best subset.
    pub fn new(base: A, worker_number: usize, choose_best_subset: bool) -> Self {
        Self {
            base,
            worker_number,
            choose_best_subset,
            estimator: None,
        }
    }
}

impl<A: Aggregator> Aggregator for ShapleyAggregator<A> {
    fn aggregate(&mut self, ctx: &mut RoundContext<'_>, updates: &Updates<'_>) -> Result<ParameterDict> {
        let round = ctx.round_number;

        let estimator = match self.estimator.take() {
            Some(estimator) => estimator,
            None => {
                let initial = metric_of(ctx.evaluator, ctx.previous, ctx.metric_name)?;
                MultiRoundShapleyValue::new(self.worker_number, initial)
            }
        };
        let estimator = self.estimator.insert(estimator);

        let players: Vec<usize> = updates.keys().copied().collect();
        let base = &mut self.base;

        let best = estimator.compute(round, &players, |subset| {
            let selected = select(updates, subset, round)?;
            let aggregated = base.aggregate(ctx, &selected)?;
            metric_of(ctx.evaluator, &aggregated, ctx.metric_name)
        })?;

        let used: BTreeSet<usize> = if self.choose_best_subset && !best.is_empty() {
            warn!(round = round; "use subset {best:?}");
            best
        } else {
            players.iter().copied().collect()
        };

        estimator.finish_round(round, &used);

        let selected = select(updates, &used, round)?;
        self.base.aggregate(ctx, &selected)
    }

    fn shapley_values(&self) -> Option<&ShapleyValues> {
        self.estimator
            .as_ref()
            .map(|estimator| &estimator.state().shapley_values)
    }
}

/// The updates of `subset`, every member must have contributed.
fn select<'a>(updates: &Updates<'a>, subset: &BTreeSet<usize>, round: u64) -> Result<Updates<'a>> {
    let selected: Updates<'a> = updates
        .iter()
        .filter(|(id, _)| subset.contains(*id))
        .map(|(id, update)| (*id, *update))
        .collect();

    if selected.is_empty() || selected.len() != subset.len() {
        return Err(ServerErr::AggregationInputMissing {
            round,
            subset: subset.clone(),
        });
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use model::{Metrics, Tensor};

    use super::*;
    use crate::{
        Evaluator, FedAvg,
        aggregation::{RoundContext, WorkerUpdate},
        evaluator::EvalError,
    };

    /// Scores a scalar parameter by its negated distance to `target`.
    struct DistanceEvaluator {
        target: f32,
    }

    impl Evaluator for DistanceEvaluator {
        fn evaluate(&mut self, parameters: &ParameterDict) -> std::result::Result<Metrics, EvalError> {
            let w = parameters.get("w").ok_or("missing w")?.sum();
            Ok(Metrics::from([("accuracy".to_string(), -f64::from((w - self.target).abs()))]))
        }

        fn parameter_dict(&self) -> ParameterDict {
            scalar(0.0)
        }
    }

    fn scalar(value: f32) -> ParameterDict {
        let mut params = ParameterDict::new();
        params.insert("w", Tensor::from_elem(vec![1], value));
        params
    }

    fn additive(contributions: &[f64]) -> impl FnMut(&BTreeSet<usize>) -> Result<f64> + '_ {
        |subset| Ok(subset.iter().map(|id| contributions[*id]).sum())
    }

    #[test]
    fn test_additive_game_values_equal_contributions() {
        let mut estimator = MultiRoundShapleyValue::new(3, 0.0);
        estimator
            .compute(1, &[0, 1, 2], additive(&[0.1, 0.2, 0.3]))
            .unwrap();

        let values = &estimator.state().shapley_values[&1];
        for (id, expected) in [0.1, 0.2, 0.3].into_iter().enumerate() {
            assert!((values[&id] - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_values_sum_to_full_set_gain() {
        let mut estimator = MultiRoundShapleyValue::new(3, 0.5);
        let metric = |subset: &BTreeSet<usize>| Ok(0.5 + (subset.len() as f64).sqrt() / 10.0);

        estimator.compute(1, &[0, 1, 2], metric).unwrap();

        let total: f64 = estimator.state().shapley_values[&1].values().sum();
        assert!((total - 3f64.sqrt() / 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_absent_workers_get_zero() {
        let mut estimator = MultiRoundShapleyValue::new(4, 0.0);
        estimator.compute(2, &[1, 3], additive(&[9.0, 1.0, 9.0, 2.0])).unwrap();

        let values = &estimator.state().shapley_values[&2];
        assert_eq!(values.len(), 4);
        assert_eq!(values[&0], 0.0);
        assert_eq!(values[&2], 0.0);
        assert!((values[&3] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_best_subset_ties_prefer_larger_subsets() {
        let mut estimator = MultiRoundShapleyValue::new(3, 0.0);
        let best = estimator
            .compute(1, &[0, 1, 2], additive(&[1.0, 0.0, -1.0]))
            .unwrap();

        assert_eq!(best, BTreeSet::from([0, 1]));
        assert_eq!(estimator.state().best_subsets[&1], best);
        assert_eq!(estimator.state().subset_values[&1].len(), 8);
    }

    #[test]
    fn test_empty_best_subset_when_every_subset_loses() {
        let mut estimator = MultiRoundShapleyValue::new(2, 1.0);
        let best = estimator.compute(1, &[0, 1], |_| Ok(0.5)).unwrap();

        assert!(best.is_empty());
    }

    #[test]
    fn test_finish_round_moves_the_baseline() {
        let mut estimator = MultiRoundShapleyValue::new(2, 0.25);
        estimator.compute(1, &[0, 1], additive(&[0.5, 0.25])).unwrap();

        estimator.finish_round(1, &BTreeSet::from([0]));
        assert!((estimator.last_round_metric() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_too_many_players() {
        let mut estimator = MultiRoundShapleyValue::new(MAX_PLAYERS + 1, 0.0);
        let players: Vec<usize> = (0..=MAX_PLAYERS).collect();

        assert!(matches!(
            estimator.compute(1, &players, |_| Ok(0.0)),
            Err(ServerErr::TooManyWorkers { .. })
        ));
    }

    #[test]
    fn test_metric_errors_propagate() {
        let mut estimator = MultiRoundShapleyValue::new(2, 0.0);
        let res = estimator.compute(4, &[0, 1], |subset| {
            Err(ServerErr::AggregationInputMissing {
                round: 4,
                subset: subset.clone(),
            })
        });

        assert!(matches!(res, Err(ServerErr::AggregationInputMissing { round: 4, .. })));
        assert!(estimator.state().shapley_values.is_empty());
    }

    #[test]
    fn test_aggregator_records_the_best_subset() {
        let updates: BTreeMap<usize, WorkerUpdate> = [1.0, 1.0, -10.0]
            .into_iter()
            .enumerate()
            .map(|(id, value)| {
                let update = WorkerUpdate {
                    parameter: scalar(value),
                    dataset_size: 1,
                };
                (id, update)
            })
            .collect();
        let updates: Updates = updates.iter().map(|(id, update)| (*id, update)).collect();

        let previous = scalar(0.0);
        let mut evaluator = DistanceEvaluator { target: 1.0 };
        let mut ctx = RoundContext {
            round_number: 1,
            previous: &previous,
            evaluator: &mut evaluator,
            metric_name: "accuracy",
        };

        let mut aggregator = ShapleyAggregator::new(FedAvg, 3, true);
        let aggregated = aggregator.aggregate(&mut ctx, &updates).unwrap();
        assert!((aggregated.get("w").unwrap().sum() - 1.0).abs() < 1e-6);

        let estimator = aggregator.estimator.as_ref().unwrap();
        let best = BTreeSet::from([0, 1]);
        assert_eq!(estimator.state().best_subsets[&1], best);
        assert_eq!(estimator.state().subset_values[&1][&best], 1.0);
        assert!(estimator.state().subset_values[&1][&BTreeSet::from([0, 1, 2])] < 0.0);
        assert_eq!(estimator.last_round_metric(), 0.0);
        assert!(aggregator.shapley_values().is_some());
    }
}
