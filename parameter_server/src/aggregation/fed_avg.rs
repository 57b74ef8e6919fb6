use model::ParameterDict;

use super::{Aggregator, RoundContext, Updates};
use crate::{Result, ServerErr};

/// Dataset size weighted averaging.
#[derive(Debug, Default, Clone, Copy)]
pub struct FedAvg;

impl FedAvg {
    pub fn new() -> Self {
        Self
    }
}

impl Aggregator for FedAvg {
    fn aggregate(&mut self, ctx: &mut RoundContext<'_>, updates: &Updates<'_>) -> Result<ParameterDict> {
        if updates.is_empty() {
            return Err(ServerErr::NoUpdates {
                round: ctx.round_number,
            });
        }

        let weighted = updates
            .values()
            .map(|update| (update.dataset_size as f64, &update.parameter));

        Ok(ParameterDict::weighted_mean(weighted)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use model::{Metrics, ModelErr, Tensor};

    use super::*;
    use crate::{EvalError, Evaluator, aggregation::WorkerUpdate};

    struct NoEval;

    impl Evaluator for NoEval {
        fn evaluate(&mut self, _: &ParameterDict) -> std::result::Result<Metrics, EvalError> {
            Ok(Metrics::new())
        }

        fn parameter_dict(&self) -> ParameterDict {
            ParameterDict::new()
        }
    }

    fn update(values: &[f32], dataset_size: usize) -> WorkerUpdate {
        let mut parameter = ParameterDict::new();
        parameter.insert("w", Tensor::from_shape_vec(vec![values.len()], values.to_vec()).unwrap());
        WorkerUpdate {
            parameter,
            dataset_size,
        }
    }

    fn aggregate(updates: &BTreeMap<usize, WorkerUpdate>) -> Result<ParameterDict> {
        let previous = ParameterDict::new();
        let mut evaluator = NoEval;
        let mut ctx = RoundContext {
            round_number: 3,
            previous: &previous,
            evaluator: &mut evaluator,
            metric_name: "accuracy",
        };

        let updates: Updates = updates.iter().map(|(id, u)| (*id, u)).collect();
        FedAvg.aggregate(&mut ctx, &updates)
    }

    #[test]
    fn test_weighted_by_dataset_size() {
        let updates = BTreeMap::from([
            (0, update(&[1.0, 2.0], 1)),
            (1, update(&[4.0, 8.0], 3)),
        ]);

        let aggregated = aggregate(&updates).unwrap();

        let expected = update(&[3.25, 6.5], 0).parameter;
        assert!(aggregated.approx_eq(&expected, 1e-6));
    }

    #[test]
    fn test_no_updates() {
        let updates = BTreeMap::new();
        assert!(matches!(aggregate(&updates), Err(ServerErr::NoUpdates { round: 3 })));
    }

    #[test]
    fn test_zero_sized_datasets() {
        let updates = BTreeMap::from([(0, update(&[1.0], 0)), (2, update(&[2.0], 0))]);
        assert!(matches!(
            aggregate(&updates),
            Err(ServerErr::Model(ModelErr::ZeroWeight))
        ));
    }
}
