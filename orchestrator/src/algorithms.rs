use parameter_server::{Aggregator, ClientSelector, FedAvg, ShapleyAggregator};
use worker::{Dropout, Sparsifier};

use crate::{
    configs::{Algorithm, TrainingConfig},
    error::{OrchestratorError, Result},
};

/// The sparsifier worker `worker_id` applies to its diffs, if any.
///
/// Every worker draws its masks from its own stream, derived from the task's seed.
pub fn sparsifier(config: &TrainingConfig, worker_id: usize) -> Result<Option<Box<dyn Sparsifier>>> {
    if config.algorithm != Algorithm::FedDropoutAvg {
        return Ok(None);
    }

    let Some(rate) = config.algorithm_kwargs.dropout_rate else {
        return Err(OrchestratorError::InvalidConfig(
            "fed_dropout_avg needs a dropout_rate".into(),
        ));
    };

    let seed = config.seed.map(|seed| seed.wrapping_add(worker_id as u64));
    let mut dropout = Dropout::new(rate, seed).map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;

    if let Some(round) = config.dense_from_round() {
        dropout = dropout.dense_from(round);
    }

    Ok(Some(Box::new(dropout)))
}

/// The server side aggregation strategy of `config.algorithm`.
pub fn aggregator(config: &TrainingConfig) -> Box<dyn Aggregator> {
    match config.algorithm {
        Algorithm::FedAvg | Algorithm::FedDropoutAvg => Box::new(FedAvg::new()),
        Algorithm::MultiRoundShapley => Box::new(ShapleyAggregator::new(
            FedAvg::new(),
            config.worker_number,
            config.algorithm_kwargs.choose_best_subset,
        )),
    }
}

/// Which workers the server addresses every round.
pub fn selector(config: &TrainingConfig) -> ClientSelector {
    ClientSelector::new(
        config.worker_number,
        config.algorithm_kwargs.random_client_number,
        config.seed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::AlgorithmKwargs;

    #[test]
    fn test_only_dropout_algorithm_sparsifies() {
        let mut config = TrainingConfig::new(2, 3);
        assert!(sparsifier(&config, 0).unwrap().is_none());

        config.algorithm = Algorithm::FedDropoutAvg;
        config.algorithm_kwargs = AlgorithmKwargs {
            dropout_rate: Some(0.5),
            ..Default::default()
        };
        assert!(sparsifier(&config, 1).unwrap().is_some());
    }

    #[test]
    fn test_dropout_without_rate_is_invalid() {
        let config = TrainingConfig {
            algorithm: Algorithm::FedDropoutAvg,
            ..TrainingConfig::new(2, 3)
        };

        assert!(matches!(
            sparsifier(&config, 0),
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_shapley_aggregator_reports_values() {
        let config = TrainingConfig {
            algorithm: Algorithm::MultiRoundShapley,
            ..TrainingConfig::new(2, 3)
        };

        // Nothing is aggregated yet, only the strategy kind matters.
        assert!(aggregator(&config).shapley_values().is_none());
        assert!(aggregator(&TrainingConfig::new(2, 3)).shapley_values().is_none());
    }
}
