use std::{fs::File, io::BufReader, num::NonZeroUsize, path::Path, path::PathBuf};

use parameter_server::aggregation::MAX_PLAYERS;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// The federated algorithm to run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    FedAvg,
    /// FedAvg over dropout masked diffs.
    FedDropoutAvg,
    /// FedAvg wrapped with multi round Shapley value attribution.
    MultiRoundShapley,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmKwargs {
    pub dropout_rate: Option<f64>,
    /// Workers picked at random every round, every worker if unset.
    pub random_client_number: Option<usize>,
    pub choose_best_subset: bool,
    /// The amount of final rounds sent without dropout.
    pub second_phase_epoch: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Snapshots kept in memory per role, unbounded if unset.
    pub capacity: Option<NonZeroUsize>,
    /// Where snapshots over capacity are offloaded, evicted if unset.
    pub save_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub worker_number: usize,
    pub round: u64,
    #[serde(default)]
    pub distribute_init_parameters: bool,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub algorithm_kwargs: AlgorithmKwargs,
    /// The amount of execution units.
    #[serde(default = "default_parallel_number")]
    pub parallel_number: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: NonZeroUsize,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_metric_name")]
    pub metric_name: String,
    #[serde(default = "default_min_open_files")]
    pub min_open_files: u64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_parallel_number() -> usize {
    1
}

fn default_channel_capacity() -> NonZeroUsize {
    NonZeroUsize::MIN.saturating_add(15)
}

fn default_metric_name() -> String {
    "accuracy".into()
}

fn default_min_open_files() -> u64 {
    1024
}

impl TrainingConfig {
    /// Creates a new `TrainingConfig` with every optional setting at its default.
    pub fn new(worker_number: usize, round: u64) -> Self {
        Self {
            worker_number,
            round,
            distribute_init_parameters: false,
            algorithm: Algorithm::default(),
            algorithm_kwargs: AlgorithmKwargs::default(),
            parallel_number: default_parallel_number(),
            channel_capacity: default_channel_capacity(),
            cache: CacheConfig::default(),
            metric_name: default_metric_name(),
            min_open_files: default_min_open_files(),
            seed: None,
        }
    }

    /// Reads and validates a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings are consistent with each other.
    ///
    /// # Returns
    /// An `InvalidConfig` error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidConfig(msg));

        if self.worker_number == 0 {
            return invalid("worker_number must be positive".into());
        }

        if self.round == 0 {
            return invalid("round must be positive".into());
        }

        if self.parallel_number == 0 {
            return invalid("parallel_number must be positive".into());
        }

        let kwargs = &self.algorithm_kwargs;

        if let Some(rate) = kwargs.dropout_rate {
            if !(0.0..1.0).contains(&rate) {
                return invalid(format!("dropout_rate {rate} is outside [0, 1)"));
            }
        }

        if self.algorithm == Algorithm::FedDropoutAvg && kwargs.dropout_rate.is_none() {
            return invalid("fed_dropout_avg needs a dropout_rate".into());
        }

        if let Some(amount) = kwargs.random_client_number {
            if amount == 0 || amount > self.worker_number {
                return invalid(format!(
                    "random_client_number {amount} must be in 1..={}",
                    self.worker_number
                ));
            }
        }

        if self.algorithm == Algorithm::MultiRoundShapley && self.worker_number > MAX_PLAYERS {
            return invalid(format!(
                "multi_round_shapley supports up to {MAX_PLAYERS} workers, got {}",
                self.worker_number
            ));
        }

        if self.metric_name.is_empty() {
            return invalid("metric_name must not be empty".into());
        }

        Ok(())
    }

    /// The first round whose diffs are sent without dropout, if any.
    pub fn dense_from_round(&self) -> Option<u64> {
        match self.algorithm_kwargs.second_phase_epoch {
            0 => None,
            epochs => Some(self.round.saturating_sub(epochs) + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: TrainingConfig = serde_json::from_str(r#"{"worker_number": 3, "round": 5}"#).unwrap();

        assert_eq!(config, TrainingConfig::new(3, 5));
        assert_eq!(config.channel_capacity.get(), 16);
        assert_eq!(config.metric_name, "accuracy");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_json() {
        let raw = r#"{
            "worker_number": 4,
            "round": 10,
            "distribute_init_parameters": true,
            "algorithm": "fed_dropout_avg",
            "algorithm_kwargs": {"dropout_rate": 0.3, "second_phase_epoch": 2},
            "parallel_number": 2,
            "cache": {"capacity": 2, "save_dir": "/tmp/cache"},
            "seed": 7
        }"#;

        let config: TrainingConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.algorithm, Algorithm::FedDropoutAvg);
        assert_eq!(config.algorithm_kwargs.dropout_rate, Some(0.3));
        assert_eq!(config.cache.capacity, NonZeroUsize::new(2));
        assert_eq!(config.dense_from_round(), Some(9));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_settings() {
        let cases = [
            TrainingConfig::new(0, 1),
            TrainingConfig::new(1, 0),
            TrainingConfig {
                parallel_number: 0,
                ..TrainingConfig::new(2, 1)
            },
            TrainingConfig {
                algorithm: Algorithm::FedDropoutAvg,
                ..TrainingConfig::new(2, 1)
            },
            TrainingConfig {
                algorithm_kwargs: AlgorithmKwargs {
                    dropout_rate: Some(1.0),
                    ..Default::default()
                },
                ..TrainingConfig::new(2, 1)
            },
            TrainingConfig {
                algorithm_kwargs: AlgorithmKwargs {
                    random_client_number: Some(3),
                    ..Default::default()
                },
                ..TrainingConfig::new(2, 1)
            },
            TrainingConfig {
                algorithm: Algorithm::MultiRoundShapley,
                ..TrainingConfig::new(MAX_PLAYERS + 1, 1)
            },
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(OrchestratorError::InvalidConfig(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn test_second_phase_longer_than_training() {
        let config = TrainingConfig {
            algorithm_kwargs: AlgorithmKwargs {
                second_phase_epoch: 8,
                ..Default::default()
            },
            ..TrainingConfig::new(2, 3)
        };

        assert_eq!(config.dense_from_round(), Some(1));
    }
}
