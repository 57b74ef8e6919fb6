mod training;

pub use training::{Algorithm, AlgorithmKwargs, CacheConfig, TrainingConfig};
