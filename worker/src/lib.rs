pub mod builder;
pub mod error;
mod metrics;
mod sparsifier;
mod trainer;
pub mod worker;

pub use builder::WorkerBuilder;
pub use error::{Result, WorkerErr};
pub use metrics::WorkerMetrics;
pub use sparsifier::{Dropout, Sparsifier};
pub use trainer::{Trainer, TrainerError};
pub use worker::{Worker, WorkerState};
