pub mod aggregation;
mod builder;
mod error;
mod evaluator;
mod selection;
pub mod server;

pub use aggregation::{Aggregator, FedAvg, ShapleyAggregator};
pub use builder::ServerBuilder;
pub use error::{Result, ServerErr};
pub use evaluator::{EvalError, Evaluator};
pub use selection::ClientSelector;
pub use server::{Server, ServerConfig, ServerReport, ServerState};
