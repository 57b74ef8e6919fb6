mod cache;
mod error;
mod parameter;

use std::collections::BTreeMap;

pub use cache::ModelCache;
pub use error::{ModelErr, Result};
pub use parameter::{ParameterDict, Tensor};

/// Named evaluation or training metrics, e.g. `"accuracy" -> 0.93`.
pub type Metrics = BTreeMap<String, f64>;
