use std::error::Error;

use model::{Metrics, ParameterDict};

use crate::{Result, ServerErr};

/// The error type an evaluator may fail with.
pub type EvalError = Box<dyn Error + Send + Sync>;

/// Scores global parameter sets on held-out data.
pub trait Evaluator: Send {
    /// Evaluates `parameters`.
    ///
    /// # Returns
    /// A metric dictionary, e.g. `{"accuracy": 0.91, "loss": 0.3}`.
    fn evaluate(&mut self, parameters: &ParameterDict) -> std::result::Result<Metrics, EvalError>;

    /// The initial global parameters.
    fn parameter_dict(&self) -> ParameterDict;
}

/// Evaluates `parameters` and extracts the metric called `name`.
pub(crate) fn metric_of(
    evaluator: &mut dyn Evaluator,
    parameters: &ParameterDict,
    name: &str,
) -> Result<f64> {
    let metrics = evaluator.evaluate(parameters).map_err(ServerErr::Evaluator)?;

    metrics
        .get(name)
        .copied()
        .ok_or_else(|| ServerErr::MissingMetric { name: name.into() })
}
