use std::error::Error;

use model::{Metrics, ParameterDict};

/// The error type a local trainer may fail with.
pub type TrainerError = Box<dyn Error + Send + Sync>;

/// The local training capability of a participant.
///
/// The worker never looks inside the model, it only moves parameter sets in
/// and out of it and asks it to train.
pub trait Trainer: Send {
    /// Runs one round's worth of local training.
    ///
    /// # Returns
    /// The updated parameters and the metrics measured while training.
    fn train_one_round(&mut self) -> Result<(ParameterDict, Metrics), TrainerError>;

    fn parameter_dict(&self) -> ParameterDict;

    /// Replaces the model's parameters, e.g. with the latest global ones.
    fn set_parameter_dict(&mut self, parameters: ParameterDict);

    /// The amount of local samples, used to weight this worker's update.
    fn dataset_size(&self) -> usize;
}
