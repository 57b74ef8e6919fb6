use std::{error::Error, fmt};

use comms::CommsErr;
use model::ModelErr;

use crate::TrainerError;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Comms(CommsErr),
    Model(ModelErr),
    /// The local trainer failed, the error is passed through untouched.
    Trainer(TrainerError),
    InvalidDropoutRate(f64),
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Comms(e) => write!(f, "comms error: {e}"),
            WorkerErr::Model(e) => write!(f, "model error: {e}"),
            WorkerErr::Trainer(e) => write!(f, "trainer error: {e}"),
            WorkerErr::InvalidDropoutRate(rate) => {
                write!(f, "invalid dropout rate {rate}, expected a value in [0, 1)")
            }
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Comms(e) => Some(e),
            WorkerErr::Model(e) => Some(e),
            WorkerErr::Trainer(e) => Some(e.as_ref()),
            WorkerErr::InvalidDropoutRate(_) => None,
        }
    }
}

impl From<CommsErr> for WorkerErr {
    fn from(value: CommsErr) -> Self {
        Self::Comms(value)
    }
}

impl From<ModelErr> for WorkerErr {
    fn from(value: ModelErr) -> Self {
        Self::Model(value)
    }
}
