use std::{
    collections::BTreeSet,
    error::Error,
    fmt::{self, Display},
};

use comms::CommsErr;
use model::ModelErr;

use crate::EvalError;

/// The server module's result type.
pub type Result<T> = std::result::Result<T, ServerErr>;

/// Server runtime failures.
#[derive(Debug)]
pub enum ServerErr {
    Comms(CommsErr),
    Model(ModelErr),
    /// A subset that had to be evaluated has no contributing worker.
    AggregationInputMissing {
        round: u64,
        subset: BTreeSet<usize>,
    },
    /// Every worker skipped the round.
    NoUpdates {
        round: u64,
    },
    Evaluator(EvalError),
    /// A worker sent a message that belongs to another round.
    RoundMismatch {
        worker_id: usize,
        expected: u64,
        got: u64,
    },
    /// The evaluator didn't report the metric the server ranks models by.
    MissingMetric {
        name: String,
    },
    TooManyWorkers {
        players: usize,
        max: usize,
    },
}

impl Display for ServerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerErr::Comms(e) => write!(f, "comms error: {e}"),
            ServerErr::Model(e) => write!(f, "model error: {e}"),
            ServerErr::AggregationInputMissing { round, subset } => {
                write!(f, "no update to aggregate for subset {subset:?} in round {round}")
            }
            ServerErr::NoUpdates { round } => write!(f, "every worker skipped round {round}"),
            ServerErr::Evaluator(e) => write!(f, "evaluator error: {e}"),
            ServerErr::RoundMismatch {
                worker_id,
                expected,
                got,
            } => write!(
                f,
                "worker {worker_id} sent a message for round {got}, expected round {expected}"
            ),
            ServerErr::MissingMetric { name } => {
                write!(f, "the evaluator didn't report metric {name}")
            }
            ServerErr::TooManyWorkers { players, max } => write!(
                f,
                "cannot compute exact shapley values for {players} workers, at most {max} are supported"
            ),
        }
    }
}

impl Error for ServerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerErr::Comms(e) => Some(e),
            ServerErr::Model(e) => Some(e),
            ServerErr::Evaluator(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<CommsErr> for ServerErr {
    fn from(value: CommsErr) -> Self {
        Self::Comms(value)
    }
}

impl From<ModelErr> for ServerErr {
    fn from(value: ModelErr) -> Self {
        Self::Model(value)
    }
}
