//! The messages exchanged between the server and its workers each round.

use std::sync::Arc;

use model::ParameterDict;

/// The parameters carried by a worker update.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A full parameter set.
    Parameter(ParameterDict),
    /// The difference against the last global parameters the worker received.
    ParameterDiff(ParameterDict),
}

impl Payload {
    pub fn parameters(&self) -> &ParameterDict {
        match self {
            Payload::Parameter(p) | Payload::ParameterDiff(p) => p,
        }
    }
}

/// A worker's contribution to one round's aggregation.
#[derive(Debug, Clone)]
pub struct RoundMessage {
    pub payload: Payload,
    pub dataset_size: usize,
    pub round_number: u64,
}

/// Worker to server message, exactly one per worker and round.
#[derive(Debug, Clone)]
pub enum Upload {
    Update(RoundMessage),
    /// The worker didn't take part in this round.
    Skip { round_number: u64 },
}

impl Upload {
    pub fn round_number(&self) -> u64 {
        match self {
            Upload::Update(msg) => msg.round_number,
            Upload::Skip { round_number } => *round_number,
        }
    }
}

/// Server to worker message.
#[derive(Debug, Clone)]
pub enum RoundResult {
    /// The new global parameters and the round the worker should train next.
    Parameter {
        parameter: Arc<ParameterDict>,
        round_number: u64,
    },
    /// The worker was not selected for the next round.
    Skip,
    /// Training is over.
    EndTraining,
}

impl RoundResult {
    pub fn kind(&self) -> &'static str {
        match self {
            RoundResult::Parameter { .. } => "parameter",
            RoundResult::Skip => "skip",
            RoundResult::EndTraining => "end_training",
        }
    }
}
