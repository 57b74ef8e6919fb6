use std::{error::Error, fmt};

/// The comms module's result type.
pub type Result<T> = std::result::Result<T, CommsErr>;

/// Failures raised by the topology and its endpoints.
#[derive(Debug)]
pub enum CommsErr {
    /// The channel can no longer carry messages.
    Transport {
        worker_id: usize,
        detail: &'static str,
    },
    /// One side broke the round protocol, e.g. closed while its peer waits for data.
    ProtocolViolation { worker_id: usize, detail: String },
    UnknownWorker {
        worker_id: usize,
        worker_num: usize,
    },
    /// Another role of the same task failed and tore the topology down.
    Aborted,
}

impl fmt::Display for CommsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommsErr::Transport { worker_id, detail } => {
                write!(f, "transport error on channel of worker {worker_id}: {detail}")
            }
            CommsErr::ProtocolViolation { worker_id, detail } => {
                write!(f, "protocol violation on channel of worker {worker_id}: {detail}")
            }
            CommsErr::UnknownWorker {
                worker_id,
                worker_num,
            } => write!(
                f,
                "unknown worker {worker_id}, the topology only has {worker_num} workers"
            ),
            CommsErr::Aborted => f.write_str("the topology was aborted"),
        }
    }
}

impl Error for CommsErr {}
