use std::{error::Error, fmt, io};

use comms::CommsErr;
use parameter_server::ServerErr;
use worker::WorkerErr;

use crate::TaskId;

/// The orchestrator module's result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Why a role hosted by an execution unit failed.
#[derive(Debug)]
pub enum RoleError {
    Worker { worker_id: usize, source: WorkerErr },
    Server(ServerErr),
    /// The unit couldn't build its runtime.
    Runtime(io::Error),
}

impl RoleError {
    /// Whether the role only failed because another role tore the topology down.
    pub fn is_aborted(&self) -> bool {
        matches!(
            self,
            RoleError::Worker {
                source: WorkerErr::Comms(CommsErr::Aborted),
                ..
            } | RoleError::Server(ServerErr::Comms(CommsErr::Aborted))
        )
    }
}

impl fmt::Display for RoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleError::Worker { worker_id, source } => write!(f, "worker {worker_id} failed: {source}"),
            RoleError::Server(e) => write!(f, "server failed: {e}"),
            RoleError::Runtime(e) => write!(f, "cannot build the unit runtime: {e}"),
        }
    }
}

impl Error for RoleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RoleError::Worker { source, .. } => Some(source),
            RoleError::Server(e) => Some(e),
            RoleError::Runtime(e) => Some(e),
        }
    }
}

/// All errors that can occur in the orchestrator.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Invalid configuration, caught before anything is started.
    InvalidConfig(String),
    /// The host can't open enough files for one channel pair per worker.
    ResourceExhaustion { limit: u64, required: u64 },
    UnknownTask(TaskId),
    /// The topology refused to hand out an endpoint.
    Comms(CommsErr),
    /// A role of an execution unit failed.
    UnitFailed { unit: usize, source: RoleError },
    UnitPanicked { unit: usize },
    Io(io::Error),
    Serde(serde_json::Error),
}

impl OrchestratorError {
    fn is_aborted(&self) -> bool {
        matches!(self, Self::UnitFailed { source, .. } if source.is_aborted())
    }

    /// Picks the error that explains a failed task best.
    ///
    /// Roles that failed because the topology was aborted are only reported
    /// when no role failed on its own.
    pub(crate) fn root_cause<I>(errors: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        let mut fallback = None;

        for err in errors {
            if !err.is_aborted() {
                return Some(err);
            }

            fallback.get_or_insert(err);
        }

        fallback
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::ResourceExhaustion { limit, required } => write!(
                f,
                "the open file limit is {limit}, more than {required} are required"
            ),
            Self::UnknownTask(id) => write!(f, "unknown task {id}"),
            Self::Comms(e) => write!(f, "comms error: {e}"),
            Self::UnitFailed { unit, source } => write!(f, "execution unit {unit}: {source}"),
            Self::UnitPanicked { unit } => write!(f, "execution unit {unit} panicked"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Serde(e) => write!(f, "serde error: {e}"),
        }
    }
}

impl Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UnitFailed { source, .. } => Some(source),
            Self::Comms(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommsErr> for OrchestratorError {
    fn from(e: CommsErr) -> Self {
        Self::Comms(e)
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}
