use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

/// The result type used across the model crate.
pub type Result<T> = std::result::Result<T, ModelErr>;

/// Failures of parameter arithmetic and snapshot caching.
#[derive(Debug)]
pub enum ModelErr {
    KeyMismatch {
        name: String,
    },
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    Empty,
    ZeroWeight,
    MissingRound {
        round: u64,
    },
    Io(io::Error),
    Serde(serde_json::Error),
}

impl Display for ModelErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelErr::KeyMismatch { name } => {
                write!(f, "parameter `{name}` is not present in both parameter sets")
            }
            ModelErr::ShapeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for parameter `{name}`: got {got:?}, expected {expected:?}"
            ),
            ModelErr::Empty => f.write_str("no parameter sets were given"),
            ModelErr::ZeroWeight => f.write_str("the weights of the parameter sets sum to zero"),
            ModelErr::MissingRound { round } => {
                write!(f, "no cached parameters for round {round}")
            }
            ModelErr::Io(e) => write!(f, "io error: {e}"),
            ModelErr::Serde(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl Error for ModelErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ModelErr::Io(e) => Some(e),
            ModelErr::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ModelErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ModelErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}
