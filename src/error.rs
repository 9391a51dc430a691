//! Error taxonomy for machine setup and execution.
//!
//! Step bodies report failures with `anyhow` and the engine wraps them in
//! [`Error::StepExecution`]. Everything that can go wrong before the first
//! step runs has its own variant so callers can tell the phases apart.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot decode model assertion: {reason}")]
    Decode { reason: String },

    #[error("assertion is not a model assertion (type '{kind}')")]
    Type { kind: String },

    #[error("{0}")]
    Validation(String),

    #[error("cannot resume: {0}")]
    ResumeMismatch(String),

    #[error("step '{step}' failed: {source:#}")]
    StepExecution {
        step: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Phase a failure belongs to, for exit reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Input,
    Decode,
    Validation,
    Resume,
    StepExecution,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Input => write!(f, "input"),
            Phase::Decode => write!(f, "decode"),
            Phase::Validation => write!(f, "validation"),
            Phase::Resume => write!(f, "resume"),
            Phase::StepExecution => write!(f, "step execution"),
        }
    }
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        Error::Decode {
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn resume_mismatch(msg: impl Into<String>) -> Self {
        Error::ResumeMismatch(msg.into())
    }

    pub fn phase(&self) -> Phase {
        match self {
            Error::Io { .. } => Phase::Input,
            Error::Decode { .. } | Error::Type { .. } => Phase::Decode,
            Error::Validation(_) => Phase::Validation,
            Error::ResumeMismatch(_) => Phase::Resume,
            Error::StepExecution { .. } => Phase::StepExecution,
        }
    }

    /// Name of the failed step, for step execution failures.
    pub fn step(&self) -> Option<&str> {
        match self {
            Error::StepExecution { step, .. } => Some(step),
            _ => None,
        }
    }
}
