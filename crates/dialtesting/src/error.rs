use std::io::Error as IoError;

use thiserror::Error;

use crate::task::TaskClass;

/// Errors produced while validating, rendering or running a dial-testing task.
#[derive(Debug, Error)]
pub enum DialError {
    /// The task definition is invalid and cannot be scheduled until corrected.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("failed to decode task definition: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to resolve {target}: {reason}")]
    Resolution { target: String, reason: String },

    #[error("socket error: {0}")]
    Socket(#[from] IoError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("script error: {0}")]
    Script(String),

    /// A multi-step task aborted because one of its steps failed.
    #[error("step {index} failed: {source}")]
    Step {
        index: usize,
        #[source]
        source: Box<DialError>,
    },

    #[error("{0} is not supported by {1} tasks")]
    Unsupported(&'static str, TaskClass),
}

impl DialError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        DialError::Configuration(message.into())
    }
}

pub type Result<T, E = DialError> = std::result::Result<T, E>;
