use thiserror::Error;

use crate::model::export::InvalidConfig;
use crate::model::status::{TransitionError, UnknownStatus};

/// Failures surfaced by queue and post operations.
///
/// Publisher failures never show up here; they are part of a successful deployment result.
#[derive(Debug, Error)]
pub enum Error {
    #[error("queue {0} not found")]
    QueueNotFound(i64),

    #[error("post {0} not found")]
    PostNotFound(i64),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<InvalidConfig> for Error {
    fn from(e: InvalidConfig) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<UnknownStatus> for Error {
    fn from(e: UnknownStatus) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<TransitionError> for Error {
    fn from(e: TransitionError) -> Self {
        Self::Validation(format!("illegal status change: {e}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
