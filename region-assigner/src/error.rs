use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Coordination(#[from] region_coordination::Error),

    #[error("no region servers available to host {0}")]
    NoServersAvailable(String),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("malformed transition node {0}: {1}")]
    MalformedTransition(String, serde_json::Error),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("master aborted: {0}")]
    Aborted(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Coordination(e.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Catalog(e.to_string())
    }
}

/// Lets a master run as the work of a leader term; anything that stops
/// the master ends the term.
impl From<Error> for region_coordination::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Coordination(e) => e,
            other => region_coordination::Error::InvalidState(other.to_string()),
        }
    }
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::Coordination(region_coordination::Error::InvalidState(msg.into()))
    }

    /// Errors that mean this master can no longer trust its view of the
    /// cluster and must abort.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Coordination(e) => e.is_fatal(),
            Error::Aborted(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
