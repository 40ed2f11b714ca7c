use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("coordination session expired")]
    SessionExpired,

    #[error("leadership lost")]
    LeadershipLost,

    #[error("watch stream closed for {0}")]
    WatchClosed(String),
}

impl Error {
    /// Anything other than a missing node means the coordination service can
    /// no longer be trusted as the source of truth.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::NoNode(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
