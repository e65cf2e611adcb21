//! Errors returned by the node facade.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("node already started")]
    AlreadyStarted,
    #[error("node is not started")]
    NotStarted,
    #[error("node is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, NodeError>;
