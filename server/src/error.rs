//! Error types for the server crate

use crate::id_pool::PoolError;
use shared::CodecError;
use thiserror::Error;

/// Errors that stop the server loop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("id pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure of a correlated wait on a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for packet")]
    Timeout,

    #[error("connection went away while waiting")]
    Cancelled,
}

pub type ServerResult<T> = Result<T, ServerError>;
