//! Crate-wide error type.
//!
//! Mirrors the error taxonomy of the consensus design: transport failures
//! drive a channel toward `Disconnected`, protocol failures abandon a
//! channel outright, stale-term replies cause the caller to step down, and
//! disk errors are fatal for the local node rather than silently ignored.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stale term: responder is at term {current_term}")]
    StaleTerm { current_term: u64 },

    #[error("not the leader")]
    WrongLeader,

    #[error("key not found")]
    NoKey,

    #[error("disk error: {0}")]
    Disk(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
