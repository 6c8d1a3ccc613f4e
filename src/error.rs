use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlotdError {
    #[error("cannot run a server with zero slots")]
    ZeroSlots,

    #[error("invalid server directory {path}: {reason}")]
    ServerDir { path: PathBuf, reason: String },

    #[error("no port file in server directory (is the daemon running?)")]
    NoPort,

    #[error("job has an empty argument vector")]
    EmptyArgv,

    #[error("job requests {requested} slots but the server only has {total}")]
    TooManySlots { requested: u32, total: u32 },

    #[error("server is draining and no longer accepts jobs")]
    Draining,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SlotdError>;
