//! Core error kinds (spec.md §7) and the library-wide `Result` alias.

use thiserror::Error;

use crate::worker::WorkerId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("worker {worker} failed to initialize: {reason}")]
    Init { worker: WorkerId, reason: String },

    #[error("transient io error: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout waiting on {0}")]
    Timeout(String),

    #[error("programming error: {0}")]
    Programming(String),

    #[error("worker {0} not found")]
    UnknownWorker(WorkerId),
}

pub type Result<T> = std::result::Result<T, Error>;
