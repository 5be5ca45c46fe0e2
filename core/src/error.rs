use thiserror::Error;

use crate::chunk::ChunkId;
use crate::task::TaskId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no task exists with this id: {0}")]
    TaskNotFound(TaskId),
    #[error("network error: {0}")]
    Network(String),
    #[error("unsuccessful response status: {status}")]
    HttpStatus { status: u16 },
    #[error("range request not honored (status {status})")]
    RangeNotSatisfied { status: u16 },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("chunk {chunk} file size invalid, expected {expected} but found {found}")]
    ChunkSizeMismatch {
        chunk: ChunkId,
        expected: u64,
        found: u64,
    },
    #[error("interrupted")]
    Interrupted,
    #[error("engine has been released")]
    Released,
}

pub type CoreResult<T> = Result<T, CoreError>;
